//! Scripted mock transports for driver tests.
//!
//! These implement the transport traits without hardware. Tests script the
//! replies a device would send, run the driver, then inspect the exact
//! frames the driver wrote. Both mocks provide:
//! - Call logging for test verification
//! - Controllable one-shot failure injection
//! - Optional simulated latency

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::adapters::{ByteTransport, ScpiTransport};
use crate::error::{BenchError, Result};

/// Scripted [`ByteTransport`].
///
/// Replies are consumed in FIFO order, one per `read_until` call; an empty
/// queue behaves like a silent device and times out.
pub struct ScriptedByteTransport {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    should_fail_next: AtomicBool,
    latency: Duration,
}

impl ScriptedByteTransport {
    /// Empty transport with no scripted replies.
    pub fn new() -> Self {
        Self {
            writes: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            should_fail_next: AtomicBool::new(false),
            latency: Duration::ZERO,
        }
    }

    /// Add simulated per-operation latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue the raw bytes the next `read_until` returns.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.replies.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue a reply given as text.
    pub fn push_reply_str(&self, text: &str) {
        self.push_reply(text.as_bytes());
    }

    /// Fail the next operation, then reset.
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every frame written so far, lossily decoded for assertions.
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|w| String::from_utf8_lossy(w).to_string())
            .collect()
    }

    /// Raw written frames.
    pub fn raw_writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Drop the recorded writes.
    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    fn take_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }
}

impl Default for ScriptedByteTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ByteTransport for ScriptedByteTransport {
    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if self.take_failure() {
            return Err(BenchError::Instrument("mock write failure".into()));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn read_until(&self, _suffix: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if self.take_failure() {
            return Err(BenchError::Instrument("mock read failure".into()));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => Ok(reply),
            None => Err(BenchError::Timeout(timeout)),
        }
    }
}

/// Scripted [`ScpiTransport`] with separate text and binary reply queues.
pub struct ScriptedScpi {
    commands: Arc<Mutex<Vec<String>>>,
    replies: Arc<Mutex<VecDeque<String>>>,
    binary_replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    should_fail_next: AtomicBool,
}

impl ScriptedScpi {
    /// Empty transport with no scripted replies.
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            binary_replies: Arc::new(Mutex::new(VecDeque::new())),
            should_fail_next: AtomicBool::new(false),
        }
    }

    /// Queue the reply for the next `query`.
    pub fn push_reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(text.to_string());
    }

    /// Queue the reply for the next `query_binary`.
    pub fn push_binary_reply(&self, bytes: &[u8]) {
        self.binary_replies.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Fail the next operation, then reset.
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every command sent so far, queries included.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    fn log(&self, command: &str) {
        self.commands.lock().unwrap().push(command.to_string());
    }
}

impl Default for ScriptedScpi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScpiTransport for ScriptedScpi {
    async fn write(&self, command: &str) -> Result<()> {
        if self.take_failure() {
            return Err(BenchError::Instrument("mock write failure".into()));
        }
        self.log(command);
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        if self.take_failure() {
            return Err(BenchError::Instrument("mock query failure".into()));
        }
        self.log(command);
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => Ok(reply),
            None => Err(BenchError::Timeout(Duration::from_secs(25))),
        }
    }

    async fn query_binary(&self, command: &str) -> Result<Vec<u8>> {
        if self.take_failure() {
            return Err(BenchError::Instrument("mock query failure".into()));
        }
        self.log(command);
        match self.binary_replies.lock().unwrap().pop_front() {
            Some(reply) => Ok(reply),
            None => Err(BenchError::Timeout(Duration::from_secs(25))),
        }
    }
}
