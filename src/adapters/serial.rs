//! Serial transport for RS-232/USB-serial instruments.
//!
//! Wraps the `serialport` crate and provides async I/O by running the
//! synchronous serial operations on Tokio's blocking executor. The port is
//! opened with a short internal timeout; per-call deadlines are enforced by
//! the read loop so each driver can pick its own patience (10 ms polls for
//! the microcontroller, seconds for the power source).

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serialport::SerialPort;
use tokio::sync::Mutex;

use crate::adapters::ByteTransport;
use crate::error::{BenchError, Result};

/// Internal port timeout; the read loop polls at this granularity.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Cap for [`ByteTransport::drain`] so a chattering device cannot wedge us.
const DRAIN_LIMIT: usize = 4096;

/// Byte transport over a `serialport` handle.
pub struct SerialTransport {
    port_name: String,
    /// The port behind `Arc<Mutex>` so blocking tasks can share it.
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate`, 8N1, no flow control.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open_with_poll(port_name, baud_rate, POLL_TIMEOUT)
    }

    /// Open with an explicit poll granularity for chatty low-latency links.
    pub fn open_with_poll(port_name: &str, baud_rate: u32, poll: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(poll)
            .open()
            .map_err(|e| {
                BenchError::Instrument(format!(
                    "failed to open serial port '{port_name}' at {baud_rate} baud: {e}"
                ))
            })?;
        debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);
        Ok(SerialTransport {
            port_name: port_name.to_string(),
            port: Arc::new(Mutex::new(port)),
        })
    }

    /// The configured port path.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait]
impl ByteTransport for SerialTransport {
    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let port = self.port.clone();
        let payload = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = port.blocking_lock();
            guard.write_all(&payload)?;
            guard.flush()?;
            debug!(
                "Sent {} bytes: {:?}",
                payload.len(),
                String::from_utf8_lossy(&payload).trim()
            );
            Ok(())
        })
        .await
        .map_err(|e| BenchError::Instrument(format!("serial I/O task panicked: {e}")))?
    }

    async fn read_until(&self, suffix: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port.clone();
        let suffix = suffix.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut guard = port.blocking_lock();
            let mut response: Vec<u8> = Vec::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(BenchError::Timeout(timeout));
                }

                match guard.read(&mut buffer) {
                    Ok(1) => {
                        response.push(buffer[0]);
                        if response.ends_with(&suffix) {
                            debug!(
                                "Received {} bytes: {:?}",
                                response.len(),
                                String::from_utf8_lossy(&response).trim()
                            );
                            return Ok(response);
                        }
                    }
                    Ok(0) => {
                        // EOF - shouldn't happen with serial ports
                        return Err(BenchError::Framing(
                            "unexpected EOF from serial port".into(),
                        ));
                    }
                    Ok(n) => {
                        return Err(BenchError::Framing(format!(
                            "single-byte read returned {n} bytes"
                        )));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than the overall deadline
                        continue;
                    }
                    Err(e) => return Err(BenchError::Io(e)),
                }
            }
        })
        .await
        .map_err(|e| BenchError::Instrument(format!("serial I/O task panicked: {e}")))?
    }

    async fn drain(&self) -> Result<()> {
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = port.blocking_lock();
            let mut buffer = [0u8; 64];
            let mut discarded = 0usize;
            loop {
                match guard.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        discarded += n;
                        if discarded >= DRAIN_LIMIT {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                    Err(e) => return Err(BenchError::Io(e)),
                }
            }
            if discarded > 0 {
                debug!("Drained {} stale bytes", discarded);
            }
            Ok(())
        })
        .await
        .map_err(|e| BenchError::Instrument(format!("serial I/O task panicked: {e}")))?
    }
}
