//! VISA transport for SCPI instruments.
//!
//! Thin wrapper over `visa-rs`: one resource manager, one session, blocking
//! reads pushed onto Tokio's blocking executor. The oscilloscope needs long
//! deadlines (auto measurements can take tens of seconds), so the per-call
//! timeout is owned by this transport rather than the driver.

use std::ffi::CString;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;
use visa_rs::prelude::*;

use crate::adapters::ScpiTransport;
use crate::error::{BenchError, Result};

/// SCPI transport over a VISA session.
pub struct VisaTransport {
    resource: String,
    instr: Arc<Mutex<Instrument>>,
    timeout: Duration,
}

impl VisaTransport {
    /// Open the VISA resource (e.g. `USB0::0x1AB1::0x0588::...::INSTR`).
    pub fn open(resource: &str, timeout: Duration) -> Result<Self> {
        let rm = DefaultRM::new()
            .map_err(|e| BenchError::Instrument(format!("VISA resource manager: {e}")))?;
        let name = CString::new(resource)
            .map_err(|_| BenchError::Instrument(format!("invalid VISA resource '{resource}'")))?;
        let instr = rm
            .open(&name.into(), AccessMode::NO_LOCK, timeout)
            .map_err(|e| {
                BenchError::Instrument(format!("failed to open VISA resource '{resource}': {e}"))
            })?;
        debug!("VISA resource '{}' opened", resource);
        Ok(VisaTransport {
            resource: resource.to_string(),
            instr: Arc::new(Mutex::new(instr)),
            timeout,
        })
    }

    /// The configured resource string.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Run a blocking VISA operation under the transport deadline. The
    /// blocking task may outlive a timeout; the caller regains control
    /// regardless.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Instrument) -> Result<T> + Send + 'static,
    {
        let instr = self.instr.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = instr.blocking_lock();
            op(&mut guard)
        });
        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined
                .map_err(|e| BenchError::Instrument(format!("VISA task panicked: {e}")))?,
            Err(_) => Err(BenchError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl ScpiTransport for VisaTransport {
    async fn write(&self, command: &str) -> Result<()> {
        let line = format!("{command}\n");
        debug!("VISA write: {}", command);
        self.blocking(move |instr| {
            instr.write_all(line.as_bytes())?;
            Ok(())
        })
        .await
    }

    async fn query(&self, command: &str) -> Result<String> {
        let line = format!("{command}\n");
        debug!("VISA query: {}", command);
        let reply = self
            .blocking(move |instr| {
                instr.write_all(line.as_bytes())?;
                let mut buf = Vec::new();
                let mut reader = BufReader::new(&*instr);
                reader.read_until(b'\n', &mut buf)?;
                Ok(String::from_utf8_lossy(&buf).trim().to_string())
            })
            .await?;
        debug!("VISA reply: {}", reply);
        Ok(reply)
    }

    async fn query_binary(&self, command: &str) -> Result<Vec<u8>> {
        let line = format!("{command}\n");
        debug!("VISA binary query: {}", command);
        self.blocking(move |instr| {
            instr.write_all(line.as_bytes())?;
            let mut data = Vec::new();
            let mut chunk = vec![0u8; 65536];
            let mut reader = BufReader::new(&*instr);
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        data.extend_from_slice(&chunk[..n]);
                        // A short read marks the END indicator of the block.
                        if n < chunk.len() {
                            break;
                        }
                    }
                    Err(e) => return Err(BenchError::Io(e)),
                }
            }
            Ok(data)
        })
        .await
    }
}
