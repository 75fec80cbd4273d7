//! Transport seams between instrument drivers and the outside world.
//!
//! Drivers are generic over small async transport traits so the same
//! protocol code runs against real hardware, the scripted mocks in
//! [`mock`], and the simulated bench. Two seams cover every instrument on
//! this bench:
//!
//! - [`ByteTransport`]: raw byte stream with read-until-suffix framing, for
//!   the serial power source (`\rOK\r` tails) and the microcontroller
//!   (newline-terminated lines).
//! - [`ScpiTransport`]: command/query text plus binary-block reads, for the
//!   VISA oscilloscope.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
#[cfg(feature = "instrument_visa")]
pub mod visa;

/// Raw byte-stream transport with suffix-delimited reads.
#[async_trait]
pub trait ByteTransport: Send + Sync {
    /// Write the full buffer.
    async fn write_all(&self, bytes: &[u8]) -> Result<()>;

    /// Read until the accumulated buffer ends with `suffix`, or fail with
    /// [`crate::error::BenchError::Timeout`] when `timeout` elapses first.
    /// The returned buffer includes the suffix.
    async fn read_until(&self, suffix: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    /// Discard any bytes already buffered by the device (boot banners,
    /// stale replies). Default: nothing to discard.
    async fn drain(&self) -> Result<()> {
        Ok(())
    }
}

/// SCPI-style transport: text commands, text queries, binary-block queries.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without reading a reply.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a query and read one newline-terminated reply, trimmed.
    async fn query(&self, command: &str) -> Result<String>;

    /// Send a query and read the raw reply bytes (waveform blocks).
    async fn query_binary(&self, command: &str) -> Result<Vec<u8>>;
}
