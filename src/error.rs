//! Custom error types for the bench engine.
//!
//! This module defines the primary error type, `BenchError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a measurement run
//! can encounter, from transport problems to fit divergence.
//!
//! ## Error Hierarchy
//!
//! `BenchError` consolidates the following sources:
//!
//! - **`TransportAbsent`**: The instrument could not be reached at connect
//!   time. The bench substitutes a null driver and stays usable; this variant
//!   exists so connect code can report *which* address failed.
//! - **`Timeout`**: A transport read or write missed its deadline.
//! - **`Framing`**: The instrument replied, but the bytes did not match the
//!   expected frame (missing `OK` tail, short payload, unparsable digits).
//! - **`Validation`**: A commanded value was outside its legal range. Call
//!   sites normally clamp and warn instead of raising this; it is kept for
//!   inputs that cannot be clamped meaningfully (e.g. malformed settings).
//! - **`OperatorAbort`**: The operator answered a pause handshake with abort.
//!   Treated like a kill request by the sweep engine.
//! - **`Cancelled`**: The kill flag was observed at an iteration boundary.
//! - **`FitFailure`**: The resonance fit did not converge; the affected row
//!   is persisted with empty fit fields.
//! - **`RegulatorNotConverged`**: The field regulator exhausted its budget.
//!   Surfaced as a warning by sweeps, never fatal on its own.
//! - **`Io` / `Data` / `Settings` / `FeatureDisabled`**: Ambient file,
//!   measurement-file, configuration and build-feature failures.
//!
//! By using `#[from]`, `BenchError` can be seamlessly created from underlying
//! error types, keeping `?` ergonomic throughout the crate.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Unified error type for transports, drivers, fits and sweeps.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("instrument '{name}' not reachable at '{address}': {reason}")]
    TransportAbsent {
        /// Human-readable instrument role ("source", "oscilloscope", ...).
        name: String,
        /// The configured address that failed to open.
        address: String,
        /// Underlying open failure.
        reason: String,
    },

    #[error("transport timeout after {0:?}")]
    Timeout(Duration),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("operator aborted the run")]
    OperatorAbort,

    #[error("run cancelled")]
    Cancelled,

    #[error("resonance fit failed: {0}")]
    FitFailure(String),

    #[error("field regulator did not reach the setpoint within {0:?}")]
    RegulatorNotConverged(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data file error: {0}")]
    Data(#[from] csv::Error),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("instrument error: {0}")]
    Instrument(String),

    #[error("feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureDisabled(String),
}

impl BenchError {
    /// True for the two variants that end a sweep without counting as a
    /// hardware or engine fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BenchError::Cancelled | BenchError::OperatorAbort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_variants_are_recognized() {
        assert!(BenchError::Cancelled.is_cancellation());
        assert!(BenchError::OperatorAbort.is_cancellation());
        assert!(!BenchError::Framing("short reply".into()).is_cancellation());
    }

    #[test]
    fn io_errors_convert_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no port");
        let err: BenchError = io.into();
        assert!(matches!(err, BenchError::Io(_)));
        assert!(err.to_string().contains("no port"));
    }

    #[test]
    fn transport_absent_names_the_address() {
        let err = BenchError::TransportAbsent {
            name: "source".into(),
            address: "/dev/ttyUSB0".into(),
            reason: "permission denied".into(),
        };
        let text = err.to_string();
        assert!(text.contains("source"));
        assert!(text.contains("/dev/ttyUSB0"));
    }
}
