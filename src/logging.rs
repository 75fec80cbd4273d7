//! Log initialization for the bench binary.
//!
//! The engine and the sweeps emit `tracing` events; the instrument drivers
//! log through the `log` facade. Both get a backend here: a compact
//! `tracing-subscriber` fmt layer and an `env_logger` sink. `RUST_LOG`
//! takes precedence, otherwise the level passed by the CLI is applied
//! crate-wide. Initialization is idempotent so tests and embedding hosts
//! can call it freely.

use env_logger::Env;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber and the `log` backend.
///
/// `level` is the fallback filter when `RUST_LOG` is unset. Returns an error
/// string for unknown level names; an already-installed subscriber is not an
/// error.
pub fn init(level: &str) -> Result<(), String> {
    let level = parse_level(level)?;
    let fallback = level.to_string().to_lowercase();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback));

    // The fmt subscriber only sees `tracing` events; records from the
    // driver modules arrive on the `log` facade.
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(fallback.as_str()))
        .format_timestamp_millis()
        .try_init();

    let result = fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .try_init();

    match result {
        Ok(()) => Ok(()),
        // Tests and embedding hosts may have installed a subscriber already.
        Err(_) => Ok(()),
    }
}

fn parse_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!(
            "invalid log level '{other}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert!(matches!(parse_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_level("DEBUG"), Ok(Level::DEBUG)));
        assert!(matches!(parse_level("Warn"), Ok(Level::WARN)));
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn init_is_idempotent() {
        assert!(init("info").is_ok());
        assert!(init("debug").is_ok());
    }
}
