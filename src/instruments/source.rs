//! Manson HCS-family programmable source driver.
//!
//! # Protocol Overview
//!
//! Plain ASCII over serial. Every command is terminated with `\r`; the
//! supply answers with an optional payload followed by `OK\r`, so the last
//! four reply bytes (`\rOK\r`, or all three of a bare `OK\r`) are framing:
//!
//! - `GMAX` → 6 digits; the leading 3 are Vmax ×10, the trailing 3 Imax
//!   ×10. Queried once at init and cached.
//! - `GETD` → 9 digits `VVVVCCCCM`; display voltage /100, display current
//!   /100, mode digit `0` = constant voltage, `1` = constant current.
//! - `VOLTnnn` / `CURRnnn` program a setpoint; `nnn` is the value in
//!   tenths, so the wire resolution is 0.1.
//! - `SOUTn` switches the output relay. The firmware inverts the flag:
//!   `0` switches the output on, `1` off.
//!
//! The supply has no output-state query, so the driver keeps the intended
//! state itself: initialized off, updated only after a `SOUT` write
//! succeeds. [`PowerSource::is_output_on`] reports that intent.
//!
//! The serial firmware drives a single physical output; the
//! [`SourceChannel`] parameter exists for dual-channel setups and is
//! ignored on the wire here (intent is still tracked per channel).

use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::adapters::ByteTransport;
use crate::error::{BenchError, Result};
use crate::instruments::{PowerSource, SourceChannel, SourceLimits, SourceMode, SourceReading};

/// Replies arrive well under a second on a healthy link.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Every reply ends with this acknowledgement.
const REPLY_TAIL: &[u8] = b"OK\r";

/// Reply bytes to strip to get the payload (`\r` separator plus tail).
const TAIL_LEN: usize = 4;

/// Driver for an HCS-family supply behind any [`ByteTransport`].
pub struct HcsSource<T: ByteTransport> {
    transport: T,
    limits: SourceLimits,
    output_intent: Mutex<[bool; 2]>,
}

impl<T: ByteTransport> HcsSource<T> {
    /// Query the hardware limits and cache them.
    pub async fn new(transport: T) -> Result<Self> {
        let payload = transact(&transport, "GMAX").await?;
        let limits = parse_limits(&payload)?;
        info!(
            "Source connected: limits {:.1} V / {:.1} A",
            limits.voltage_max_v, limits.current_max_a
        );
        Ok(HcsSource {
            transport,
            limits,
            output_intent: Mutex::new([false, false]),
        })
    }

    /// Clamp into `[0, limit]`, round to the 0.1 wire resolution, and send
    /// `<verb><nnn>`. Returns the value actually programmed.
    async fn set_scaled(&self, verb: &str, value: f64, limit: f64) -> Result<f64> {
        let clamped = value.clamp(0.0, limit);
        if clamped != value {
            warn!("{verb} setpoint {value} outside [0, {limit}], clamping to {clamped}");
        }
        let rounded = (clamped * 10.0).round() / 10.0;
        let code = (rounded * 10.0).round() as u32;
        transact(&self.transport, &format!("{verb}{code:03}")).await?;
        Ok(rounded)
    }
}

#[async_trait]
impl<T: ByteTransport> PowerSource for HcsSource<T> {
    async fn limits(&self) -> Result<SourceLimits> {
        Ok(self.limits)
    }

    async fn read_values(&self, _channel: SourceChannel) -> Result<SourceReading> {
        let payload = transact(&self.transport, "GETD").await?;
        parse_reading(&payload)
    }

    async fn set_voltage(&self, _channel: SourceChannel, volts: f64) -> Result<f64> {
        self.set_scaled("VOLT", volts, self.limits.voltage_max_v).await
    }

    async fn set_current(&self, _channel: SourceChannel, amps: f64) -> Result<f64> {
        self.set_scaled("CURR", amps, self.limits.current_max_a).await
    }

    async fn output(&self, channel: SourceChannel, on: bool) -> Result<()> {
        // Wire flag is inverted: 0 energizes the output.
        let flag = if on { 0 } else { 1 };
        transact(&self.transport, &format!("SOUT{flag}")).await?;
        self.output_intent.lock().await[intent_slot(channel)] = on;
        Ok(())
    }

    async fn is_output_on(&self, channel: SourceChannel) -> bool {
        self.output_intent.lock().await[intent_slot(channel)]
    }
}

fn intent_slot(channel: SourceChannel) -> usize {
    match channel {
        SourceChannel::Hf => 0,
        SourceChannel::Bias => 1,
    }
}

/// Send one command and return the reply payload with framing stripped.
async fn transact<T: ByteTransport>(transport: &T, command: &str) -> Result<String> {
    transport
        .write_all(format!("{command}\r").as_bytes())
        .await?;
    let reply = transport.read_until(REPLY_TAIL, REPLY_TIMEOUT).await?;
    let payload = &reply[..reply.len().saturating_sub(TAIL_LEN)];
    Ok(String::from_utf8_lossy(payload).into_owned())
}

fn parse_limits(payload: &str) -> Result<SourceLimits> {
    let digits = payload.trim();
    if digits.len() < 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BenchError::Framing(format!(
            "unexpected GMAX payload: {digits:?}"
        )));
    }
    let voltage: f64 = digits[..3]
        .parse::<u32>()
        .map_err(|_| BenchError::Framing(format!("bad GMAX voltage field: {digits:?}")))?
        .into();
    let current: f64 = digits[digits.len() - 3..]
        .parse::<u32>()
        .map_err(|_| BenchError::Framing(format!("bad GMAX current field: {digits:?}")))?
        .into();
    Ok(SourceLimits {
        voltage_max_v: voltage * 0.1,
        current_max_a: current * 0.1,
    })
}

fn parse_reading(payload: &str) -> Result<SourceReading> {
    let digits = payload.trim();
    if digits.len() != 9 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BenchError::Framing(format!(
            "unexpected GETD payload: {digits:?}"
        )));
    }
    let voltage: f64 = digits[..4]
        .parse::<u32>()
        .map_err(|_| BenchError::Framing(format!("bad GETD voltage field: {digits:?}")))?
        .into();
    let current: f64 = digits[4..8]
        .parse::<u32>()
        .map_err(|_| BenchError::Framing(format!("bad GETD current field: {digits:?}")))?
        .into();
    let mode = match &digits[8..9] {
        "0" => SourceMode::ConstantVoltage,
        "1" => SourceMode::ConstantCurrent,
        other => {
            return Err(BenchError::Framing(format!(
                "unexpected GETD mode digit: {other:?}"
            )))
        }
    };
    Ok(SourceReading {
        voltage_v: voltage / 100.0,
        current_a: current / 100.0,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::ScriptedByteTransport;

    async fn source_with_limits(transport: ScriptedByteTransport) -> HcsSource<ScriptedByteTransport> {
        transport.push_reply(b"362700\rOK\r");
        HcsSource::new(transport).await.unwrap()
    }

    #[tokio::test]
    async fn limits_are_queried_once_and_cached() {
        let transport = ScriptedByteTransport::new();
        let source = source_with_limits(transport).await;

        let limits = source.limits().await.unwrap();
        assert!((limits.voltage_max_v - 36.2).abs() < 1e-9);
        assert!((limits.current_max_a - 70.0).abs() < 1e-9);
        assert_eq!(source.transport.writes(), vec!["GMAX\r"]);

        // Second call hits the cache, no extra wire traffic.
        source.limits().await.unwrap();
        assert_eq!(source.transport.writes().len(), 1);
    }

    #[tokio::test]
    async fn readback_splits_voltage_current_and_mode() {
        let transport = ScriptedByteTransport::new();
        let source = source_with_limits(transport).await;

        source.transport.push_reply(b"127000500\rOK\r");
        let reading = source.read_values(SourceChannel::Hf).await.unwrap();
        assert!((reading.voltage_v - 12.70).abs() < 1e-9);
        assert!((reading.current_a - 0.50).abs() < 1e-9);
        assert_eq!(reading.mode, SourceMode::ConstantVoltage);

        source.transport.push_reply(b"005023451\rOK\r");
        let reading = source.read_values(SourceChannel::Hf).await.unwrap();
        assert!((reading.voltage_v - 0.50).abs() < 1e-9);
        assert!((reading.current_a - 23.45).abs() < 1e-9);
        assert_eq!(reading.mode, SourceMode::ConstantCurrent);
    }

    #[tokio::test]
    async fn setpoints_are_clamped_rounded_and_encoded_in_tenths() {
        let transport = ScriptedByteTransport::new();
        let source = source_with_limits(transport).await;

        source.transport.push_reply(b"OK\r");
        let applied = source.set_voltage(SourceChannel::Hf, 12.34).await.unwrap();
        assert!((applied - 12.3).abs() < 1e-9);

        source.transport.push_reply(b"OK\r");
        let applied = source.set_voltage(SourceChannel::Hf, 50.0).await.unwrap();
        assert!((applied - 36.2).abs() < 1e-9);

        source.transport.push_reply(b"OK\r");
        let applied = source.set_voltage(SourceChannel::Hf, -5.0).await.unwrap();
        assert_eq!(applied, 0.0);

        source.transport.push_reply(b"OK\r");
        let applied = source.set_current(SourceChannel::Bias, 1.97).await.unwrap();
        assert!((applied - 2.0).abs() < 1e-9);

        let writes = source.transport.writes();
        assert_eq!(
            &writes[1..],
            &["VOLT123\r", "VOLT362\r", "VOLT000\r", "CURR020\r"]
        );
    }

    #[tokio::test]
    async fn output_flag_is_inverted_on_the_wire() {
        let transport = ScriptedByteTransport::new();
        let source = source_with_limits(transport).await;

        source.transport.push_reply(b"OK\r");
        source.output(SourceChannel::Hf, true).await.unwrap();
        source.transport.push_reply(b"OK\r");
        source.output(SourceChannel::Bias, false).await.unwrap();

        let writes = source.transport.writes();
        assert_eq!(&writes[1..], &["SOUT0\r", "SOUT1\r"]);
    }

    #[tokio::test]
    async fn output_intent_starts_off_and_follows_successful_writes() {
        let transport = ScriptedByteTransport::new();
        let source = source_with_limits(transport).await;

        assert!(!source.is_output_on(SourceChannel::Hf).await);
        assert!(!source.is_output_on(SourceChannel::Bias).await);

        source.transport.push_reply(b"OK\r");
        source.output(SourceChannel::Hf, true).await.unwrap();
        assert!(source.is_output_on(SourceChannel::Hf).await);
        assert!(!source.is_output_on(SourceChannel::Bias).await);

        // A failed write must not flip the remembered state.
        source.transport.trigger_failure();
        assert!(source.output(SourceChannel::Hf, false).await.is_err());
        assert!(source.is_output_on(SourceChannel::Hf).await);
    }

    #[tokio::test]
    async fn malformed_payloads_are_framing_errors() {
        assert!(matches!(parse_limits("12"), Err(BenchError::Framing(_))));
        assert!(matches!(parse_limits("12a456"), Err(BenchError::Framing(_))));
        assert!(matches!(parse_reading("1270005"), Err(BenchError::Framing(_))));
        assert!(matches!(
            parse_reading("127000502"),
            Err(BenchError::Framing(_))
        ));
    }
}
