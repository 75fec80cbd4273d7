//! Rigol DS1000-series oscilloscope driver.
//!
//! # Protocol Overview
//!
//! SCPI over VISA. Commands of interest:
//!
//! - `:WAV:POIN:MODE RAW` selects raw-memory waveform readout (set once at
//!   init).
//! - `:TIM:SCAL?` / `:TIM:OFFS?` report the timebase in s per division and
//!   the horizontal offset in s.
//! - `:CHAN<n>:SCAL?` / `:CHAN<n>:OFFS?` report the vertical scale in V per
//!   division and the vertical offset in V.
//! - `:WAV:DATA? CHAN<n>` returns a binary block: a 10-byte header followed
//!   by one unsigned byte per sample.
//! - `:MEAS:VPP?`, `:MEAS:VMAX?`, `:MEAS:VMIN?`, `:MEAS:FREQ?` are the
//!   scalar measurements.
//! - `:KEY:AUTO` runs front-panel autoscale, `RUN` / `STOP` (no colon)
//!   control acquisition, `:KEY:FORC` returns the scope to local control.
//!
//! Sample bytes encode voltage inverted around the vertical midpoint:
//!
//! ```text
//! v = (255 - byte - 130 - offset / scale * 25) / 25 * scale
//! ```
//!
//! The time axis spans `offset ± 6 * timebase` (half the 12-division
//! screen on each side) and is rescaled to µs, ms or s for display.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use crate::adapters::ScpiTransport;
use crate::error::{BenchError, Result};
use crate::instruments::{MeasureKind, Oscilloscope, TimeUnit, Waveform};

/// Binary waveform replies start with this many header bytes.
const WAVEFORM_HEADER_LEN: usize = 10;

/// Half the horizontal screen width, in divisions.
const HALF_SCREEN_DIVS: f64 = 6.0;

/// Wait after `:KEY:AUTO` while the scope re-ranges.
const AUTO_SCALE_SETTLE: Duration = Duration::from_secs(5);

/// Driver for a DS1000-series scope behind any [`ScpiTransport`].
pub struct RigolScope<T: ScpiTransport> {
    transport: T,
}

impl<T: ScpiTransport> RigolScope<T> {
    /// Identify the instrument and switch waveform readout to raw mode.
    pub async fn new(transport: T) -> Result<Self> {
        let identity = transport.query("*IDN?").await?;
        info!("Oscilloscope connected: {identity}");
        transport.write(":WAV:POIN:MODE RAW").await?;
        Ok(RigolScope { transport })
    }

    async fn query_f64(&self, command: &str) -> Result<f64> {
        let reply = self.transport.query(command).await?;
        reply.parse::<f64>().map_err(|_| {
            BenchError::Framing(format!("scope reply to {command:?} is not a number: {reply:?}"))
        })
    }
}

#[async_trait]
impl<T: ScpiTransport> Oscilloscope for RigolScope<T> {
    async fn get_data(&self, channel: u8) -> Result<Waveform> {
        // Scales can change between captures (autoscale, front panel), so
        // they are read fresh for every decode.
        let timescale = self.query_f64(":TIM:SCAL?").await?;
        let timeoffset = self.query_f64(":TIM:OFFS?").await?;
        let voltscale = self.query_f64(&format!(":CHAN{channel}:SCAL?")).await?;
        let voltoffset = self.query_f64(&format!(":CHAN{channel}:OFFS?")).await?;

        let raw = self
            .transport
            .query_binary(&format!(":WAV:DATA? CHAN{channel}"))
            .await?;
        if raw.len() <= WAVEFORM_HEADER_LEN {
            return Err(BenchError::Framing(format!(
                "waveform block too short: {} bytes",
                raw.len()
            )));
        }
        let samples = &raw[WAVEFORM_HEADER_LEN..];
        debug!("Decoding {} waveform samples from channel {channel}", samples.len());

        let volts: Vec<f64> = samples
            .iter()
            .map(|&byte| {
                (255.0 - f64::from(byte) - 130.0 - voltoffset / voltscale * 25.0) / 25.0
                    * voltscale
            })
            .collect();

        let start = timeoffset - HALF_SCREEN_DIVS * timescale;
        let end = timeoffset + HALF_SCREEN_DIVS * timescale;
        let n = volts.len();
        let mut times: Vec<f64> = (0..n)
            .map(|i| {
                if n > 1 {
                    start + (end - start) * i as f64 / (n - 1) as f64
                } else {
                    start
                }
            })
            .collect();

        // Pick the display unit from the right edge of the axis.
        let time_unit = if end < 1e-3 {
            TimeUnit::Micro
        } else if end < 1.0 {
            TimeUnit::Milli
        } else {
            TimeUnit::Second
        };
        let factor = match time_unit {
            TimeUnit::Micro => 1e6,
            TimeUnit::Milli => 1e3,
            TimeUnit::Second => 1.0,
        };
        for t in &mut times {
            *t *= factor;
        }

        Ok(Waveform {
            times,
            volts,
            time_unit,
        })
    }

    async fn measure(&self, kind: MeasureKind, channel: u8) -> Result<f64> {
        let item = match kind {
            MeasureKind::Vpp => "VPP",
            MeasureKind::Vmax => "VMAX",
            MeasureKind::Vmin => "VMIN",
            MeasureKind::Frequency => "FREQ",
        };
        self.query_f64(&format!(":MEAS:{item}? CHAN{channel}")).await
    }

    async fn auto_scale(&self) -> Result<()> {
        self.transport.write(":KEY:AUTO").await?;
        tokio::time::sleep(AUTO_SCALE_SETTLE).await;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        self.transport.write("RUN").await
    }

    async fn stop(&self) -> Result<()> {
        self.transport.write("STOP").await
    }

    async fn close(&self) -> Result<()> {
        self.transport.write(":KEY:FORC").await
    }
}
