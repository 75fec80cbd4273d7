//! Instrument role traits and shared measurement types.
//!
//! Each instrument on the bench fills exactly one role, expressed as a
//! small async trait:
//!
//! - [`Oscilloscope`]: waveforms and scalar measurements (pickup + device
//!   channels).
//! - [`PowerSource`]: the programmable HF/bias source.
//! - [`DriveController`]: the microcontroller generating the drive square
//!   wave and switching the capacitor/resistor banks.
//!
//! Sweeps and the regulator are written against these traits, so they run
//! unchanged over the real drivers, the null drivers substituted for absent
//! hardware, and the simulated bench used in tests.
//!
//! # Design
//!
//! Each role trait:
//! - Is async (uses `#[async_trait]`)
//! - Is thread-safe (requires `Send + Sync`)
//! - Takes `&self`; drivers use interior mutability for cached state

use async_trait::async_trait;

use crate::error::Result;

pub mod arduino;
pub mod bank;
pub mod mock;
pub mod oscilloscope;
pub mod source;

/// Scope channel wired to the pickup coil.
pub const PICKUP_CHANNEL: u8 = 1;

/// Scope channel wired to the device under test.
pub const DEVICE_CHANNEL: u8 = 2;

/// Scalar measurement selector for [`Oscilloscope::measure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    /// Peak-to-peak voltage.
    Vpp,
    /// Maximum voltage.
    Vmax,
    /// Minimum voltage.
    Vmin,
    /// Signal frequency in Hz.
    Frequency,
}

/// Display unit chosen for a decoded waveform time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// Microseconds.
    Micro,
    /// Milliseconds.
    Milli,
    /// Seconds.
    Second,
}

impl TimeUnit {
    /// Axis label for plots and file headers.
    pub fn label(&self) -> &'static str {
        match self {
            TimeUnit::Micro => "us",
            TimeUnit::Milli => "ms",
            TimeUnit::Second => "s",
        }
    }
}

/// A decoded waveform trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Time axis in `time_unit` units, same length as `volts`.
    pub times: Vec<f64>,
    /// Sample voltages in V.
    pub volts: Vec<f64>,
    /// Unit the time axis was rescaled to.
    pub time_unit: TimeUnit,
}

/// Logical output channel of the power source.
///
/// Channel 1 drives the HF excitation coil, channel 2 the DC bias coil.
/// Single-channel hardware ignores the distinction; the simulated bench
/// honors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceChannel {
    /// HF excitation drive.
    Hf,
    /// DC bias coil.
    Bias,
}

impl SourceChannel {
    /// 1-based channel index for logs and displays.
    pub fn index(&self) -> u8 {
        match self {
            SourceChannel::Hf => 1,
            SourceChannel::Bias => 2,
        }
    }
}

/// Regulation mode reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Constant-voltage regulation.
    ConstantVoltage,
    /// Constant-current regulation (the current limit is active).
    ConstantCurrent,
}

/// One readback from the source display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceReading {
    /// Output voltage in V.
    pub voltage_v: f64,
    /// Output current in A.
    pub current_a: f64,
    /// Active regulation mode.
    pub mode: SourceMode,
}

/// Hardware limits reported by the source at init.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceLimits {
    /// Maximum programmable voltage in V.
    pub voltage_max_v: f64,
    /// Maximum programmable current in A.
    pub current_max_a: f64,
}

/// Role: oscilloscope with waveform capture and scalar measurements.
#[async_trait]
pub trait Oscilloscope: Send + Sync {
    /// Capture and decode the waveform currently displayed on `channel`.
    async fn get_data(&self, channel: u8) -> Result<Waveform>;

    /// One scalar measurement on `channel`.
    async fn measure(&self, kind: MeasureKind, channel: u8) -> Result<f64>;

    /// Run the front-panel automatic scaling routine and wait for it.
    async fn auto_scale(&self) -> Result<()>;

    /// Resume acquisition.
    async fn run(&self) -> Result<()>;

    /// Freeze acquisition.
    async fn stop(&self) -> Result<()>;

    /// Return the scope to front-panel control and release the transport.
    async fn close(&self) -> Result<()>;
}

/// Role: programmable power source.
///
/// # Contract
/// - Setpoints are clamped into the hardware limits and rounded to the
///   wire resolution (0.1); the applied value is returned so callers can
///   log the clamp.
/// - `output` reflects intent: `is_output_on` reports the last state this
///   driver successfully commanded, not a hardware readback.
#[async_trait]
pub trait PowerSource: Send + Sync {
    /// Hardware voltage/current limits.
    async fn limits(&self) -> Result<SourceLimits>;

    /// Voltage/current/mode readback.
    async fn read_values(&self, channel: SourceChannel) -> Result<SourceReading>;

    /// Program the output voltage; returns the value actually applied.
    async fn set_voltage(&self, channel: SourceChannel, volts: f64) -> Result<f64>;

    /// Program the current limit; returns the value actually applied.
    async fn set_current(&self, channel: SourceChannel, amps: f64) -> Result<f64>;

    /// Enable or disable the output relay.
    async fn output(&self, channel: SourceChannel, on: bool) -> Result<()>;

    /// Last successfully commanded output state.
    async fn is_output_on(&self, channel: SourceChannel) -> bool;
}

/// Role: drive-frequency generator and switch-bank controller.
#[async_trait]
pub trait DriveController: Send + Sync {
    /// Set the drive frequency in kHz. With `autoset_capacitance` the
    /// controller also switches the capacitance that places the tank
    /// resonance at (or just above) the requested frequency.
    async fn set_frequency(&self, f_khz: f64, autoset_capacitance: bool) -> Result<()>;

    /// Firmware-reported drive frequency in kHz.
    async fn read_frequency(&self) -> Result<f64>;

    /// Switch the capacitance combination nearest above `target_pf`;
    /// returns the switched sum in pF.
    async fn set_capacitance(&self, target_pf: f64) -> Result<f64>;

    /// Switch the load resistance combination nearest above `target_ohm`;
    /// returns the switched sum in Ω.
    async fn set_resistance(&self, target_ohm: f64) -> Result<f64>;

    /// Gate the drive square wave on or off.
    async fn trigger_frequency_generation(&self, on: bool) -> Result<()>;

    /// Currently switched tank capacitance in pF (cached, no I/O).
    async fn capacitance(&self) -> f64;

    /// Distinct switchable capacitance sums within `[lo_pf, hi_pf]`,
    /// ascending. Axis source for capacitance scans.
    async fn capacitance_combinations(&self, lo_pf: f64, hi_pf: f64) -> Vec<f64>;

    /// Distinct switchable load resistance sums within `[lo_ohm, hi_ohm]`,
    /// ascending. Axis source for power scans.
    async fn resistance_combinations(&self, lo_ohm: f64, hi_ohm: f64) -> Vec<f64>;
}
