//! Sweep parameter bundles and axis construction.
//!
//! Each sweep variant owns one serde struct deserialized from the run file
//! (TOML, tagged with `sweep = "..."`). Only the fields that have no sane
//! default are mandatory; everything else carries the value the bench has
//! always used so a minimal run file stays four lines long.
//!
//! Axes are built with [`arange`], which follows the half-open convention:
//! `arange(50, 60, 5)` yields `[50, 55]`. Sweeps that want an inclusive
//! upper edge spell it out as `arange(min, max + step, step)`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Default settling pause between applying a value and reading, seconds.
fn default_settling_s() -> f64 {
    0.1
}

/// Default HF current compliance in ampere.
fn default_current_limit_a() -> f64 {
    2.0
}

/// Default drive amplitude in volt.
fn default_drive_voltage_v() -> f64 {
    10.0
}

/// Default half-width of the per-capacitance frequency window in kHz.
fn default_span_khz() -> f64 {
    15.0
}

/// Default inner-axis frequency step in kHz.
fn default_inner_step_khz() -> f64 {
    1.0
}

/// Default bias coil constant in mT per ampere.
fn default_bias_coil_mt_per_a() -> f64 {
    10.0
}

/// Half-open float range, `start + i*step` for every value below `stop`.
///
/// A small relative tolerance keeps `arange(0.0, 0.3, 0.1)` at three
/// elements instead of four when the quotient lands a few ulp above an
/// integer.
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if !step.is_finite() || step <= 0.0 {
        return Vec::new();
    }
    let span = stop - start;
    if !span.is_finite() || span <= 0.0 {
        return Vec::new();
    }
    let count = ((span / step) - 1e-9).ceil().max(0.0) as usize;
    (0..count).map(|i| start + i as f64 * step).collect()
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(BenchError::Validation(message.into()))
    }
}

/// Where the measurement files go and how they are named.
///
/// Combined with the sweep's file suffix this fixes the output path:
/// `<folder>/<YYYY-MM-DD>_<batch>_d<device>[_<suffix>].csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupParams {
    /// Output folder; `None` falls back to `default_saving_path`.
    pub folder: Option<PathBuf>,
    /// Batch identifier embedded in the file name.
    pub batch_name: String,
    /// Device number within the batch.
    pub device_number: u32,
    /// Device dimensions `(a, b)` in mm, used for power density.
    pub device_size_mm: (f64, f64),
}

impl Default for SetupParams {
    fn default() -> Self {
        SetupParams {
            folder: None,
            batch_name: "sample".into(),
            device_number: 1,
            device_size_mm: (5.0, 5.0),
        }
    }
}

impl SetupParams {
    /// Device face area in mm².
    pub fn device_area_mm2(&self) -> f64 {
        self.device_size_mm.0 * self.device_size_mm.1
    }
}

/// Frequency scan over `arange(f_min, f_max, f_step)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyScanParams {
    /// Lower edge of the scan in kHz.
    pub f_min_khz: f64,
    /// Upper edge of the scan in kHz (excluded).
    pub f_max_khz: f64,
    /// Step in kHz.
    pub f_step_khz: f64,
    /// Source voltage setpoint in V.
    pub drive_voltage_v: f64,
    /// Current compliance in A (fixed-current mode).
    #[serde(default = "default_current_limit_a")]
    pub current_limit_a: f64,
    /// Constant-field mode: reconverge the regulator onto this target at
    /// every step. `None` runs fixed-current.
    #[serde(default)]
    pub target_field_mt: Option<f64>,
    /// Retune the tank capacitance to each frequency before applying it.
    #[serde(default)]
    pub autoset_capacitance: bool,
    /// Settling pause per step in seconds.
    #[serde(default = "default_settling_s")]
    pub settling_time_s: f64,
}

impl FrequencyScanParams {
    /// The frequency axis in kHz.
    pub fn axis(&self) -> Vec<f64> {
        arange(self.f_min_khz, self.f_max_khz, self.f_step_khz)
    }

    /// Settling pause as a [`Duration`].
    pub fn settling(&self) -> Duration {
        Duration::from_secs_f64(self.settling_time_s.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        require(self.f_step_khz > 0.0, "frequency step must be positive")?;
        require(
            self.f_min_khz < self.f_max_khz,
            "f_min_khz must be below f_max_khz",
        )?;
        require(self.drive_voltage_v > 0.0, "drive voltage must be positive")?;
        if let Some(target) = self.target_field_mt {
            require(
                target.is_finite() && target > 0.0,
                "target field must be positive",
            )?;
        }
        Ok(())
    }
}

/// Capacitance scan: every reachable combination in `[c_min, c_max]`,
/// each probed over a narrow frequency window around its predicted
/// resonance and fitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacitanceScanParams {
    /// Smallest combination sum in pF.
    pub c_min_pf: f64,
    /// Largest combination sum in pF.
    pub c_max_pf: f64,
    /// Lower clamp for the inner frequency window, kHz.
    pub f_min_khz: f64,
    /// Upper clamp for the inner frequency window, kHz.
    pub f_max_khz: f64,
    /// Source voltage setpoint in V.
    pub drive_voltage_v: f64,
    /// Inner-axis step in kHz.
    #[serde(default = "default_inner_step_khz")]
    pub f_step_khz: f64,
    /// Half-width of the inner window around the predicted resonance, kHz.
    #[serde(default = "default_span_khz")]
    pub span_khz: f64,
    /// Current compliance in A.
    #[serde(default = "default_current_limit_a")]
    pub current_limit_a: f64,
    /// Settling pause per inner step in seconds.
    #[serde(default = "default_settling_s")]
    pub settling_time_s: f64,
}

impl CapacitanceScanParams {
    /// Inner frequency axis for one capacitance, centred on the predicted
    /// resonance and clamped to the user range. Empty when the clamped
    /// window collapses.
    pub fn inner_axis(&self, predicted_khz: f64) -> Vec<f64> {
        let lo = (predicted_khz - self.span_khz).max(self.f_min_khz);
        let hi = (predicted_khz + self.span_khz).min(self.f_max_khz);
        arange(lo, hi, self.f_step_khz)
    }

    pub fn settling(&self) -> Duration {
        Duration::from_secs_f64(self.settling_time_s.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        require(self.c_min_pf <= self.c_max_pf, "c_min_pf must not exceed c_max_pf")?;
        require(self.f_step_khz > 0.0, "frequency step must be positive")?;
        require(self.span_khz > 0.0, "span_khz must be positive")?;
        require(
            self.f_min_khz < self.f_max_khz,
            "f_min_khz must be below f_max_khz",
        )?;
        require(self.drive_voltage_v > 0.0, "drive voltage must be positive")
    }
}

/// DC bias scan over `arange(b_min, b_max + b_step, b_step)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasScanParams {
    /// First bias field in mT (signed).
    pub b_min_mt: f64,
    /// Last bias field in mT (included).
    pub b_max_mt: f64,
    /// Step in mT.
    pub b_step_mt: f64,
    /// HF drive frequency in kHz.
    pub frequency_khz: f64,
    /// HF source voltage setpoint in V.
    #[serde(default = "default_drive_voltage_v")]
    pub drive_voltage_v: f64,
    /// Bias coil constant in mT per ampere.
    #[serde(default = "default_bias_coil_mt_per_a")]
    pub bias_coil_mt_per_a: f64,
    /// Settling pause per step in seconds.
    #[serde(default = "default_settling_s")]
    pub settling_time_s: f64,
}

impl BiasScanParams {
    /// The bias axis in mT, inclusive of `b_max_mt`.
    pub fn axis(&self) -> Vec<f64> {
        arange(self.b_min_mt, self.b_max_mt + self.b_step_mt, self.b_step_mt)
    }

    /// Coil current for a bias field. The supply is single-quadrant, so
    /// the magnitude is applied; the persisted axis keeps the sign.
    pub fn current_for(&self, b_mt: f64) -> f64 {
        b_mt.abs() / self.bias_coil_mt_per_a
    }

    pub fn settling(&self) -> Duration {
        Duration::from_secs_f64(self.settling_time_s.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        require(self.b_step_mt > 0.0, "bias step must be positive")?;
        require(
            self.b_min_mt <= self.b_max_mt,
            "b_min_mt must not exceed b_max_mt",
        )?;
        require(
            self.bias_coil_mt_per_a > 0.0,
            "bias coil constant must be positive",
        )?;
        require(self.frequency_khz > 0.0, "frequency must be positive")?;
        require(self.drive_voltage_v > 0.0, "drive voltage must be positive")
    }
}

/// HF amplitude scan over `arange(v_min, v_max + v_step, v_step)`, with a
/// device-free calibration phase before the measurement phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmplitudeScanParams {
    /// First amplitude in V.
    pub v_min_v: f64,
    /// Last amplitude in V (included).
    pub v_max_v: f64,
    /// Step in V.
    pub v_step_v: f64,
    /// Drive frequency in kHz.
    pub frequency_khz: f64,
    /// Current compliance in A.
    #[serde(default = "default_current_limit_a")]
    pub current_limit_a: f64,
    /// Settling pause per step in seconds.
    #[serde(default = "default_settling_s")]
    pub settling_time_s: f64,
}

impl AmplitudeScanParams {
    /// The amplitude axis in V, inclusive of `v_max_v`.
    pub fn axis(&self) -> Vec<f64> {
        arange(self.v_min_v, self.v_max_v + self.v_step_v, self.v_step_v)
    }

    pub fn settling(&self) -> Duration {
        Duration::from_secs_f64(self.settling_time_s.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        require(self.v_step_v > 0.0, "amplitude step must be positive")?;
        require(
            self.v_min_v <= self.v_max_v,
            "v_min_v must not exceed v_max_v",
        )?;
        require(self.v_min_v >= 0.0, "amplitudes must not be negative")?;
        require(self.frequency_khz > 0.0, "frequency must be positive")
    }
}

/// Lifetime scan: one measurement per tick of `arange(0, total + 1, Δt)`,
/// appended to disk as produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifetimeScanParams {
    /// Total observation time in seconds.
    pub total_s: f64,
    /// Tick interval in seconds.
    pub interval_s: f64,
    /// Drive amplitude in V.
    pub drive_voltage_v: f64,
    /// Drive frequency in kHz.
    pub frequency_khz: f64,
    /// Current compliance in A.
    #[serde(default = "default_current_limit_a")]
    pub current_limit_a: f64,
    /// Settling pause before the calibration capture, seconds.
    #[serde(default = "default_settling_s")]
    pub settling_time_s: f64,
}

impl LifetimeScanParams {
    /// Tick times in seconds from sweep start.
    pub fn ticks(&self) -> Vec<f64> {
        arange(0.0, self.total_s + 1.0, self.interval_s)
    }

    pub fn settling(&self) -> Duration {
        Duration::from_secs_f64(self.settling_time_s.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        require(self.interval_s > 0.0, "tick interval must be positive")?;
        require(self.total_s >= 0.0, "total time must not be negative")?;
        require(self.drive_voltage_v > 0.0, "drive voltage must be positive")?;
        require(self.frequency_khz > 0.0, "frequency must be positive")
    }
}

/// Power scan over the load-resistor combinations in `[r_min, r_max]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerScanParams {
    /// Smallest load in Ω.
    pub r_min_ohm: f64,
    /// Largest load in Ω.
    pub r_max_ohm: f64,
    /// Drive amplitude in V.
    pub drive_voltage_v: f64,
    /// Drive frequency in kHz.
    pub frequency_khz: f64,
    /// Current compliance in A.
    #[serde(default = "default_current_limit_a")]
    pub current_limit_a: f64,
    /// Settling pause per step in seconds.
    #[serde(default = "default_settling_s")]
    pub settling_time_s: f64,
}

impl PowerScanParams {
    pub fn settling(&self) -> Duration {
        Duration::from_secs_f64(self.settling_time_s.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        require(self.r_min_ohm <= self.r_max_ohm, "r_min_ohm must not exceed r_max_ohm")?;
        require(self.r_min_ohm > 0.0, "load resistance must be positive")?;
        require(self.drive_voltage_v > 0.0, "drive voltage must be positive")?;
        require(self.frequency_khz > 0.0, "frequency must be positive")
    }
}

/// One row of a pulse schedule. The row is active from the previous row's
/// end (or `t = 0`) until `t_end_s`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseRow {
    /// End of this window, seconds from sweep start.
    pub t_end_s: f64,
    /// `"ON"` or `"OFF"`; anything else is logged and skipped.
    pub signal: String,
    /// DC bias field during the window, mT.
    pub dc_field_mt: f64,
    /// HF amplitude during the window, volts, applied open-loop.
    pub hf_field_v: f64,
    /// Drive frequency during the window, kHz.
    pub frequency_khz: f64,
}

impl PulseRow {
    /// `Some(true)` for ON, `Some(false)` for OFF, `None` for anything
    /// else (case-insensitive).
    pub fn gate(&self) -> Option<bool> {
        match self.signal.trim().to_ascii_uppercase().as_str() {
            "ON" => Some(true),
            "OFF" => Some(false),
            _ => None,
        }
    }

    /// Drive parameters as a comparable tuple for pre-apply decisions.
    pub fn drive_settings(&self) -> (f64, f64, f64) {
        (self.dc_field_mt, self.hf_field_v, self.frequency_khz)
    }
}

/// Pulsed endurance schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseScheduleParams {
    /// Schedule rows, ordered by `t_end_s`.
    pub rows: Vec<PulseRow>,
    /// Bias coil constant in mT per ampere.
    #[serde(default = "default_bias_coil_mt_per_a")]
    pub bias_coil_mt_per_a: f64,
}

impl PulseScheduleParams {
    pub fn validate(&self) -> Result<()> {
        require(!self.rows.is_empty(), "pulse schedule has no rows")?;
        require(
            self.bias_coil_mt_per_a > 0.0,
            "bias coil constant must be positive",
        )?;
        let mut previous = 0.0;
        for row in &self.rows {
            require(
                row.t_end_s > previous,
                "pulse row times must be strictly increasing from 0",
            )?;
            previous = row.t_end_s;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arange_excludes_the_stop_value() {
        assert_eq!(arange(50.0, 60.0, 5.0), vec![50.0, 55.0]);
        assert_eq!(arange(50.0, 60.1, 5.0), vec![50.0, 55.0, 60.0]);
        assert!(arange(10.0, 10.0, 1.0).is_empty());
        assert!(arange(10.0, 5.0, 1.0).is_empty());
        assert!(arange(0.0, 10.0, 0.0).is_empty());
    }

    #[test]
    fn arange_survives_floating_point_fuzz() {
        // The quotient can land either side of the exact integer; the
        // tolerance keeps the tick count stable.
        assert_eq!(arange(0.0, 0.3, 0.1).len(), 3);
        assert_eq!(arange(0.0, 0.7, 0.1).len(), 7);
    }

    #[test]
    fn bias_axis_includes_the_upper_edge() {
        let params = BiasScanParams {
            b_min_mt: -10.0,
            b_max_mt: 10.0,
            b_step_mt: 5.0,
            frequency_khz: 100.0,
            drive_voltage_v: 10.0,
            bias_coil_mt_per_a: 10.0,
            settling_time_s: 0.0,
        };
        assert_eq!(params.axis(), vec![-10.0, -5.0, 0.0, 5.0, 10.0]);
        assert_eq!(params.current_for(-5.0), 0.5);
        assert_eq!(params.current_for(5.0), 0.5);
    }

    #[test]
    fn lifetime_ticks_follow_the_grid_formula() {
        let params = LifetimeScanParams {
            total_s: 10.0,
            interval_s: 5.0,
            drive_voltage_v: 10.0,
            frequency_khz: 100.0,
            current_limit_a: 2.0,
            settling_time_s: 0.0,
        };
        assert_eq!(params.ticks(), vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn inner_axis_clamps_to_the_user_range() {
        let params = CapacitanceScanParams {
            c_min_pf: 100.0,
            c_max_pf: 2000.0,
            f_min_khz: 40.0,
            f_max_khz: 80.0,
            drive_voltage_v: 10.0,
            f_step_khz: 1.0,
            span_khz: 15.0,
            current_limit_a: 2.0,
            settling_time_s: 0.0,
        };
        let axis = params.inner_axis(70.0);
        assert_eq!(axis.first(), Some(&55.0));
        assert!(axis.last().map(|f| *f < 80.0).unwrap_or(false));
        // Prediction far above the range collapses the window.
        assert!(params.inner_axis(100.0).is_empty());
    }

    #[test]
    fn minimal_frequency_toml_fills_the_defaults() {
        let text = r#"
            f_min_khz = 50.0
            f_max_khz = 60.0
            f_step_khz = 5.0
            drive_voltage_v = 10.0
        "#;
        let params: FrequencyScanParams = toml::from_str(text).unwrap();
        assert_eq!(params.current_limit_a, 2.0);
        assert_eq!(params.settling_time_s, 0.1);
        assert!(params.target_field_mt.is_none());
        assert!(!params.autoset_capacitance);
        params.validate().unwrap();
    }

    #[test]
    fn pulse_rows_parse_signals_case_insensitively() {
        let row = |signal: &str| PulseRow {
            t_end_s: 1.0,
            signal: signal.into(),
            dc_field_mt: 0.0,
            hf_field_v: 5.0,
            frequency_khz: 100.0,
        };
        assert_eq!(row("ON").gate(), Some(true));
        assert_eq!(row("off").gate(), Some(false));
        assert_eq!(row("burst").gate(), None);
    }

    #[test]
    fn pulse_schedule_rejects_non_monotonic_times() {
        let mut params = PulseScheduleParams {
            rows: vec![
                PulseRow {
                    t_end_s: 2.0,
                    signal: "ON".into(),
                    dc_field_mt: 0.0,
                    hf_field_v: 5.0,
                    frequency_khz: 100.0,
                },
                PulseRow {
                    t_end_s: 1.0,
                    signal: "OFF".into(),
                    dc_field_mt: 0.0,
                    hf_field_v: 5.0,
                    frequency_khz: 100.0,
                },
            ],
            bias_coil_mt_per_a: 10.0,
        };
        assert!(params.validate().is_err());
        params.rows[1].t_end_s = 3.0;
        params.validate().unwrap();
    }

    #[test]
    fn setup_defaults_produce_a_usable_area() {
        let setup = SetupParams::default();
        assert_eq!(setup.device_area_mm2(), 25.0);
        assert!(setup.folder.is_none());
    }
}
