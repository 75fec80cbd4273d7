//! Simulated bench and inert null drivers.
//!
//! [`SimulatedBench`] models enough of the physical rig that the engine
//! closes its loops against it:
//!
//! - The tank current follows the resonance curve of the switched
//!   capacitance, so capacitance scans produce fittable traces.
//! - The pickup voltage is consistent with the induction law, so the field
//!   regulator converges on a field proportional to the HF drive voltage.
//! - The device voltage peaks at a configurable bias field and scales with
//!   the load resistance, so bias and power scans have an optimum to find.
//!
//! All drivers share one [`SimState`] behind a mutex; the test handles on
//! [`SimulatedBench`] mutate the same state (inserting the device between
//! the calibration and measurement phases, for example).
//!
//! The null drivers at the bottom stand in for absent hardware. They
//! accept every command and answer with zeros so the bench stays usable
//! when a transport is missing.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{BenchError, Result};
use crate::instruments::arduino::{RESISTANCES_OHM, RESISTOR_PINS};
use crate::instruments::bank::SwitchBank;
use crate::instruments::{
    DriveController, MeasureKind, Oscilloscope, PowerSource, SourceChannel, SourceLimits,
    SourceMode, SourceReading, TimeUnit, Waveform,
};
use crate::physics;
use crate::settings::GlobalParams;

/// Limits reported by the simulated supply.
const SIM_LIMITS: SourceLimits = SourceLimits {
    voltage_max_v: 36.2,
    current_max_a: 10.0,
};

/// Samples per synthesized waveform.
const WAVEFORM_POINTS: usize = 600;

/// Mutable state shared by the simulated drivers.
struct SimState {
    drive_freq_khz: f64,
    gate_on: bool,
    capacitance_pf: f64,
    resistance_ohm: f64,
    hf_voltage_v: f64,
    hf_current_limit_a: f64,
    bias_voltage_v: f64,
    bias_current_a: f64,
    hf_on: bool,
    bias_on: bool,
    device_inserted: bool,
    // Rig model parameters.
    windings: f64,
    radius_m: f64,
    inductance_h: f64,
    circuit_r_ohm: f64,
    field_gain_mt_per_v: f64,
    bias_mt_per_a: f64,
    optimum_bias_mt: f64,
    bias_width_mt: f64,
    me_gain: f64,
    feedthrough_gain: f64,
    device_internal_ohm: f64,
    sim_q: f64,
    jitter: f64,
    rng: StdRng,
}

impl SimState {
    fn resonance_khz(&self) -> f64 {
        physics::resonance_frequency(self.capacitance_pf * 1e-12, self.inductance_h) / 1e3
    }

    /// Resonance response in (0, 1], peaking at the tank resonance.
    fn lorentz(&self, f_khz: f64) -> f64 {
        let f0 = self.resonance_khz();
        let detune = (f_khz * f_khz - f0 * f0) / (f_khz * f0);
        1.0 / (1.0 + self.sim_q * self.sim_q * detune * detune)
    }

    /// Tank current and the regulation mode it implies.
    fn tank_current(&mut self) -> (f64, SourceMode) {
        if !self.hf_on || !self.gate_on {
            return (0.0, SourceMode::ConstantVoltage);
        }
        let peak = self.hf_voltage_v / self.circuit_r_ohm;
        let raw = peak * self.lorentz(self.drive_freq_khz).sqrt();
        let raw = self.jittered(raw);
        if raw > self.hf_current_limit_a {
            (self.hf_current_limit_a, SourceMode::ConstantCurrent)
        } else {
            (raw, SourceMode::ConstantVoltage)
        }
    }

    /// AC field produced by the HF coil, in mT.
    fn hf_field_mt(&self) -> f64 {
        if self.hf_on && self.gate_on {
            self.field_gain_mt_per_v * self.hf_voltage_v
        } else {
            0.0
        }
    }

    /// DC field produced by the bias coil, in mT. Single-quadrant supply,
    /// so the sign of the requested field is lost here as on the rig.
    fn bias_field_mt(&self) -> f64 {
        if self.bias_on {
            self.bias_mt_per_a * self.bias_current_a
        } else {
            0.0
        }
    }

    /// Peak voltage induced in the pickup coil by the HF field.
    fn pickup_vmax(&mut self) -> f64 {
        let f_hz = self.drive_freq_khz * 1e3;
        let area = PI * self.radius_m * self.radius_m;
        let v = self.hf_field_mt() / 1e3 * self.windings * area * 2.0 * PI * f_hz;
        self.jittered(v)
    }

    /// Peak voltage on the device channel: capacitive feedthrough plus the
    /// ME response when a device is inserted.
    fn device_vmax(&mut self) -> f64 {
        if !self.hf_on || !self.gate_on {
            return 0.0;
        }
        let feedthrough = self.feedthrough_gain * self.hf_voltage_v;
        let me = if self.device_inserted {
            let bias = self.bias_field_mt();
            let detune = (bias - self.optimum_bias_mt) / self.bias_width_mt;
            let bias_factor = 1.0 / (1.0 + detune * detune);
            let load_factor = if self.resistance_ohm > 0.0 {
                self.resistance_ohm / (self.resistance_ohm + self.device_internal_ohm)
            } else {
                1.0
            };
            self.me_gain
                * self.hf_voltage_v
                * self.lorentz(self.drive_freq_khz)
                * bias_factor
                * load_factor
        } else {
            0.0
        };
        let v = feedthrough + me;
        self.jittered(v)
    }

    fn jittered(&mut self, value: f64) -> f64 {
        if self.jitter == 0.0 {
            value
        } else {
            value * (1.0 + self.jitter * self.rng.gen_range(-1.0..1.0))
        }
    }
}

/// Test/CLI handle owning the shared state and the driver instances.
pub struct SimulatedBench {
    state: Arc<Mutex<SimState>>,
    cap_bank: SwitchBank,
    res_bank: SwitchBank,
}

impl SimulatedBench {
    /// Build the rig model from the bench globals.
    pub fn new(params: &GlobalParams) -> Result<Self> {
        let cap_bank = SwitchBank::new(
            params.base_capacitance_pf,
            &params.capacitances_pf,
            &params.arduino_pins,
        )?;
        let res_bank = SwitchBank::new(0.0, &RESISTANCES_OHM, &RESISTOR_PINS)?;
        let state = SimState {
            drive_freq_khz: 1000.0,
            gate_on: true,
            capacitance_pf: cap_bank.base(),
            resistance_ohm: 0.0,
            hf_voltage_v: 0.0,
            hf_current_limit_a: SIM_LIMITS.current_max_a,
            bias_voltage_v: 0.0,
            bias_current_a: 0.0,
            hf_on: false,
            bias_on: false,
            device_inserted: true,
            windings: params.pickup_windings,
            radius_m: params.pickup_radius_m(),
            inductance_h: params.coil_inductance_h(),
            circuit_r_ohm: params.circuit_resistance_ohm,
            field_gain_mt_per_v: 1.0,
            bias_mt_per_a: 10.0,
            optimum_bias_mt: 4.0,
            bias_width_mt: 3.0,
            me_gain: 0.2,
            feedthrough_gain: 0.01,
            device_internal_ohm: 100.0,
            sim_q: 85.0,
            jitter: 0.0,
            rng: StdRng::seed_from_u64(0xB3),
        };
        Ok(SimulatedBench {
            state: Arc::new(Mutex::new(state)),
            cap_bank,
            res_bank,
        })
    }

    /// Oscilloscope driver view.
    pub fn scope(&self) -> Arc<dyn Oscilloscope> {
        Arc::new(SimScope {
            state: self.state.clone(),
        })
    }

    /// Power source driver view.
    pub fn source(&self) -> Arc<dyn PowerSource> {
        Arc::new(SimSource {
            state: self.state.clone(),
        })
    }

    /// Drive controller view.
    pub fn drive(&self) -> Arc<dyn DriveController> {
        Arc::new(SimDrive {
            state: self.state.clone(),
            cap_bank: self.cap_bank.clone(),
            res_bank: self.res_bank.clone(),
        })
    }

    /// Insert or remove the device under test.
    pub fn set_device_inserted(&self, inserted: bool) {
        self.state.lock().unwrap().device_inserted = inserted;
    }

    /// Peak ME voltage per drive volt at resonance and optimum bias.
    pub fn set_me_gain(&self, gain: f64) {
        self.state.lock().unwrap().me_gain = gain;
    }

    /// AC field per drive volt in mT/V.
    pub fn set_field_gain(&self, mt_per_v: f64) {
        self.state.lock().unwrap().field_gain_mt_per_v = mt_per_v;
    }

    /// Bias coil constant in mT/A.
    pub fn set_bias_constant(&self, mt_per_a: f64) {
        self.state.lock().unwrap().bias_mt_per_a = mt_per_a;
    }

    /// Bias field of peak ME response and the response width, both mT.
    pub fn set_optimum_bias(&self, optimum_mt: f64, width_mt: f64) {
        let mut state = self.state.lock().unwrap();
        state.optimum_bias_mt = optimum_mt;
        state.bias_width_mt = width_mt;
    }

    /// Relative measurement jitter; zero (the default) is fully
    /// deterministic.
    pub fn set_jitter(&self, jitter: f64) {
        self.state.lock().unwrap().jitter = jitter;
    }

    /// Point-in-time copy of the actuator state, for assertions.
    pub fn snapshot(&self) -> SimSnapshot {
        let state = self.state.lock().unwrap();
        SimSnapshot {
            drive_freq_khz: state.drive_freq_khz,
            gate_on: state.gate_on,
            capacitance_pf: state.capacitance_pf,
            resistance_ohm: state.resistance_ohm,
            hf_voltage_v: state.hf_voltage_v,
            bias_current_a: state.bias_current_a,
            hf_on: state.hf_on,
            bias_on: state.bias_on,
        }
    }
}

/// Actuator state copied out by [`SimulatedBench::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimSnapshot {
    pub drive_freq_khz: f64,
    pub gate_on: bool,
    pub capacitance_pf: f64,
    pub resistance_ohm: f64,
    pub hf_voltage_v: f64,
    pub bias_current_a: f64,
    pub hf_on: bool,
    pub bias_on: bool,
}

struct SimScope {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl Oscilloscope for SimScope {
    async fn get_data(&self, channel: u8) -> Result<Waveform> {
        let (vmax, f_hz) = {
            let mut state = self.state.lock().unwrap();
            let vmax = match channel {
                1 => state.pickup_vmax(),
                _ => state.device_vmax(),
            };
            (vmax, state.drive_freq_khz * 1e3)
        };

        // Three periods across the screen, like a sensible trigger setup.
        let timescale = 1.0 / (4.0 * f_hz);
        let start = -6.0 * timescale;
        let end = 6.0 * timescale;
        let (unit, factor) = if end < 1e-3 {
            (TimeUnit::Micro, 1e6)
        } else if end < 1.0 {
            (TimeUnit::Milli, 1e3)
        } else {
            (TimeUnit::Second, 1.0)
        };
        let mut times = Vec::with_capacity(WAVEFORM_POINTS);
        let mut volts = Vec::with_capacity(WAVEFORM_POINTS);
        for i in 0..WAVEFORM_POINTS {
            let t = start + (end - start) * i as f64 / (WAVEFORM_POINTS - 1) as f64;
            times.push(t * factor);
            volts.push(vmax * (2.0 * PI * f_hz * t).sin());
        }
        Ok(Waveform {
            times,
            volts,
            time_unit: unit,
        })
    }

    async fn measure(&self, kind: MeasureKind, channel: u8) -> Result<f64> {
        let mut state = self.state.lock().unwrap();
        let vmax = match channel {
            1 => state.pickup_vmax(),
            _ => state.device_vmax(),
        };
        Ok(match kind {
            MeasureKind::Vpp => 2.0 * vmax,
            MeasureKind::Vmax => vmax,
            MeasureKind::Vmin => -vmax,
            MeasureKind::Frequency => state.drive_freq_khz * 1e3,
        })
    }

    async fn auto_scale(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct SimSource {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl PowerSource for SimSource {
    async fn limits(&self) -> Result<SourceLimits> {
        Ok(SIM_LIMITS)
    }

    async fn read_values(&self, channel: SourceChannel) -> Result<SourceReading> {
        let mut state = self.state.lock().unwrap();
        Ok(match channel {
            SourceChannel::Hf => {
                let (current, mode) = state.tank_current();
                SourceReading {
                    voltage_v: state.hf_voltage_v,
                    current_a: current,
                    mode,
                }
            }
            SourceChannel::Bias => SourceReading {
                voltage_v: state.bias_voltage_v,
                current_a: if state.bias_on { state.bias_current_a } else { 0.0 },
                mode: SourceMode::ConstantCurrent,
            },
        })
    }

    async fn set_voltage(&self, channel: SourceChannel, volts: f64) -> Result<f64> {
        let clamped = volts.clamp(0.0, SIM_LIMITS.voltage_max_v);
        if clamped != volts {
            warn!("simulated source clamping voltage {volts} to {clamped}");
        }
        let rounded = (clamped * 10.0).round() / 10.0;
        let mut state = self.state.lock().unwrap();
        match channel {
            SourceChannel::Hf => state.hf_voltage_v = rounded,
            SourceChannel::Bias => state.bias_voltage_v = rounded,
        }
        Ok(rounded)
    }

    async fn set_current(&self, channel: SourceChannel, amps: f64) -> Result<f64> {
        let clamped = amps.clamp(0.0, SIM_LIMITS.current_max_a);
        if clamped != amps {
            warn!("simulated source clamping current {amps} to {clamped}");
        }
        let rounded = (clamped * 10.0).round() / 10.0;
        let mut state = self.state.lock().unwrap();
        match channel {
            SourceChannel::Hf => state.hf_current_limit_a = rounded,
            SourceChannel::Bias => state.bias_current_a = rounded,
        }
        Ok(rounded)
    }

    async fn output(&self, channel: SourceChannel, on: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match channel {
            SourceChannel::Hf => state.hf_on = on,
            SourceChannel::Bias => state.bias_on = on,
        }
        Ok(())
    }

    async fn is_output_on(&self, channel: SourceChannel) -> bool {
        let state = self.state.lock().unwrap();
        match channel {
            SourceChannel::Hf => state.hf_on,
            SourceChannel::Bias => state.bias_on,
        }
    }
}

struct SimDrive {
    state: Arc<Mutex<SimState>>,
    cap_bank: SwitchBank,
    res_bank: SwitchBank,
}

#[async_trait]
impl DriveController for SimDrive {
    async fn set_frequency(&self, f_khz: f64, autoset_capacitance: bool) -> Result<()> {
        if !f_khz.is_finite() || f_khz <= 0.0 {
            return Err(BenchError::Validation(format!(
                "drive frequency must be positive, got {f_khz} kHz"
            )));
        }
        if autoset_capacitance {
            let inductance = self.state.lock().unwrap().inductance_h;
            let target = physics::capacitance_for_resonance(f_khz * 1e3, inductance) * 1e12;
            let combination = self.cap_bank.pick(target);
            self.state.lock().unwrap().capacitance_pf = combination.total;
        }
        self.state.lock().unwrap().drive_freq_khz = f_khz;
        Ok(())
    }

    async fn read_frequency(&self) -> Result<f64> {
        Ok(self.state.lock().unwrap().drive_freq_khz)
    }

    async fn set_capacitance(&self, target_pf: f64) -> Result<f64> {
        let combination = self.cap_bank.pick(target_pf);
        self.state.lock().unwrap().capacitance_pf = combination.total;
        Ok(combination.total)
    }

    async fn set_resistance(&self, target_ohm: f64) -> Result<f64> {
        let combination = self.res_bank.pick(target_ohm);
        self.state.lock().unwrap().resistance_ohm = combination.total;
        Ok(combination.total)
    }

    async fn trigger_frequency_generation(&self, on: bool) -> Result<()> {
        self.state.lock().unwrap().gate_on = on;
        Ok(())
    }

    async fn capacitance(&self) -> f64 {
        self.state.lock().unwrap().capacitance_pf
    }

    async fn capacitance_combinations(&self, lo_pf: f64, hi_pf: f64) -> Vec<f64> {
        self.cap_bank
            .combinations_in(lo_pf, hi_pf)
            .into_iter()
            .map(|c| c.total)
            .collect()
    }

    async fn resistance_combinations(&self, lo_ohm: f64, hi_ohm: f64) -> Vec<f64> {
        self.res_bank
            .combinations_in(lo_ohm, hi_ohm)
            .into_iter()
            .map(|c| c.total)
            .collect()
    }
}

/// Oscilloscope stand-in for an absent VISA transport.
pub struct NullScope;

impl NullScope {
    /// Log the substitution once.
    pub fn substitute(reason: &str) -> Self {
        warn!("Oscilloscope unavailable ({reason}), substituting inert driver");
        NullScope
    }
}

#[async_trait]
impl Oscilloscope for NullScope {
    async fn get_data(&self, _channel: u8) -> Result<Waveform> {
        Ok(Waveform {
            times: (0..WAVEFORM_POINTS).map(|i| i as f64).collect(),
            volts: vec![0.0; WAVEFORM_POINTS],
            time_unit: TimeUnit::Micro,
        })
    }

    async fn measure(&self, _kind: MeasureKind, _channel: u8) -> Result<f64> {
        Ok(0.0)
    }

    async fn auto_scale(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Power source stand-in for an absent serial transport.
pub struct NullSource {
    intent: Mutex<[bool; 2]>,
}

impl NullSource {
    /// Log the substitution once.
    pub fn substitute(reason: &str) -> Self {
        warn!("Power source unavailable ({reason}), substituting inert driver");
        NullSource {
            intent: Mutex::new([false, false]),
        }
    }
}

#[async_trait]
impl PowerSource for NullSource {
    async fn limits(&self) -> Result<SourceLimits> {
        Ok(SIM_LIMITS)
    }

    async fn read_values(&self, _channel: SourceChannel) -> Result<SourceReading> {
        Ok(SourceReading {
            voltage_v: 0.0,
            current_a: 0.0,
            mode: SourceMode::ConstantVoltage,
        })
    }

    async fn set_voltage(&self, _channel: SourceChannel, volts: f64) -> Result<f64> {
        Ok((volts.clamp(0.0, SIM_LIMITS.voltage_max_v) * 10.0).round() / 10.0)
    }

    async fn set_current(&self, _channel: SourceChannel, amps: f64) -> Result<f64> {
        Ok((amps.clamp(0.0, SIM_LIMITS.current_max_a) * 10.0).round() / 10.0)
    }

    async fn output(&self, channel: SourceChannel, on: bool) -> Result<()> {
        let slot = match channel {
            SourceChannel::Hf => 0,
            SourceChannel::Bias => 1,
        };
        self.intent.lock().unwrap()[slot] = on;
        Ok(())
    }

    async fn is_output_on(&self, channel: SourceChannel) -> bool {
        let slot = match channel {
            SourceChannel::Hf => 0,
            SourceChannel::Bias => 1,
        };
        self.intent.lock().unwrap()[slot]
    }
}

/// Drive controller stand-in for an absent serial transport.
pub struct NullDrive {
    frequency_khz: Mutex<f64>,
    capacitance_pf: Mutex<f64>,
}

impl NullDrive {
    /// Log the substitution once.
    pub fn substitute(reason: &str) -> Self {
        warn!("Microcontroller unavailable ({reason}), substituting inert driver");
        NullDrive {
            frequency_khz: Mutex::new(1000.0),
            capacitance_pf: Mutex::new(0.0),
        }
    }
}

#[async_trait]
impl DriveController for NullDrive {
    async fn set_frequency(&self, f_khz: f64, _autoset_capacitance: bool) -> Result<()> {
        *self.frequency_khz.lock().unwrap() = f_khz;
        Ok(())
    }

    async fn read_frequency(&self) -> Result<f64> {
        Ok(*self.frequency_khz.lock().unwrap())
    }

    async fn set_capacitance(&self, target_pf: f64) -> Result<f64> {
        *self.capacitance_pf.lock().unwrap() = target_pf;
        Ok(target_pf)
    }

    async fn set_resistance(&self, target_ohm: f64) -> Result<f64> {
        Ok(target_ohm)
    }

    async fn trigger_frequency_generation(&self, _on: bool) -> Result<()> {
        Ok(())
    }

    async fn capacitance(&self) -> f64 {
        *self.capacitance_pf.lock().unwrap()
    }

    async fn capacitance_combinations(&self, _lo_pf: f64, _hi_pf: f64) -> Vec<f64> {
        Vec::new()
    }

    async fn resistance_combinations(&self, _lo_ohm: f64, _hi_ohm: f64) -> Vec<f64> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GlobalParams {
        GlobalParams {
            base_capacitance_pf: 33.0,
            capacitances_pf: vec![47.0, 100.0, 220.0, 470.0, 1000.0, 2200.0],
            arduino_pins: vec![2, 3, 4, 5, 6, 7],
            coil_inductance_mh: 1.44,
            circuit_resistance_ohm: 10.0,
            pickup_windings: 50.0,
            pickup_radius_mm: 2.5,
            pid: (0.5, 0.2, 0.0),
            saving_path: "data".into(),
            calibration_path: "usr/resonance_calibration.csv".into(),
        }
    }

    #[tokio::test]
    async fn pickup_voltage_matches_the_induction_law() {
        let bench = SimulatedBench::new(&params()).unwrap();
        let scope = bench.scope();
        let source = bench.source();
        let drive = bench.drive();

        drive.set_frequency(100.0, false).await.unwrap();
        source.set_voltage(SourceChannel::Hf, 8.0).await.unwrap();
        source.output(SourceChannel::Hf, true).await.unwrap();

        let vmax = scope.measure(MeasureKind::Vmax, 1).await.unwrap();
        let p = params();
        let field_mt = physics::field_from_induced_voltage(
            p.pickup_windings,
            p.pickup_radius_m(),
            vmax,
            100.0e3,
        ) * 1e3;
        // Default gain is 1 mT per drive volt.
        assert!((field_mt - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn outputs_off_mean_no_field_and_no_current() {
        let bench = SimulatedBench::new(&params()).unwrap();
        let scope = bench.scope();
        let source = bench.source();
        source.set_voltage(SourceChannel::Hf, 8.0).await.unwrap();

        assert_eq!(scope.measure(MeasureKind::Vmax, 1).await.unwrap(), 0.0);
        let reading = source.read_values(SourceChannel::Hf).await.unwrap();
        assert_eq!(reading.current_a, 0.0);
    }

    #[tokio::test]
    async fn tank_current_peaks_at_the_switched_resonance() {
        let bench = SimulatedBench::new(&params()).unwrap();
        let source = bench.source();
        let drive = bench.drive();
        source.set_voltage(SourceChannel::Hf, 10.0).await.unwrap();
        source.output(SourceChannel::Hf, true).await.unwrap();

        let switched = drive.set_capacitance(1700.0).await.unwrap();
        let f0 = physics::resonance_frequency(switched * 1e-12, 1.44e-3) / 1e3;

        drive.set_frequency(f0, false).await.unwrap();
        let on_peak = source.read_values(SourceChannel::Hf).await.unwrap().current_a;
        drive.set_frequency(f0 + 30.0, false).await.unwrap();
        let detuned = source.read_values(SourceChannel::Hf).await.unwrap().current_a;

        assert!((on_peak - 1.0).abs() < 1e-9, "peak current is V/R, got {on_peak}");
        assert!(detuned < on_peak / 5.0, "30 kHz off peak: {detuned}");
    }

    #[tokio::test]
    async fn device_response_peaks_at_the_optimum_bias() {
        let bench = SimulatedBench::new(&params()).unwrap();
        let scope = bench.scope();
        let source = bench.source();
        let drive = bench.drive();

        source.set_voltage(SourceChannel::Hf, 10.0).await.unwrap();
        source.output(SourceChannel::Hf, true).await.unwrap();
        source.output(SourceChannel::Bias, true).await.unwrap();
        let switched = drive.set_capacitance(1700.0).await.unwrap();
        let f0 = physics::resonance_frequency(switched * 1e-12, 1.44e-3) / 1e3;
        drive.set_frequency(f0, false).await.unwrap();

        // Default optimum is 4 mT at 10 mT/A = 0.4 A.
        let mut best = (0.0, 0.0);
        for current in [0.0, 0.2, 0.4, 0.6, 0.8] {
            source.set_current(SourceChannel::Bias, current).await.unwrap();
            let v = scope.measure(MeasureKind::Vmax, 2).await.unwrap();
            if v > best.1 {
                best = (current, v);
            }
        }
        assert_eq!(best.0, 0.4);
    }

    #[tokio::test]
    async fn removing_the_device_leaves_only_feedthrough() {
        let bench = SimulatedBench::new(&params()).unwrap();
        let scope = bench.scope();
        let source = bench.source();
        source.set_voltage(SourceChannel::Hf, 10.0).await.unwrap();
        source.output(SourceChannel::Hf, true).await.unwrap();

        let with_device = scope.measure(MeasureKind::Vmax, 2).await.unwrap();
        bench.set_device_inserted(false);
        let without = scope.measure(MeasureKind::Vmax, 2).await.unwrap();

        assert!(with_device > without);
        assert!((without - 0.1).abs() < 1e-9, "feedthrough only: {without}");
    }

    #[tokio::test]
    async fn waveform_amplitude_matches_the_scalar_measurement() {
        let bench = SimulatedBench::new(&params()).unwrap();
        let scope = bench.scope();
        let source = bench.source();
        let drive = bench.drive();
        drive.set_frequency(100.0, false).await.unwrap();
        source.set_voltage(SourceChannel::Hf, 5.0).await.unwrap();
        source.output(SourceChannel::Hf, true).await.unwrap();

        let vmax = scope.measure(MeasureKind::Vmax, 1).await.unwrap();
        let waveform = scope.get_data(1).await.unwrap();
        let peak = waveform.volts.iter().cloned().fold(f64::MIN, f64::max);
        assert!((peak - vmax).abs() / vmax < 0.01);
        assert_eq!(waveform.times.len(), waveform.volts.len());
        assert_eq!(waveform.time_unit, TimeUnit::Micro);
    }

    #[tokio::test]
    async fn null_drivers_answer_with_placeholders() {
        let scope = NullScope::substitute("test");
        let source = NullSource::substitute("test");
        let drive = NullDrive::substitute("test");

        assert_eq!(scope.measure(MeasureKind::Vmax, 1).await.unwrap(), 0.0);
        assert_eq!(scope.get_data(1).await.unwrap().volts.len(), WAVEFORM_POINTS);

        assert!(!source.is_output_on(SourceChannel::Hf).await);
        source.output(SourceChannel::Hf, true).await.unwrap();
        assert!(source.is_output_on(SourceChannel::Hf).await);
        assert_eq!(source.set_voltage(SourceChannel::Hf, 12.34).await.unwrap(), 12.3);

        drive.set_frequency(250.0, true).await.unwrap();
        assert_eq!(drive.read_frequency().await.unwrap(), 250.0);
        assert!(drive.capacitance_combinations(0.0, 1e6).await.is_empty());
    }
}
