//! Closed-loop magnetic field regulation.
//!
//! The AC field at the device is not measured directly; the pickup coil
//! voltage is converted to |B| through the induction law and a PID loop
//! drives the HF source voltage until that field holds a target. One
//! iteration is: read the pickup Vmax, convert to mT, feed the PID, clamp
//! its output into `[1 V, v_max]`, round to 0.01 V, program the source and
//! sleep 50 ms.
//!
//! The loop succeeds once the measured field has stayed within 3 % of the
//! target for five consecutive iterations. An optional time budget turns a
//! stuck loop into [`BenchError::RegulatorNotConverged`], which sweeps log
//! as a warning and carry on at the last voltage. A kill signal aborts the
//! loop and de-energizes the HF output.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::data::table::ResultTable;
use crate::error::{BenchError, Result};
use crate::instruments::{
    MeasureKind, Oscilloscope, PowerSource, SourceChannel, PICKUP_CHANNEL,
};
use crate::physics;
use crate::settings::GlobalParams;

/// Pause between regulator iterations.
const LOOP_SLEEP: Duration = Duration::from_millis(50);

/// Relative band around the target that counts as converged.
const CONVERGENCE_BAND: f64 = 0.03;

/// Iterations the band must hold, consecutively.
const REQUIRED_IN_BAND: u32 = 5;

/// The source is never driven below this voltage while regulating.
const VOLTAGE_FLOOR_V: f64 = 1.0;

/// Gains, coil geometry and loop limits for one regulation session.
#[derive(Debug, Clone)]
pub struct RegulatorConfig {
    /// PID gains `(kp, ki, kd)`.
    pub gains: (f64, f64, f64),
    /// Pickup coil turns.
    pub windings: f64,
    /// Pickup coil radius in m.
    pub radius_m: f64,
    /// Voltage compliance; the PID output ceiling.
    pub voltage_max_v: f64,
    /// Give up after this long; `None` regulates until converged or
    /// killed.
    pub budget: Option<Duration>,
}

impl RegulatorConfig {
    /// Config from the bench globals plus the sweep's voltage compliance.
    pub fn from_globals(
        params: &GlobalParams,
        voltage_max_v: f64,
        budget: Option<Duration>,
    ) -> Self {
        RegulatorConfig {
            gains: params.pid,
            windings: params.pickup_windings,
            radius_m: params.pickup_radius_m(),
            voltage_max_v,
            budget,
        }
    }
}

/// Result of a successful regulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegulatorOutcome {
    /// Voltage the source was left at.
    pub voltage_v: f64,
    /// Time from the first iteration to convergence.
    pub elapsed: Duration,
}

/// PID field regulator over a scope and a source.
pub struct FieldRegulator {
    scope: Arc<dyn Oscilloscope>,
    source: Arc<dyn PowerSource>,
    config: RegulatorConfig,
    kill: watch::Receiver<bool>,
}

impl FieldRegulator {
    /// Wire the regulator to its instruments.
    pub fn new(
        scope: Arc<dyn Oscilloscope>,
        source: Arc<dyn PowerSource>,
        config: RegulatorConfig,
        kill: watch::Receiver<bool>,
    ) -> Self {
        FieldRegulator {
            scope,
            source,
            config,
            kill,
        }
    }

    /// Drive the field to `target_mt` at the current drive frequency.
    ///
    /// The HF output must already be energized; the drive frequency is
    /// needed to convert the pickup voltage to a field.
    pub async fn regulate(&self, target_mt: f64, f_khz: f64) -> Result<RegulatorOutcome> {
        self.run_loop(target_mt, f_khz, |_, _| ()).await
    }

    /// Same loop, recording `(seconds since start, field mT)` every
    /// iteration for tuning plots. A blown budget still returns the
    /// samples.
    pub async fn record_transient(
        &self,
        target_mt: f64,
        f_khz: f64,
    ) -> Result<Vec<(f64, f64)>> {
        let mut samples = Vec::new();
        match self
            .run_loop(target_mt, f_khz, |t, b| samples.push((t, b)))
            .await
        {
            Ok(_) => Ok(samples),
            Err(BenchError::RegulatorNotConverged(budget)) => {
                warn!(?budget, "transient recording stopped before convergence");
                Ok(samples)
            }
            Err(e) => Err(e),
        }
    }

    /// Table of a recorded transient, for persisting tuning runs.
    pub fn transient_table(samples: &[(f64, f64)]) -> ResultTable {
        let mut table = ResultTable::new(&[("time_s", "s"), ("Magnetic Field", "mT")]);
        for &(t, b) in samples {
            // Both cells always present, so the push cannot fail.
            let _ = table.push_values(&[t, b]);
        }
        table
    }

    async fn run_loop(
        &self,
        target_mt: f64,
        f_khz: f64,
        mut on_sample: impl FnMut(f64, f64),
    ) -> Result<RegulatorOutcome> {
        if !(target_mt.is_finite() && target_mt > 0.0) {
            return Err(BenchError::Validation(format!(
                "field target must be positive, got {target_mt} mT"
            )));
        }
        let (kp, ki, kd) = self.config.gains;
        let dt = LOOP_SLEEP.as_secs_f64();
        let start = tokio::time::Instant::now();

        let mut integral = 0.0;
        let mut previous_error: Option<f64> = None;
        let mut in_band = 0u32;
        let mut voltage = 0.0;

        loop {
            if *self.kill.borrow() {
                self.source.output(SourceChannel::Hf, false).await?;
                return Err(BenchError::Cancelled);
            }
            if let Some(budget) = self.config.budget {
                if start.elapsed() > budget {
                    return Err(BenchError::RegulatorNotConverged(budget));
                }
            }

            let vmax = self.scope.measure(MeasureKind::Vmax, PICKUP_CHANNEL).await?;
            let field_mt = physics::field_from_induced_voltage(
                self.config.windings,
                self.config.radius_m,
                vmax,
                f_khz * 1e3,
            ) * 1e3;
            on_sample(start.elapsed().as_secs_f64(), field_mt);

            if (field_mt - target_mt).abs() <= CONVERGENCE_BAND * target_mt {
                in_band += 1;
                if in_band >= REQUIRED_IN_BAND {
                    let elapsed = start.elapsed();
                    debug!(
                        target_mt,
                        voltage, ?elapsed, "field regulator converged"
                    );
                    return Ok(RegulatorOutcome {
                        voltage_v: voltage,
                        elapsed,
                    });
                }
            } else {
                in_band = 0;
            }

            let error = target_mt - field_mt;
            integral += error * dt;
            let derivative = previous_error.map_or(0.0, |prev| (error - prev) / dt);
            previous_error = Some(error);

            let output = kp * error + ki * integral + kd * derivative;
            let clamped = output.clamp(VOLTAGE_FLOOR_V, self.config.voltage_max_v);
            let rounded = (clamped * 100.0).round() / 100.0;
            voltage = self.source.set_voltage(SourceChannel::Hf, rounded).await?;

            tokio::time::sleep(LOOP_SLEEP).await;
        }
    }
}
