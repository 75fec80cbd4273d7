//! The sweep engine.
//!
//! Every measurement procedure follows the same skeleton: prepare the
//! instruments, walk a control axis while appending rows and emitting
//! progress, and restore the bench to a safe idle state. The restore step
//! runs on every exit path, including errors and cancellation, so a failed
//! or killed sweep can never leave the outputs energized.
//!
//! # Flow
//!
//! ```text
//! host                       dispatcher (run)            variant body
//! ----                       ----------------            ------------
//! SweepRequest  ----------->  log, match variant  ----->  prepare
//!                                                         iterate + rows
//! BenchEvent::* <-----------------------------------      progress/plots
//!                             restore_idle (always)
//! Result<SweepOutcome> <----  log outcome
//! ```
//!
//! Variant bodies run their own persistence before returning so a partial
//! table survives a mid-sweep failure; the dispatcher only guarantees the
//! hardware restore.

pub mod amplitude;
pub mod bias;
pub mod capacitance;
pub mod frequency;
pub mod lifetime;
pub mod params;
pub mod power;
pub mod pulse;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::data::table::ResultTable;
use crate::data::writer;
use crate::error::{BenchError, Result};
use crate::instruments::{
    DriveController, Oscilloscope, PowerSource, SourceChannel, PICKUP_CHANNEL,
};
use crate::messages::{BenchEvent, BenchState, OperatorReply, PlotSeries, PlotUpdate};
use crate::physics;
use crate::regulator::FieldRegulator;
use crate::settings::GlobalParams;
use crate::sweep::params::SetupParams;

/// Voltage setpoint left on the source after any sweep, volts.
pub const IDLE_VOLTAGE_V: f64 = 5.0;
/// Drive frequency restored after any sweep, kHz.
pub const IDLE_FREQUENCY_KHZ: f64 = 1000.0;
/// Poll interval for kill-aware waits, also the pulse transition clock.
const WAIT_POLL: Duration = Duration::from_millis(10);
/// Moving-average window for waveform smoothing in the HF and lifetime
/// scans.
pub(crate) const SMOOTHING_WINDOW: usize = 20;

/// Everything a sweep body needs: instruments, bench parameters, the event
/// channel towards the host and the kill flag.
pub struct SweepContext {
    pub scope: Arc<dyn Oscilloscope>,
    pub source: Arc<dyn PowerSource>,
    pub drive: Arc<dyn DriveController>,
    pub globals: GlobalParams,
    pub setup: SetupParams,
    pub events: mpsc::UnboundedSender<BenchEvent>,
    pub kill: watch::Receiver<bool>,
}

/// What a finished sweep hands back to the host.
#[derive(Debug)]
pub struct SweepOutcome {
    /// Measurement files written, main table first.
    pub files: Vec<PathBuf>,
    /// Data rows across all files.
    pub rows: usize,
}

impl SweepContext {
    /// Send an event; a host that went away is not an error.
    pub fn emit(&self, event: BenchEvent) {
        let _ = self.events.send(event);
    }

    /// Log a warning and surface it to the host.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.emit(BenchEvent::Warning(message));
    }

    /// Report `done` of `total` steps as a percentage.
    pub fn progress(&self, done: usize, total: usize) {
        self.emit(BenchEvent::progress(done, total));
    }

    /// Push fresh curves to the host plot.
    pub fn plot(&self, series: Vec<PlotSeries>) {
        self.emit(BenchEvent::Plot(PlotUpdate { series }));
    }

    /// True once the host has asked the sweep to stop.
    pub fn killed(&self) -> bool {
        *self.kill.borrow()
    }

    /// Iteration-boundary cancellation check.
    pub fn check_kill(&self) -> Result<()> {
        if self.killed() {
            Err(BenchError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Settling pause between applying a value and reading.
    pub async fn settle(&self, pause: Duration) {
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    /// Kill-aware wait until `deadline`, polling every 10 ms.
    pub async fn wait_until(&self, deadline: Instant) -> Result<()> {
        loop {
            self.check_kill()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(WAIT_POLL.min(deadline - now)).await;
        }
    }

    /// Block the sweep until the operator answers the prompt.
    ///
    /// `Abort`, a vanished host and a kill during the pause all unwind the
    /// sweep through its finalize path.
    pub async fn pause_for_operator(&self, message: impl Into<String>) -> Result<()> {
        let (event, reply) = BenchEvent::pause_request(message);
        self.emit(BenchEvent::State(BenchState::PausedForOperator));
        if self.events.send(event).is_err() {
            return Err(BenchError::OperatorAbort);
        }
        let mut kill = self.kill.clone();
        let answer = tokio::select! {
            answer = reply => answer.map_err(|_| BenchError::OperatorAbort)?,
            _ = kill.wait_for(|k| *k) => return Err(BenchError::Cancelled),
        };
        self.emit(BenchEvent::State(BenchState::SweepRunning));
        match answer {
            OperatorReply::Continue => Ok(()),
            OperatorReply::Abort => Err(BenchError::OperatorAbort),
        }
    }

    /// Program the HF channel and switch it on.
    pub async fn energize_hf(&self, voltage_v: f64, current_a: f64) -> Result<()> {
        self.source.set_voltage(SourceChannel::Hf, voltage_v).await?;
        self.source.set_current(SourceChannel::Hf, current_a).await?;
        self.source.output(SourceChannel::Hf, true).await?;
        Ok(())
    }

    /// Pickup-coil field in mT at the given drive frequency.
    pub async fn read_field_mt(&self, f_khz: f64) -> Result<f64> {
        let v_peak = self
            .scope
            .measure(crate::instruments::MeasureKind::Vmax, PICKUP_CHANNEL)
            .await?;
        Ok(physics::field_from_induced_voltage(
            self.globals.pickup_windings,
            self.globals.pickup_radius_m(),
            v_peak,
            f_khz * 1e3,
        ) * 1e3)
    }

    /// Reconverge the field regulator, downgrading a blown budget to a
    /// warning so the sweep continues at the last voltage.
    pub async fn reconverge(
        &self,
        regulator: &FieldRegulator,
        target_mt: f64,
        f_khz: f64,
    ) -> Result<()> {
        match regulator.regulate(target_mt, f_khz).await {
            Ok(_) => Ok(()),
            Err(BenchError::RegulatorNotConverged(budget)) => {
                self.warn(format!(
                    "field regulator did not converge within {budget:?}, continuing at the last voltage"
                ));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Collision-free output path for this run and the given suffix.
    pub fn output_path(&self, suffix: &str) -> PathBuf {
        let folder = self
            .setup
            .folder
            .clone()
            .unwrap_or_else(|| self.globals.saving_path.clone());
        writer::measurement_path(
            &folder,
            chrono::Local::now().date_naive(),
            &self.setup.batch_name,
            self.setup.device_number,
            Some(suffix),
        )
    }

    /// Resolve the output path for this sweep and write the table.
    pub fn persist(&self, suffix: &str, table: &ResultTable) -> Result<PathBuf> {
        let path = self.output_path(suffix);
        writer::write_table(&path, table)?;
        Ok(path)
    }

    /// Best-effort return to the idle state: outputs off, source setpoint
    /// back at 5 V, drive back at 1000 kHz on the base capacitance, gate
    /// enabled. Failures are logged and the remaining steps still run.
    pub async fn restore_idle(&self) {
        for channel in [SourceChannel::Hf, SourceChannel::Bias] {
            if let Err(e) = self.source.output(channel, false).await {
                tracing::warn!(?channel, error = %e, "restore: output off failed");
            }
        }
        if let Err(e) = self
            .source
            .set_voltage(SourceChannel::Hf, IDLE_VOLTAGE_V)
            .await
        {
            tracing::warn!(error = %e, "restore: idle voltage failed");
        }
        if let Err(e) = self
            .drive
            .set_capacitance(self.globals.base_capacitance_pf)
            .await
        {
            tracing::warn!(error = %e, "restore: base capacitance failed");
        }
        if let Err(e) = self.drive.set_frequency(IDLE_FREQUENCY_KHZ, false).await {
            tracing::warn!(error = %e, "restore: idle frequency failed");
        }
        if let Err(e) = self.drive.trigger_frequency_generation(true).await {
            tracing::warn!(error = %e, "restore: gate enable failed");
        }
    }
}

/// Execute one sweep request. The idle restore runs whatever the body
/// returned; the body's own error wins over any restore noise.
pub async fn run(
    request: crate::messages::SweepRequest,
    context: &SweepContext,
) -> Result<SweepOutcome> {
    use crate::messages::SweepRequest;

    let label = request.label();
    tracing::info!(sweep = label, "sweep starting");
    let started = Instant::now();

    let result = match request {
        SweepRequest::Frequency(p) => frequency::run(&p, context).await,
        SweepRequest::Capacitance(p) => capacitance::run(&p, context).await,
        SweepRequest::DcBias(p) => bias::run(&p, context).await,
        SweepRequest::HfAmplitude(p) => amplitude::run(&p, context).await,
        SweepRequest::Lifetime(p) => lifetime::run(&p, context).await,
        SweepRequest::Power(p) => power::run(&p, context).await,
        SweepRequest::Pulse(p) => pulse::run(&p, context).await,
    };

    context.restore_idle().await;

    match &result {
        Ok(outcome) => tracing::info!(
            sweep = label,
            rows = outcome.rows,
            elapsed_s = started.elapsed().as_secs_f64(),
            "sweep finished"
        ),
        Err(e) if e.is_cancellation() => {
            tracing::info!(sweep = label, "sweep cancelled, bench restored")
        }
        Err(e) => tracing::error!(sweep = label, error = %e, "sweep failed, bench restored"),
    }
    result
}
