//! Pulsed endurance sweep.
//!
//! Executes an ordered schedule of `(t_end, signal, dc_field, hf_field,
//! frequency)` rows against the wall clock. Row `i` is active from the
//! previous row's end until `t_end`; ON rows apply their drive parameters
//! and open the gate, OFF rows close it. Transitions are polled at 10 ms.
//! During an OFF window whose successor needs different parameters, those
//! parameters are applied once during the last second of the window, so
//! the following ON starts on target instead of slewing.

use std::time::Duration;

use tokio::time::Instant;

use crate::data::table::ResultTable;
use crate::error::Result;
use crate::instruments::SourceChannel;
use crate::messages::PlotSeries;
use crate::sweep::params::{PulseRow, PulseScheduleParams};
use crate::sweep::{SweepContext, SweepOutcome};

/// File suffix for this variant.
pub const SUFFIX: &str = "pulse";
/// HF channel current compliance during the schedule, ampere.
const HF_CURRENT_LIMIT_A: f64 = 2.0;
/// How early before an OFF window ends the next parameters are applied.
const PREPARE_LEAD: Duration = Duration::from_secs(1);

/// Execute the schedule against the wall clock.
pub async fn run(params: &PulseScheduleParams, context: &SweepContext) -> Result<SweepOutcome> {
    params.validate()?;

    let mut table = ResultTable::new(&[
        ("Time", "s"),
        ("Signal", "-"),
        ("DC Field", "mT"),
        ("HF Voltage", "V"),
        ("Frequency", "kHz"),
    ]);
    table.push_header_line(format!(
        "Pulse schedule, {} rows over {} s",
        params.rows.len(),
        params.rows.last().map(|r| r.t_end_s).unwrap_or(0.0)
    ));

    let body = execute(params, context, &mut table).await;
    let persisted = if body.is_ok() || !table.is_empty() {
        Some(context.persist(SUFFIX, &table))
    } else {
        None
    };
    body?;
    let files = persisted.transpose()?.into_iter().collect();
    Ok(SweepOutcome {
        files,
        rows: table.len(),
    })
}

/// Apply one row's drive parameters: bias coil current, HF amplitude and
/// drive frequency, all open-loop.
async fn apply_drive(
    context: &SweepContext,
    params: &PulseScheduleParams,
    row: &PulseRow,
) -> Result<()> {
    context
        .source
        .set_current(
            SourceChannel::Bias,
            row.dc_field_mt.abs() / params.bias_coil_mt_per_a,
        )
        .await?;
    context
        .source
        .set_voltage(SourceChannel::Hf, row.hf_field_v)
        .await?;
    context.drive.set_frequency(row.frequency_khz, false).await?;
    Ok(())
}

async fn execute(
    params: &PulseScheduleParams,
    context: &SweepContext,
    table: &mut ResultTable,
) -> Result<()> {
    // Bias channel in current mode, HF energized; the gate alone decides
    // whether the device sees drive.
    let limits = context.source.limits().await?;
    context
        .source
        .set_voltage(SourceChannel::Bias, limits.voltage_max_v)
        .await?;
    context.source.set_current(SourceChannel::Bias, 0.0).await?;
    context.source.output(SourceChannel::Bias, true).await?;
    context
        .source
        .set_current(SourceChannel::Hf, HF_CURRENT_LIMIT_A)
        .await?;
    context.source.output(SourceChannel::Hf, true).await?;

    let start = Instant::now();
    let total = params.rows.len();
    // Drive settings currently on the instruments, updated on every
    // apply, including pre-applies.
    let mut applied: Option<(f64, f64, f64)> = None;
    let mut gate_trace: Vec<(f64, f64)> = Vec::new();
    let mut field_trace: Vec<(f64, f64)> = Vec::new();

    for (index, row) in params.rows.iter().enumerate() {
        context.check_kill()?;
        let elapsed = start.elapsed().as_secs_f64();

        match row.gate() {
            Some(true) => {
                if applied != Some(row.drive_settings()) {
                    apply_drive(context, params, row).await?;
                    applied = Some(row.drive_settings());
                }
                context.drive.trigger_frequency_generation(true).await?;
                tracing::debug!(t = elapsed, "pulse gate on");
                table.push_values(&[
                    elapsed,
                    1.0,
                    row.dc_field_mt,
                    row.hf_field_v,
                    row.frequency_khz,
                ])?;
                gate_trace.push((elapsed, 1.0));
                field_trace.push((elapsed, row.dc_field_mt));
            }
            Some(false) => {
                context.drive.trigger_frequency_generation(false).await?;
                tracing::debug!(t = elapsed, "pulse gate off");
                table.push_values(&[
                    elapsed,
                    0.0,
                    row.dc_field_mt,
                    row.hf_field_v,
                    row.frequency_khz,
                ])?;
                gate_trace.push((elapsed, 0.0));
                field_trace.push((elapsed, row.dc_field_mt));
            }
            None => {
                context.warn(format!(
                    "pulse row {}: unknown signal '{}', skipped",
                    index + 1,
                    row.signal
                ));
            }
        }

        let window_end = start + Duration::from_secs_f64(row.t_end_s);

        // In an OFF window, stage the successor's parameters during the
        // last second so the next ON fires already on target.
        if row.gate() == Some(false) {
            if let Some(next) = params.rows.get(index + 1) {
                if applied != Some(next.drive_settings()) {
                    let stage_at = window_end
                        .checked_sub(PREPARE_LEAD)
                        .unwrap_or_else(Instant::now);
                    context.wait_until(stage_at).await?;
                    apply_drive(context, params, next).await?;
                    applied = Some(next.drive_settings());
                    tracing::debug!(
                        t = start.elapsed().as_secs_f64(),
                        "pre-applied next pulse parameters"
                    );
                }
            }
        }

        context.wait_until(window_end).await?;
        context.progress(index + 1, total);
        let (gt, gv): (Vec<f64>, Vec<f64>) = gate_trace.iter().copied().unzip();
        let (ft, fv): (Vec<f64>, Vec<f64>) = field_trace.iter().copied().unzip();
        context.plot(vec![
            PlotSeries::new("Gate", gt, gv),
            PlotSeries::new("DC Field", ft, fv),
        ]);
    }
    Ok(())
}
