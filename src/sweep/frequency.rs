//! Frequency scan.
//!
//! Walks `arange(f_min, f_max, f_step)` and records, per frequency, the
//! source readback (U, I), the device voltage `Vmax_ind` and the pickup
//! field |B|. Runs fixed-current by default; with `target_field_mt` set it
//! reconverges the field regulator at every step instead of sleeping.

use std::time::Duration;

use crate::data::table::ResultTable;
use crate::error::Result;
use crate::instruments::{MeasureKind, SourceChannel, DEVICE_CHANNEL};
use crate::messages::PlotSeries;
use crate::regulator::{FieldRegulator, RegulatorConfig};
use crate::sweep::params::FrequencyScanParams;
use crate::sweep::{SweepContext, SweepOutcome};

/// File suffix for this variant.
pub const SUFFIX: &str = "freq_scan";
/// Per-step regulator budget in constant-field mode.
const REGULATOR_BUDGET: Duration = Duration::from_secs(30);

/// Step the drive frequency and record one row per step.
pub async fn run(params: &FrequencyScanParams, context: &SweepContext) -> Result<SweepOutcome> {
    params.validate()?;

    let mut table = ResultTable::new(&[
        ("Frequency", "kHz"),
        ("Voltage", "V"),
        ("Current", "A"),
        ("Magnetic Field", "mT"),
        ("Vmax_ind", "V"),
    ]);
    table.push_header_line(match params.target_field_mt {
        Some(target) => format!(
            "Frequency scan {}-{} kHz step {} kHz, constant field {} mT",
            params.f_min_khz, params.f_max_khz, params.f_step_khz, target
        ),
        None => format!(
            "Frequency scan {}-{} kHz step {} kHz, drive {} V / {} A",
            params.f_min_khz,
            params.f_max_khz,
            params.f_step_khz,
            params.drive_voltage_v,
            params.current_limit_a
        ),
    });

    let body = measure(params, context, &mut table).await;
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

async fn measure(
    params: &FrequencyScanParams,
    context: &SweepContext,
    table: &mut ResultTable,
) -> Result<()> {
    let axis = params.axis();
    if axis.is_empty() {
        context.warn("frequency axis is empty, nothing to scan");
        return Ok(());
    }

    context
        .energize_hf(params.drive_voltage_v, params.current_limit_a)
        .await?;
    let regulator = params.target_field_mt.map(|_| {
        FieldRegulator::new(
            context.scope.clone(),
            context.source.clone(),
            RegulatorConfig::from_globals(
                &context.globals,
                params.drive_voltage_v,
                Some(REGULATOR_BUDGET),
            ),
            context.kill.clone(),
        )
    });

    let total = axis.len();
    for (done, &f_khz) in axis.iter().enumerate() {
        context.check_kill()?;
        context
            .drive
            .set_frequency(f_khz, params.autoset_capacitance)
            .await?;
        match (&regulator, params.target_field_mt) {
            (Some(regulator), Some(target)) => {
                context.reconverge(regulator, target, f_khz).await?
            }
            _ => context.settle(params.settling()).await,
        }

        let reading = context.source.read_values(SourceChannel::Hf).await?;
        let v_ind = context
            .scope
            .measure(MeasureKind::Vmax, DEVICE_CHANNEL)
            .await?;
        let field_mt = context.read_field_mt(f_khz).await?;
        table.push_values(&[f_khz, reading.voltage_v, reading.current_a, field_mt, v_ind])?;

        context.progress(done + 1, total);
        let (f, v_ind_trace) = table.xy(0, 4);
        let (_, field_trace) = table.xy(0, 3);
        context.plot(vec![
            PlotSeries::new("Vmax_ind", f.clone(), v_ind_trace),
            PlotSeries::new("Magnetic Field", f, field_trace),
        ]);
    }
    Ok(())
}
