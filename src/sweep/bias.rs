//! DC bias scan.
//!
//! The HF drive sits at a fixed frequency while the second source channel
//! steps a DC field through the bias coil, `arange(b_min, b_max + step,
//! step)` inclusive of the upper edge. The coil current is the field
//! magnitude over the coil constant; the supply is single-quadrant, so the
//! table keeps the signed axis while both polarities draw the same current.
//! After the sweep the optimum bias lands in header line 1.

use crate::data::table::ResultTable;
use crate::error::Result;
use crate::instruments::{MeasureKind, SourceChannel, DEVICE_CHANNEL};
use crate::messages::PlotSeries;
use crate::sweep::params::BiasScanParams;
use crate::sweep::{SweepContext, SweepOutcome};

/// File suffix for this variant.
pub const SUFFIX: &str = "bias_scan";
/// HF channel current compliance during the scan, ampere.
const HF_CURRENT_LIMIT_A: f64 = 2.0;

/// Step the DC bias field and report the optimum in the file header.
pub async fn run(params: &BiasScanParams, context: &SweepContext) -> Result<SweepOutcome> {
    params.validate()?;

    let mut table = ResultTable::new(&[
        ("Bias Field", "mT"),
        ("Bias Current", "A"),
        ("Voltage", "V"),
        ("Current", "A"),
        ("ME Voltage", "V"),
    ]);
    let mut response: Vec<(f64, f64)> = Vec::new();

    let body = measure(params, context, &mut table, &mut response).await;

    if let Some((field_mt, current_a)) = optimum_bias(&response, params) {
        table.push_header_line(format!(
            "Optimum Bias Field: {field_mt} mT At a Current of: {current_a} A"
        ));
    }
    table.push_header_line(format!(
        "Bias scan {}-{} mT step {} mT at {} kHz, drive {} V",
        params.b_min_mt, params.b_max_mt, params.b_step_mt, params.frequency_khz,
        params.drive_voltage_v
    ));

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

/// Field at peak ME voltage and the matching coil current. Ties take the
/// median sample of the top-valued set; the axis order is ascending, so
/// the tie list already is.
fn optimum_bias(response: &[(f64, f64)], params: &BiasScanParams) -> Option<(f64, f64)> {
    let peak = response
        .iter()
        .map(|&(_, v)| v)
        .fold(f64::NEG_INFINITY, f64::max);
    if !peak.is_finite() {
        return None;
    }
    let top: Vec<f64> = response
        .iter()
        .filter(|&&(_, v)| v == peak)
        .map(|&(b, _)| b)
        .collect();
    let field = median(&top)?;
    Some((field, params.current_for(field)))
}

fn median(values: &[f64]) -> Option<f64> {
    match values.len() {
        0 => None,
        n if n % 2 == 1 => Some(values[n / 2]),
        n => Some((values[n / 2 - 1] + values[n / 2]) / 2.0),
    }
}

async fn measure(
    params: &BiasScanParams,
    context: &SweepContext,
    table: &mut ResultTable,
    response: &mut Vec<(f64, f64)>,
) -> Result<()> {
    let axis = params.axis();
    if axis.is_empty() {
        context.warn("bias axis is empty, nothing to scan");
        return Ok(());
    }

    context
        .drive
        .set_frequency(params.frequency_khz, false)
        .await?;
    context
        .energize_hf(params.drive_voltage_v, HF_CURRENT_LIMIT_A)
        .await?;
    // Bias channel runs in current mode: voltage pinned at compliance,
    // current stepped per axis value.
    let limits = context.source.limits().await?;
    context
        .source
        .set_voltage(SourceChannel::Bias, limits.voltage_max_v)
        .await?;
    context.source.set_current(SourceChannel::Bias, 0.0).await?;
    context.source.output(SourceChannel::Bias, true).await?;

    let total = axis.len();
    for (done, &b_mt) in axis.iter().enumerate() {
        context.check_kill()?;
        let applied_a = context
            .source
            .set_current(SourceChannel::Bias, params.current_for(b_mt))
            .await?;
        context.settle(params.settling()).await;

        let reading = context.source.read_values(SourceChannel::Hf).await?;
        let me_v = context
            .scope
            .measure(MeasureKind::Vmax, DEVICE_CHANNEL)
            .await?;
        table.push_values(&[b_mt, applied_a, reading.voltage_v, reading.current_a, me_v])?;
        response.push((b_mt, me_v));

        context.progress(done + 1, total);
        let (b, me) = table.xy(0, 4);
        let (_, i_hf) = table.xy(0, 3);
        context.plot(vec![
            PlotSeries::new("ME Voltage", b.clone(), me),
            PlotSeries::new("Current", b, i_hf),
        ]);
    }
    Ok(())
}
