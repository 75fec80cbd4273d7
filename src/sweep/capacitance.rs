//! Capacitance scan with resonance fitting.
//!
//! The outer axis is every reachable capacitor-bank sum inside
//! `[c_min, c_max]`. Each sum is probed over a narrow frequency window
//! around its predicted LC resonance, the tank current trace is fitted to
//! the series-LCR model, and the fitted `(f0, I_max, Q)` lands in a second
//! table persisted with the `resonance_fit` suffix. A failed fit keeps the
//! capacitance row with the fit cells empty.

use crate::data::table::ResultTable;
use crate::error::{BenchError, Result};
use crate::fit::fit_resonance;
use crate::instruments::SourceChannel;
use crate::messages::PlotSeries;
use crate::physics;
use crate::sweep::params::CapacitanceScanParams;
use crate::sweep::{SweepContext, SweepOutcome};

/// File suffix for the per-frequency data table.
pub const SUFFIX: &str = "cap_scan";
/// File suffix for the fitted-resonance table.
pub const RESONANCE_SUFFIX: &str = "resonance_fit";

/// Scan the capacitor combinations and fit each resonance.
pub async fn run(params: &CapacitanceScanParams, context: &SweepContext) -> Result<SweepOutcome> {
    params.validate()?;

    let mut data = ResultTable::new(&[
        ("Capacitance", "pF"),
        ("Frequency", "kHz"),
        ("Voltage", "V"),
        ("Current", "A"),
    ]);
    data.push_header_line(format!(
        "Capacitance scan {}-{} pF, window +-{} kHz, drive {} V",
        params.c_min_pf, params.c_max_pf, params.span_khz, params.drive_voltage_v
    ));
    let mut resonance = ResultTable::new(&[
        ("capacitance_pF", "pF"),
        ("resonance_frequency_kHz", "kHz"),
        ("maximum_current_A", "A"),
        ("quality_factor", "-"),
    ]);
    resonance.push_header_line(format!(
        "Fitted resonances, coil inductance {} mH",
        context.globals.coil_inductance_mh
    ));

    let body = measure(params, context, &mut data, &mut resonance).await;
    let persisted = if body.is_ok() || !data.is_empty() || !resonance.is_empty() {
        Some(persist_both(context, &data, &resonance))
    } else {
        None
    };
    body?;
    let files = persisted.transpose()?.unwrap_or_default();
    Ok(SweepOutcome {
        files,
        rows: data.len() + resonance.len(),
    })
}

fn persist_both(
    context: &SweepContext,
    data: &ResultTable,
    resonance: &ResultTable,
) -> Result<Vec<std::path::PathBuf>> {
    let main = context.persist(SUFFIX, data)?;
    let fit = context.persist(RESONANCE_SUFFIX, resonance)?;
    Ok(vec![main, fit])
}

async fn measure(
    params: &CapacitanceScanParams,
    context: &SweepContext,
    data: &mut ResultTable,
    resonance: &mut ResultTable,
) -> Result<()> {
    let combos = context
        .drive
        .capacitance_combinations(params.c_min_pf, params.c_max_pf)
        .await;
    if combos.is_empty() {
        context.warn("no capacitance combination falls inside the scan range");
        return Ok(());
    }

    context
        .energize_hf(params.drive_voltage_v, params.current_limit_a)
        .await?;

    // Predictions come from the LC formula, so the whole plan (and the
    // progress denominator) is known before the first step.
    let inductance_h = context.globals.coil_inductance_h();
    let plan: Vec<(f64, Vec<f64>)> = combos
        .iter()
        .map(|&c_pf| {
            let predicted_khz = physics::resonance_frequency(c_pf * 1e-12, inductance_h) * 1e-3;
            (c_pf, params.inner_axis(predicted_khz))
        })
        .collect();
    let total: usize = plan.iter().map(|(_, axis)| axis.len().max(1)).sum();
    let mut done = 0usize;
    let mut series: Vec<PlotSeries> = Vec::new();

    for (combo_pf, axis) in &plan {
        context.check_kill()?;
        let applied_pf = context.drive.set_capacitance(*combo_pf).await?;

        if axis.is_empty() {
            context.warn(format!(
                "resonance window for {applied_pf} pF lies outside {}-{} kHz",
                params.f_min_khz, params.f_max_khz
            ));
            resonance.push_row(vec![Some(applied_pf), None, None, None])?;
            done += 1;
            context.progress(done, total);
            continue;
        }

        let mut currents = Vec::with_capacity(axis.len());
        for &f_khz in axis {
            context.check_kill()?;
            context.drive.set_frequency(f_khz, false).await?;
            context.settle(params.settling()).await;
            let reading = context.source.read_values(SourceChannel::Hf).await?;
            currents.push(reading.current_a);
            data.push_values(&[applied_pf, f_khz, reading.voltage_v, reading.current_a])?;
            done += 1;
            context.progress(done, total);

            let mut live = series.clone();
            live.push(PlotSeries::new(
                format!("{applied_pf} pF"),
                axis[..currents.len()].to_vec(),
                currents.clone(),
            ));
            context.plot(live);
        }

        series.push(PlotSeries::new(
            format!("{applied_pf} pF"),
            axis.clone(),
            currents.clone(),
        ));
        match fit_resonance(axis, &currents, context.globals.circuit_resistance_ohm) {
            Ok(fit) => {
                resonance.push_values(&[applied_pf, fit.f0_khz, fit.i_peak, fit.q])?;
                let fitted: Vec<f64> = axis.iter().map(|&f| fit.current_at(f)).collect();
                series.push(PlotSeries::new(
                    format!("fit {applied_pf} pF"),
                    axis.clone(),
                    fitted,
                ));
            }
            Err(BenchError::FitFailure(reason)) => {
                context.warn(format!("resonance fit failed for {applied_pf} pF: {reason}"));
                resonance.push_row(vec![Some(applied_pf), None, None, None])?;
            }
            Err(e) => return Err(e),
        }
        context.plot(series.clone());
    }

    // Outer loop done, tank back to the base combination.
    context
        .drive
        .set_capacitance(context.globals.base_capacitance_pf)
        .await?;
    Ok(())
}
