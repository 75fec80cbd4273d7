//! Lifetime scan.
//!
//! One ME measurement per tick of `arange(0, total + 1, Δt)`, anchored to
//! the wall clock so drift never accumulates. Uses the same
//! baseline-subtraction scheme as the HF scan, but calibrates once up
//! front. Rows go to disk as they are produced; a lifetime run can span
//! hours and a crash at tick 400 must not cost the first 399.

use std::time::Duration;

use tokio::time::Instant;

use crate::data::writer::TableWriter;
use crate::error::Result;
use crate::instruments::{SourceChannel, DEVICE_CHANNEL};
use crate::messages::PlotSeries;
use crate::physics;
use crate::sweep::params::LifetimeScanParams;
use crate::sweep::{SweepContext, SweepOutcome, SMOOTHING_WINDOW};

/// File suffix for this variant.
pub const SUFFIX: &str = "lifetime";

/// Monitor the device over time; rows reach the disk as they are measured.
pub async fn run(params: &LifetimeScanParams, context: &SweepContext) -> Result<SweepOutcome> {
    params.validate()?;

    let mut writer_slot: Option<TableWriter> = None;
    let mut history: Vec<(f64, f64)> = Vec::new();
    let body = measure(params, context, &mut writer_slot, &mut history).await;

    // The writer is closed on every path, cancellation included.
    let mut files = Vec::new();
    let mut closed = Ok(());
    if let Some(writer) = writer_slot.take() {
        files.push(writer.path().to_path_buf());
        closed = writer.finish();
    }
    body?;
    closed?;
    Ok(SweepOutcome {
        files,
        rows: history.len(),
    })
}

async fn measure(
    params: &LifetimeScanParams,
    context: &SweepContext,
    writer_slot: &mut Option<TableWriter>,
    history: &mut Vec<(f64, f64)>,
) -> Result<()> {
    let ticks = params.ticks();
    if ticks.is_empty() {
        context.warn("lifetime grid is empty, nothing to scan");
        return Ok(());
    }

    context
        .drive
        .set_frequency(params.frequency_khz, false)
        .await?;
    context
        .energize_hf(params.drive_voltage_v, params.current_limit_a)
        .await?;
    context.settle(params.settling()).await;

    let baseline_wave = context.scope.get_data(DEVICE_CHANNEL).await?;
    let baseline = physics::moving_average(&baseline_wave.volts, SMOOTHING_WINDOW);

    context
        .pause_for_operator("Calibration finished. Insert the device, then continue.")
        .await?;

    let header = vec![format!(
        "Lifetime scan over {} s, tick {} s, drive {} V at {} kHz",
        params.total_s, params.interval_s, params.drive_voltage_v, params.frequency_khz
    )];
    let columns: Vec<String> = ["Time", "Voltage", "Current", "ME Voltage"]
        .map(String::from)
        .to_vec();
    let units: Vec<String> = ["s", "V", "A", "V"].map(String::from).to_vec();
    let path = context.output_path(SUFFIX);
    let writer = writer_slot.insert(TableWriter::create(&path, &header, &columns, &units)?);

    let start = Instant::now();
    let total = ticks.len();
    for (done, &t_s) in ticks.iter().enumerate() {
        context
            .wait_until(start + Duration::from_secs_f64(t_s))
            .await?;

        let reading = context.source.read_values(SourceChannel::Hf).await?;
        let waveform = context.scope.get_data(DEVICE_CHANNEL).await?;
        let measured = physics::moving_average(&waveform.volts, SMOOTHING_WINDOW);
        let len = measured.len().min(baseline.len());
        let me_v = (0..len)
            .map(|i| measured[i] - baseline[i])
            .reduce(f64::max)
            .unwrap_or(0.0);

        writer.append_row(&[
            Some(t_s),
            Some(reading.voltage_v),
            Some(reading.current_a),
            Some(me_v),
        ])?;
        history.push((t_s, me_v));

        context.progress(done + 1, total);
        let (t, me): (Vec<f64>, Vec<f64>) = history.iter().copied().unzip();
        context.plot(vec![PlotSeries::new("ME Voltage", t, me)]);
    }
    Ok(())
}
