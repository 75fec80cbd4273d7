//! HF amplitude scan.
//!
//! Two passes over `arange(v_min, v_max + step, step)`. The first records
//! the device-channel waveform per amplitude with no device in the fixture
//! (electrical feedthrough). The operator then inserts the device via the
//! pause handshake, and the second pass records the loaded waveform. Both
//! traces are smoothed with a 20-sample moving average; the ME voltage per
//! amplitude is the largest point of the difference trace.

use crate::data::table::ResultTable;
use crate::error::Result;
use crate::instruments::{SourceChannel, DEVICE_CHANNEL};
use crate::messages::PlotSeries;
use crate::physics;
use crate::sweep::params::AmplitudeScanParams;
use crate::sweep::{SweepContext, SweepOutcome, SMOOTHING_WINDOW};

/// File suffix for this variant.
pub const SUFFIX: &str = "hf_scan";

/// Calibrate without the device, then step the HF amplitude against it.
pub async fn run(params: &AmplitudeScanParams, context: &SweepContext) -> Result<SweepOutcome> {
    params.validate()?;

    let mut table = ResultTable::new(&[
        ("HF Voltage", "V"),
        ("Voltage", "V"),
        ("Current", "A"),
        ("ME Voltage", "V"),
    ]);
    table.push_header_line(format!(
        "HF amplitude scan {}-{} V step {} V at {} kHz",
        params.v_min_v, params.v_max_v, params.v_step_v, params.frequency_khz
    ));

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
    params: &AmplitudeScanParams,
    context: &SweepContext,
    table: &mut ResultTable,
) -> Result<()> {
    let axis = params.axis();
    if axis.is_empty() {
        context.warn("amplitude axis is empty, nothing to scan");
        return Ok(());
    }

    context
        .drive
        .set_frequency(params.frequency_khz, false)
        .await?;
    context
        .energize_hf(axis[0], params.current_limit_a)
        .await?;

    let total = 2 * axis.len();
    let mut done = 0usize;

    // Pass 1: feedthrough baseline per amplitude, device absent.
    let mut calibration: Vec<Vec<f64>> = Vec::with_capacity(axis.len());
    for &amplitude_v in &axis {
        context.check_kill()?;
        context
            .source
            .set_voltage(SourceChannel::Hf, amplitude_v)
            .await?;
        context.settle(params.settling()).await;
        let waveform = context.scope.get_data(DEVICE_CHANNEL).await?;
        calibration.push(physics::moving_average(&waveform.volts, SMOOTHING_WINDOW));
        done += 1;
        context.progress(done, total);
    }

    context
        .pause_for_operator("Calibration finished. Insert the device, then continue.")
        .await?;

    // Pass 2: loaded waveforms, same axis.
    for (index, &amplitude_v) in axis.iter().enumerate() {
        context.check_kill()?;
        context
            .source
            .set_voltage(SourceChannel::Hf, amplitude_v)
            .await?;
        context.settle(params.settling()).await;

        let reading = context.source.read_values(SourceChannel::Hf).await?;
        let waveform = context.scope.get_data(DEVICE_CHANNEL).await?;
        let measured = physics::moving_average(&waveform.volts, SMOOTHING_WINDOW);
        let baseline = &calibration[index];
        let len = measured.len().min(baseline.len());
        let residual: Vec<f64> = (0..len).map(|i| measured[i] - baseline[i]).collect();
        let me_v = residual.iter().copied().reduce(f64::max).unwrap_or(0.0);
        table.push_values(&[amplitude_v, reading.voltage_v, reading.current_a, me_v])?;

        done += 1;
        context.progress(done, total);
        let (applied, me_trace) = table.xy(0, 3);
        context.plot(vec![
            PlotSeries::new("residual", waveform.times[..len].to_vec(), residual),
            PlotSeries::new("ME Voltage", applied, me_trace),
        ]);
    }
    Ok(())
}
