//! Power scan.
//!
//! Steps the load-resistor bank through every combination inside
//! `[r_min, r_max]` and converts the measured ME voltage into an areal
//! power density, `mW/mm² = V²/R · 1000 / (a·b)` with `(a, b)` the device
//! dimensions from the setup parameters.

use crate::data::table::ResultTable;
use crate::error::Result;
use crate::instruments::{MeasureKind, SourceChannel, DEVICE_CHANNEL};
use crate::messages::PlotSeries;
use crate::sweep::params::PowerScanParams;
use crate::sweep::{SweepContext, SweepOutcome};

/// File suffix for this variant.
pub const SUFFIX: &str = "power_scan";

/// Areal power density in mW/mm².
fn power_density(me_voltage_v: f64, load_ohm: f64, area_mm2: f64) -> f64 {
    me_voltage_v * me_voltage_v / load_ohm * 1000.0 / area_mm2
}

/// Step the load bank and convert each reading to a power density.
pub async fn run(params: &PowerScanParams, context: &SweepContext) -> Result<SweepOutcome> {
    params.validate()?;

    let mut table = ResultTable::new(&[
        ("Resistance", "Ohm"),
        ("Voltage", "V"),
        ("Current", "A"),
        ("ME Voltage", "V"),
        ("Power Density", "mW/mm2"),
    ]);
    table.push_header_line(format!(
        "Power scan {}-{} Ohm, drive {} V at {} kHz, device {}x{} mm",
        params.r_min_ohm,
        params.r_max_ohm,
        params.drive_voltage_v,
        params.frequency_khz,
        context.setup.device_size_mm.0,
        context.setup.device_size_mm.1
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
    params: &PowerScanParams,
    context: &SweepContext,
    table: &mut ResultTable,
) -> Result<()> {
    let loads = context
        .drive
        .resistance_combinations(params.r_min_ohm, params.r_max_ohm)
        .await;
    if loads.is_empty() {
        context.warn("no load combination falls inside the scan range");
        return Ok(());
    }
    let area_mm2 = context.setup.device_area_mm2();
    if area_mm2 <= 0.0 {
        return Err(crate::error::BenchError::Validation(
            "device size must be positive for a power scan".into(),
        ));
    }

    context
        .drive
        .set_frequency(params.frequency_khz, false)
        .await?;
    context
        .energize_hf(params.drive_voltage_v, params.current_limit_a)
        .await?;

    let total = loads.len();
    for (done, &load_ohm) in loads.iter().enumerate() {
        context.check_kill()?;
        let applied_ohm = context.drive.set_resistance(load_ohm).await?;
        context.settle(params.settling()).await;

        let reading = context.source.read_values(SourceChannel::Hf).await?;
        let me_v = context
            .scope
            .measure(MeasureKind::Vmax, DEVICE_CHANNEL)
            .await?;
        table.push_values(&[
            applied_ohm,
            reading.voltage_v,
            reading.current_a,
            me_v,
            power_density(me_v, applied_ohm, area_mm2),
        ])?;

        context.progress(done + 1, total);
        let (r, density) = table.xy(0, 4);
        let (_, me_trace) = table.xy(0, 3);
        context.plot(vec![
            PlotSeries::new("Power Density", r.clone(), density),
            PlotSeries::new("ME Voltage", r, me_trace),
        ]);
    }

    // Unload the device before the idle restore.
    context.drive.set_resistance(0.0).await?;
    Ok(())
}
