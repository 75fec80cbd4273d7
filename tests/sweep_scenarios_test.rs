//! End-to-end sweep scenarios over the simulated bench.
//!
//! Each scenario goes through the public dispatcher so persistence, header
//! layout and the idle restore are exercised along with the measurement
//! itself. The simulated rig resonates at 730 kHz on its 33 pF base
//! capacitance, couples the HF drive at 1 mT/V into the pickup coil and
//! responds magnetoelectrically with an optimum near 4 mT bias.

mod common;

use common::{harness, numbers, read_single_file};
use mebench::data::writer::DATA_SENTINEL;
use mebench::messages::SweepRequest;
use mebench::sweep;

fn request(text: &str) -> SweepRequest {
    toml::from_str(text).unwrap()
}

#[tokio::test]
async fn frequency_scan_writes_one_row_per_step() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), "freq");

    let outcome = sweep::run(
        request(
            r#"
                sweep = "frequency"
                f_min_khz = 50.0
                f_max_khz = 60.0
                f_step_khz = 5.0
                drive_voltage_v = 10.0
                settling_time_s = 0.0
            "#,
        ),
        &h.context,
    )
    .await
    .unwrap();

    // Half-open axis: 50 and 55 measured, 60 excluded.
    assert_eq!(outcome.rows, 2);
    assert_eq!(outcome.files.len(), 1);

    let lines = read_single_file(dir.path());
    assert_eq!(lines.len(), 6);
    assert!(lines[0].starts_with("Frequency scan 50-60 kHz step 5 kHz"));
    assert_eq!(lines[1], DATA_SENTINEL);
    assert_eq!(lines[2], "Frequency\tVoltage\tCurrent\tMagnetic Field\tVmax_ind");
    assert_eq!(lines[3], "kHz\tV\tA\tmT\tV");

    let first = numbers(&lines[4]);
    let second = numbers(&lines[5]);
    assert_eq!(first[0], 50.0);
    assert_eq!(second[0], 55.0);
    // Programmed 10 V comes straight back from the source readout.
    assert_eq!(first[1], 10.0);
    // The field column inverts the same induction law the pickup voltage
    // was produced with: 10 V at 1 mT/V.
    assert!((first[3] - 10.0).abs() < 1e-6, "field column: {first:?}");
    assert!((second[3] - 10.0).abs() < 1e-6, "field column: {second:?}");

    // Success path ends in the safe idle state.
    let s = h.bench.snapshot();
    assert!(!s.hf_on);
    assert_eq!(s.drive_freq_khz, 1000.0);
    assert_eq!(s.hf_voltage_v, 5.0);
}

#[tokio::test]
async fn capacitance_scan_fits_each_combination() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), "cap");

    // The window [1000, 1100] pF selects exactly two switchable sums on
    // top of the 33 pF base: 1033 and 1080 pF.
    let outcome = sweep::run(
        request(
            r#"
                sweep = "capacitance"
                c_min_pf = 1000.0
                c_max_pf = 1100.0
                f_min_khz = 100.0
                f_max_khz = 160.0
                drive_voltage_v = 10.0
                settling_time_s = 0.0
            "#,
        ),
        &h.context,
    )
    .await
    .unwrap();

    // 30 inner points per combination plus one resonance row each.
    assert_eq!(outcome.files.len(), 2);
    assert_eq!(outcome.rows, 62);

    let text = std::fs::read_to_string(&outcome.files[1]).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines[2],
        "capacitance_pF\tresonance_frequency_kHz\tmaximum_current_A\tquality_factor"
    );
    assert_eq!(lines[3], "pF\tkHz\tA\t-");
    assert_eq!(lines.len(), 6);

    let first = numbers(lines[4]);
    let second = numbers(lines[5]);
    assert!((first[0] - 1033.0).abs() < 1e-9);
    assert!((second[0] - 1080.0).abs() < 1e-9);

    // LC resonances for 1.44 mH: 130.5 and 127.6 kHz. The tank model is
    // the fitted model, so the fit lands on the analytic values.
    assert!((first[1] - 130.49).abs() < 0.3, "fit: {first:?}");
    assert!((second[1] - 127.62).abs() < 0.3, "fit: {second:?}");
    // 10 V over the 10 Ohm loop peaks at 1 A on resonance.
    assert!((first[2] - 1.0).abs() < 0.05, "fit: {first:?}");
    assert!(first[3] > 70.0 && first[3] < 100.0, "fit: {first:?}");

    // The tank is back on the base combination afterwards.
    assert_eq!(h.bench.snapshot().capacitance_pf, 33.0);
}

#[tokio::test]
async fn bias_scan_reports_the_optimum_in_header_line_one() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), "bias");

    let outcome = sweep::run(
        request(
            r#"
                sweep = "dc_bias"
                b_min_mt = -10.0
                b_max_mt = 10.0
                b_step_mt = 5.0
                frequency_khz = 730.0
                settling_time_s = 0.0
            "#,
        ),
        &h.context,
    )
    .await
    .unwrap();
    assert_eq!(outcome.rows, 5);

    let lines = read_single_file(dir.path());
    // Two header lines, sentinel, columns, units, five rows.
    assert_eq!(lines.len(), 10);
    // The single-quadrant supply folds -5 and +5 mT onto the same coil
    // current, their ME readings tie, and the median of the tied pair is 0.
    assert_eq!(lines[0], "Optimum Bias Field: 0 mT At a Current of: 0 A");
    assert_eq!(lines[2], DATA_SENTINEL);
    assert_eq!(lines[3], "Bias Field\tBias Current\tVoltage\tCurrent\tME Voltage");
    assert_eq!(lines[4], "mT\tA\tV\tA\tV");

    let rows: Vec<Vec<f64>> = lines[5..].iter().map(|l| numbers(l)).collect();
    let fields: Vec<f64> = rows.iter().map(|r| r[0]).collect();
    assert_eq!(fields, vec![-10.0, -5.0, 0.0, 5.0, 10.0]);
    let currents: Vec<f64> = rows.iter().map(|r| r[1]).collect();
    assert_eq!(currents, vec![1.0, 0.5, 0.0, 0.5, 1.0]);

    // Same current, same field, same response on both polarities.
    assert_eq!(rows[1][4], rows[3][4]);
    assert_eq!(rows[0][4], rows[4][4]);
    // The near-optimum rows respond strongest.
    assert!(rows[1][4] > rows[2][4] && rows[1][4] > rows[0][4]);
}

#[tokio::test]
async fn power_scan_steps_every_load_combination_in_range() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), "power");

    let outcome = sweep::run(
        request(
            r#"
                sweep = "power"
                r_min_ohm = 100.0
                r_max_ohm = 400.0
                drive_voltage_v = 5.0
                frequency_khz = 730.0
                settling_time_s = 0.0
            "#,
        ),
        &h.context,
    )
    .await
    .unwrap();
    assert_eq!(outcome.rows, 6);

    let lines = read_single_file(dir.path());
    assert_eq!(lines.len(), 10);
    assert!(lines[0].starts_with("Power scan 100-400 Ohm"));
    assert_eq!(lines[1], DATA_SENTINEL);
    assert_eq!(lines[2], "Resistance\tVoltage\tCurrent\tME Voltage\tPower Density");
    assert_eq!(lines[3], "Ohm\tV\tA\tV\tmW/mm2");

    let rows: Vec<Vec<f64>> = lines[4..].iter().map(|l| numbers(l)).collect();
    let loads: Vec<f64> = rows.iter().map(|r| r[0]).collect();
    // Every subset sum of the 47/100/220 resistors inside the range.
    assert_eq!(loads, vec![100.0, 147.0, 220.0, 267.0, 320.0, 367.0]);

    for r in &rows {
        let density = r[3] * r[3] / r[0] * 1000.0 / 25.0;
        assert!((r[4] - density).abs() < 1e-9, "density column: {r:?}");
    }
    // The device drives the load through its internal resistance, so the
    // ME voltage keeps rising with the load while the power density peaks
    // at the matched 100 Ohm and falls beyond it.
    for pair in rows.windows(2) {
        assert!(pair[1][3] > pair[0][3]);
        assert!(pair[1][4] < pair[0][4]);
    }

    // The bank is left open after the scan.
    assert_eq!(h.bench.snapshot().resistance_ohm, 0.0);
}
