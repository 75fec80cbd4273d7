//! Kill handling and the guaranteed idle restore.
//!
//! A killed sweep must unwind through the finalize path: outputs off, drive
//! back at 1000 kHz on the base capacitance, 5 V idle setpoint, and the rows
//! collected before the kill flushed to disk.

mod common;

use common::{harness, read_single_file, Harness};
use mebench::data::writer::DATA_SENTINEL;
use mebench::error::BenchError;
use mebench::messages::{BenchEvent, OperatorReply, SweepRequest};
use mebench::sweep;

#[tokio::test(start_paused = true)]
async fn killed_lifetime_scan_keeps_partial_rows_and_restores_idle() {
    let dir = tempfile::tempdir().unwrap();
    let Harness {
        bench,
        context,
        mut events,
        kill,
    } = harness(dir.path(), "life");

    let request: SweepRequest = toml::from_str(
        r#"
            sweep = "lifetime"
            total_s = 600.0
            interval_s = 5.0
            drive_voltage_v = 10.0
            frequency_khz = 730.0
            settling_time_s = 0.0
        "#,
    )
    .unwrap();
    let task = tokio::spawn(async move { sweep::run(request, &context).await });

    // Play the operator, then kill as soon as the first row is in.
    let mut killed = false;
    while !killed {
        match events.recv().await.unwrap() {
            BenchEvent::PauseRequest { reply, .. } => {
                reply.send(OperatorReply::Continue).unwrap();
            }
            BenchEvent::Progress(pct) if pct > 0 => {
                kill.send(true).unwrap();
                killed = true;
            }
            _ => {}
        }
    }

    let result = task.await.unwrap();
    assert!(matches!(result, Err(BenchError::Cancelled)), "{result:?}");

    let s = bench.snapshot();
    assert!(!s.hf_on);
    assert!(!s.bias_on);
    assert_eq!(s.drive_freq_khz, 1000.0);
    assert_eq!(s.capacitance_pf, 33.0);
    assert_eq!(s.hf_voltage_v, 5.0);
    assert!(s.gate_on);

    // The incremental writer flushed and closed the partial scan.
    let lines = read_single_file(dir.path());
    let sentinel = lines.iter().position(|l| l == DATA_SENTINEL).unwrap();
    assert!(lines[sentinel + 1].starts_with("Time\t"));
    let data_rows = lines.len() - sentinel - 3;
    assert!(data_rows >= 1, "no rows survived the kill: {lines:?}");
}
