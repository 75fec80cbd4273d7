//! Operator pause handshake in the amplitude scan.
//!
//! The scan sweeps the HF amplitude twice: first without the device to
//! record the capacitive feedthrough, then again after the operator inserts
//! the device. The test plays the operator and checks the subtraction leaves
//! only the device response.

mod common;

use common::{harness, numbers, read_single_file, Harness};
use mebench::messages::{BenchEvent, OperatorReply, SweepRequest};
use mebench::sweep;

#[tokio::test]
async fn amplitude_scan_resumes_after_device_insertion() {
    let dir = tempfile::tempdir().unwrap();
    let Harness {
        bench,
        context,
        mut events,
        kill: _kill,
    } = harness(dir.path(), "hf");
    bench.set_device_inserted(false);

    let request: SweepRequest = toml::from_str(
        r#"
            sweep = "hf_amplitude"
            v_min_v = 1.0
            v_max_v = 3.0
            v_step_v = 1.0
            frequency_khz = 730.0
            settling_time_s = 0.0
        "#,
    )
    .unwrap();
    let task = tokio::spawn(async move { sweep::run(request, &context).await });

    let reply = loop {
        match events.recv().await.unwrap() {
            BenchEvent::PauseRequest { message, reply } => {
                assert_eq!(
                    message,
                    "Calibration finished. Insert the device, then continue."
                );
                break reply;
            }
            _ => {}
        }
    };
    bench.set_device_inserted(true);
    reply.send(OperatorReply::Continue).unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.rows, 3);

    let lines = read_single_file(dir.path());
    let rows: Vec<Vec<f64>> = lines[lines.len() - 3..].iter().map(|l| numbers(l)).collect();
    let amplitudes: Vec<f64> = rows.iter().map(|r| r[0]).collect();
    assert_eq!(amplitudes, vec![1.0, 2.0, 3.0]);

    // At resonance the rig responds with about 0.07 V per drive volt; the
    // 0.01 V/V feedthrough has to be gone after the subtraction.
    for row in &rows {
        let me_per_volt = row[3] / row[0];
        assert!(
            me_per_volt > 0.04 && me_per_volt < 0.1,
            "residual response: {row:?}"
        );
    }
    assert!(rows[0][3] < rows[1][3] && rows[1][3] < rows[2][3]);
}
