//! Shared harness for the simulated-bench integration tests.

#![allow(dead_code)]

use std::path::Path;

use tokio::sync::{mpsc, watch};

use mebench::instruments::mock::SimulatedBench;
use mebench::messages::BenchEvent;
use mebench::settings::GlobalParams;
use mebench::sweep::params::SetupParams;
use mebench::sweep::SweepContext;

/// The simulated rig plus a ready-to-run sweep context.
pub struct Harness {
    pub bench: SimulatedBench,
    pub context: SweepContext,
    pub events: mpsc::UnboundedReceiver<BenchEvent>,
    pub kill: watch::Sender<bool>,
}

/// Bench constants matching the built-in settings.
pub fn bench_params() -> GlobalParams {
    GlobalParams {
        base_capacitance_pf: 33.0,
        capacitances_pf: vec![47.0, 100.0, 220.0, 470.0, 1000.0, 2200.0],
        arduino_pins: vec![2, 3, 4, 5, 6, 7],
        coil_inductance_mh: 1.44,
        circuit_resistance_ohm: 10.0,
        pickup_windings: 50.0,
        pickup_radius_mm: 2.5,
        pid: (0.5, 0.2, 0.0),
        saving_path: "data".into(),
        calibration_path: "".into(),
    }
}

/// Simulated bench wired to a fresh sweep context writing into `folder`.
pub fn harness(folder: &Path, batch: &str) -> Harness {
    let params = bench_params();
    let bench = SimulatedBench::new(&params).unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (kill, kill_rx) = watch::channel(false);
    let context = SweepContext {
        scope: bench.scope(),
        source: bench.source(),
        drive: bench.drive(),
        globals: params,
        setup: SetupParams {
            folder: Some(folder.to_path_buf()),
            batch_name: batch.into(),
            device_number: 1,
            device_size_mm: (5.0, 5.0),
        },
        events: events_tx,
        kill: kill_rx,
    };
    Harness {
        bench,
        context,
        events,
        kill,
    }
}

/// Lines of the single measurement file inside `folder`.
pub fn read_single_file(folder: &Path) -> Vec<String> {
    let mut files: Vec<_> = std::fs::read_dir(folder)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1, "expected one file, got {files:?}");
    let text = std::fs::read_to_string(files.pop().unwrap()).unwrap();
    text.lines().map(String::from).collect()
}

/// Parse a tab-separated data row into numbers.
pub fn numbers(line: &str) -> Vec<f64> {
    line.split('\t').map(|v| v.parse().unwrap()).collect()
}
