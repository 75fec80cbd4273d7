//! Event and reply types exchanged between the bench engine and its host.
//!
//! The engine never talks to a UI directly. Sweeps and the background reader
//! publish [`BenchEvent`]s on an mpsc channel; the host (CLI, test harness,
//! embedding application) consumes them. The one interaction that needs an
//! answer, the operator pause handshake, carries a `oneshot::Sender` inside
//! the event so the reply cannot be misrouted.
//!
//! # Message Flow
//!
//! ```text
//! Sweep Task                          Host
//! ----------                          ----
//! 1. Create PauseRequest with oneshot
//! 2. Send via mpsc channel     ------>
//!                                     3. Show message, wait for operator
//!                                     4. Send Continue or Abort
//! 5. Await oneshot receiver    <------
//! 6. Resume or unwind into finalize
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::sweep::params::{
    AmplitudeScanParams, BiasScanParams, CapacitanceScanParams, FrequencyScanParams,
    LifetimeScanParams, PowerScanParams, PulseScheduleParams,
};

/// Coarse bench lifecycle state, published whenever it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BenchState {
    /// No reader, no sweep.
    Idle,
    /// The ~1 Hz background reader is polling the instruments.
    BackgroundReading,
    /// A sweep owns the instruments; the reader idles.
    SweepRunning,
    /// A sweep is blocked on an operator reply.
    PausedForOperator,
}

/// Live scalars from the background reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveReadout {
    /// Source voltage readback in V.
    pub voltage_v: f64,
    /// Source current readback in A.
    pub current_a: f64,
    /// Drive frequency in kHz.
    pub frequency_khz: f64,
    /// Currently switched tank capacitance in pF.
    pub capacitance_pf: f64,
}

/// One named curve for the host plot.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSeries {
    /// Legend label.
    pub label: String,
    /// X samples.
    pub x: Vec<f64>,
    /// Y samples, same length as `x`.
    pub y: Vec<f64>,
}

impl PlotSeries {
    /// Build a series, truncating to the shorter of the two arrays so a
    /// plot update can never carry mismatched lengths.
    pub fn new(label: impl Into<String>, x: Vec<f64>, y: Vec<f64>) -> Self {
        let len = x.len().min(y.len());
        let mut x = x;
        let mut y = y;
        x.truncate(len);
        y.truncate(len);
        PlotSeries {
            label: label.into(),
            x,
            y,
        }
    }
}

/// A full redraw of the live plot, emitted once per sweep iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlotUpdate {
    /// The curves to draw; series lengths are equal within each curve.
    pub series: Vec<PlotSeries>,
}

/// Operator answer to a [`BenchEvent::PauseRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorReply {
    /// Resume the sweep.
    Continue,
    /// Unwind the sweep through its finalize step.
    Abort,
}

/// Everything the engine tells the host.
#[derive(Debug)]
pub enum BenchEvent {
    /// Sweep completion in percent, 0..=100.
    Progress(u8),
    /// Replace the live plot.
    Plot(PlotUpdate),
    /// The sweep is waiting for the operator (e.g. "insert device").
    PauseRequest {
        /// Text to show the operator.
        message: String,
        /// Channel for the operator's answer.
        reply: oneshot::Sender<OperatorReply>,
    },
    /// Fresh live readout from the background reader.
    Live(LiveReadout),
    /// Bench lifecycle state changed.
    State(BenchState),
    /// Non-fatal condition worth surfacing (clamped value, fit failure,
    /// regulator budget exhausted).
    Warning(String),
}

impl BenchEvent {
    /// Progress event from a fraction, clamped into 0..=100.
    pub fn progress(done: usize, total: usize) -> Self {
        let pct = if total == 0 {
            100
        } else {
            ((done as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
        };
        BenchEvent::Progress(pct)
    }

    /// Pause request plus the receiver the sweep awaits.
    pub fn pause_request(message: impl Into<String>) -> (Self, oneshot::Receiver<OperatorReply>) {
        let (tx, rx) = oneshot::channel();
        (
            BenchEvent::PauseRequest {
                message: message.into(),
                reply: tx,
            },
            rx,
        )
    }
}

/// One sweep to execute, deserialized from a run file.
///
/// The `sweep` tag selects the variant; the remaining keys are the variant's
/// parameter bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sweep", rename_all = "snake_case")]
pub enum SweepRequest {
    /// Frequency scan.
    Frequency(FrequencyScanParams),
    /// Capacitance scan with resonance fitting.
    Capacitance(CapacitanceScanParams),
    /// DC bias scan.
    DcBias(BiasScanParams),
    /// HF amplitude scan with calibration subtraction.
    HfAmplitude(AmplitudeScanParams),
    /// Lifetime scan with incremental persistence.
    Lifetime(LifetimeScanParams),
    /// Power scan over the load resistance.
    Power(PowerScanParams),
    /// Pulsed endurance schedule.
    Pulse(PulseScheduleParams),
}

impl SweepRequest {
    /// Short name used in logs and file suffixes.
    pub fn label(&self) -> &'static str {
        match self {
            SweepRequest::Frequency(_) => "freq_scan",
            SweepRequest::Capacitance(_) => "cap_scan",
            SweepRequest::DcBias(_) => "bias_scan",
            SweepRequest::HfAmplitude(_) => "hf_scan",
            SweepRequest::Lifetime(_) => "lifetime",
            SweepRequest::Power(_) => "power_scan",
            SweepRequest::Pulse(_) => "pulse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_clamps_and_rounds() {
        assert!(matches!(BenchEvent::progress(0, 4), BenchEvent::Progress(0)));
        assert!(matches!(BenchEvent::progress(1, 4), BenchEvent::Progress(25)));
        assert!(matches!(BenchEvent::progress(4, 4), BenchEvent::Progress(100)));
        assert!(matches!(BenchEvent::progress(9, 0), BenchEvent::Progress(100)));
    }

    #[test]
    fn plot_series_truncates_to_common_length() {
        let series = PlotSeries::new("trace", vec![1.0, 2.0, 3.0], vec![0.1, 0.2]);
        assert_eq!(series.x.len(), 2);
        assert_eq!(series.y.len(), 2);
    }

    #[tokio::test]
    async fn pause_request_round_trips_the_reply() {
        let (event, rx) = BenchEvent::pause_request("insert device");
        match event {
            BenchEvent::PauseRequest { message, reply } => {
                assert_eq!(message, "insert device");
                reply.send(OperatorReply::Continue).unwrap();
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(rx.await.unwrap(), OperatorReply::Continue);
    }

    #[test]
    fn sweep_request_parses_from_tagged_toml() {
        let text = r#"
            sweep = "frequency"
            f_min_khz = 50.0
            f_max_khz = 60.0
            f_step_khz = 5.0
            drive_voltage_v = 10.0
        "#;
        let request: SweepRequest = toml::from_str(text).unwrap();
        assert_eq!(request.label(), "freq_scan");
        match request {
            SweepRequest::Frequency(p) => {
                assert_eq!(p.f_min_khz, 50.0);
                assert_eq!(p.f_step_khz, 5.0);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
