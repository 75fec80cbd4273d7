//! Bench assembly and the host-facing control surface.
//!
//! [`Bench`] owns the three instrument handles, the event channel towards the
//! host and the kill flag. It is built three ways:
//!
//! - [`Bench::connect`] opens the transports named in the settings file. An
//!   instrument that does not answer is replaced by an inert null driver so a
//!   partially cabled bench still starts; the substitution is logged with the
//!   failing address.
//! - [`Bench::mock`] wires the simulated bench for offline work.
//! - [`Bench::with_instruments`] accepts prebuilt handles, mainly for tests.
//!
//! A background reader task polls the source and the oscilloscope at about
//! 1 Hz for the live display. While a sweep owns the instruments the reader
//! idles on a shorter poll without touching the hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BenchError, Result};
use crate::instruments::mock::{NullDrive, NullScope, NullSource, SimulatedBench};
use crate::instruments::{
    DriveController, MeasureKind, Oscilloscope, PowerSource, SourceChannel, PICKUP_CHANNEL,
};
use crate::messages::{BenchEvent, BenchState, LiveReadout, SweepRequest};
use crate::settings::{GlobalParams, Settings};
use crate::sweep::params::SetupParams;
use crate::sweep::{self, SweepContext, SweepOutcome};

#[cfg(feature = "instrument_serial")]
use crate::adapters::serial::SerialTransport;
#[cfg(feature = "instrument_visa")]
use crate::adapters::visa::VisaTransport;
#[cfg(feature = "instrument_serial")]
use crate::instruments::arduino::{ArduinoConfig, ArduinoLink, CalibrationTable};
#[cfg(feature = "instrument_visa")]
use crate::instruments::oscilloscope::RigolScope;
#[cfg(feature = "instrument_serial")]
use crate::instruments::source::HcsSource;

/// Poll period of the background reader.
const READER_PERIOD: Duration = Duration::from_secs(1);
/// Idle poll while a sweep owns the instruments.
const READER_PAUSED_POLL: Duration = Duration::from_millis(500);

/// Serial baud rate of the HCS power source.
#[cfg(feature = "instrument_serial")]
const SOURCE_BAUD: u32 = 9600;
/// Serial baud rate of the Arduino switch board.
#[cfg(feature = "instrument_serial")]
const ARDUINO_BAUD: u32 = 115_200;
/// Read poll for the Arduino link; replies are single short lines.
#[cfg(feature = "instrument_serial")]
const ARDUINO_POLL: Duration = Duration::from_millis(10);
/// VISA session timeout for the oscilloscope. Auto measurements can take
/// tens of seconds before the scope answers.
#[cfg(feature = "instrument_visa")]
const SCOPE_TIMEOUT: Duration = Duration::from_secs(25);

/// The assembled bench: instruments, event channel and sweep dispatch.
pub struct Bench {
    scope: Arc<dyn Oscilloscope>,
    source: Arc<dyn PowerSource>,
    drive: Arc<dyn DriveController>,
    globals: GlobalParams,
    events: mpsc::UnboundedSender<BenchEvent>,
    kill: watch::Sender<bool>,
    sweep_running: Arc<AtomicBool>,
    reader_active: Arc<AtomicBool>,
}

impl Bench {
    /// Assemble a bench from prebuilt instrument handles.
    ///
    /// Returns the bench and the receiving end of its event channel.
    pub fn with_instruments(
        scope: Arc<dyn Oscilloscope>,
        source: Arc<dyn PowerSource>,
        drive: Arc<dyn DriveController>,
        globals: GlobalParams,
    ) -> (Self, mpsc::UnboundedReceiver<BenchEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (kill, _) = watch::channel(false);
        let bench = Bench {
            scope,
            source,
            drive,
            globals,
            events,
            kill,
            sweep_running: Arc::new(AtomicBool::new(false)),
            reader_active: Arc::new(AtomicBool::new(false)),
        };
        (bench, receiver)
    }

    /// Connect the instruments named in `settings`.
    ///
    /// A malformed settings file is an error; an unreachable instrument is
    /// not. Each failed transport is logged and replaced by a null driver, so
    /// the returned bench always works, possibly reading placeholder zeros.
    pub async fn connect(settings: &Settings) -> Result<(Self, mpsc::UnboundedReceiver<BenchEvent>)> {
        let globals = GlobalParams::from_settings(settings)?;
        let source = connect_source(settings.get("source_address")).await;
        let scope = connect_scope(settings.get("rigol_oscilloscope_address")).await;
        let drive = connect_drive(settings.get("arduino_address"), &globals).await;
        Ok(Self::with_instruments(scope, source, drive, globals))
    }

    /// Assemble a bench over the simulated instruments.
    pub fn mock(globals: GlobalParams) -> Result<(Self, mpsc::UnboundedReceiver<BenchEvent>)> {
        let sim = SimulatedBench::new(&globals)?;
        info!("running against the simulated bench");
        Ok(Self::with_instruments(
            sim.scope(),
            sim.source(),
            sim.drive(),
            globals,
        ))
    }

    /// Bench constants derived from the settings file.
    pub fn globals(&self) -> &GlobalParams {
        &self.globals
    }

    /// Shared handle on the oscilloscope.
    pub fn scope(&self) -> Arc<dyn Oscilloscope> {
        Arc::clone(&self.scope)
    }

    /// Shared handle on the power source.
    pub fn source(&self) -> Arc<dyn PowerSource> {
        Arc::clone(&self.source)
    }

    /// Shared handle on the drive controller.
    pub fn drive(&self) -> Arc<dyn DriveController> {
        Arc::clone(&self.drive)
    }

    /// True while a sweep owns the instruments.
    pub fn is_sweep_running(&self) -> bool {
        self.sweep_running.load(Ordering::SeqCst)
    }

    /// Start the background reader.
    ///
    /// Returns the task handle, or `None` if a reader is already running.
    /// After [`Bench::stop_reader`], await the handle before starting a new
    /// reader; the task finishes its current poll period first.
    pub fn start_reader(&self) -> Option<JoinHandle<()>> {
        if self.reader_active.swap(true, Ordering::SeqCst) {
            return None;
        }
        if !self.sweep_running.load(Ordering::SeqCst) {
            self.send_state(BenchState::BackgroundReading);
        }

        let scope = Arc::clone(&self.scope);
        let source = Arc::clone(&self.source);
        let drive = Arc::clone(&self.drive);
        let events = self.events.clone();
        let active = Arc::clone(&self.reader_active);
        let sweeping = Arc::clone(&self.sweep_running);
        Some(tokio::spawn(async move {
            while active.load(Ordering::SeqCst) {
                if sweeping.load(Ordering::SeqCst) {
                    tokio::time::sleep(READER_PAUSED_POLL).await;
                    continue;
                }
                match read_live(&scope, &source, &drive).await {
                    Ok(live) => {
                        let _ = events.send(BenchEvent::Live(live));
                    }
                    Err(e) => debug!("live readout failed: {e}"),
                }
                tokio::time::sleep(READER_PERIOD).await;
            }
        }))
    }

    /// Ask the background reader to exit after its current poll.
    pub fn stop_reader(&self) {
        if self.reader_active.swap(false, Ordering::SeqCst)
            && !self.sweep_running.load(Ordering::SeqCst)
        {
            self.send_state(BenchState::Idle);
        }
    }

    /// Run one sweep to completion.
    ///
    /// Only one sweep may own the instruments at a time; a second call while
    /// one is in flight fails with a validation error and leaves the running
    /// sweep untouched. The kill flag is cleared on entry, so a kill always
    /// refers to the sweep it was issued against.
    pub async fn run_sweep(
        &self,
        request: SweepRequest,
        setup: SetupParams,
    ) -> Result<SweepOutcome> {
        if self.sweep_running.swap(true, Ordering::SeqCst) {
            return Err(BenchError::Validation(
                "a sweep is already running".into(),
            ));
        }
        self.kill.send_replace(false);
        self.send_state(BenchState::SweepRunning);

        let context = SweepContext {
            scope: Arc::clone(&self.scope),
            source: Arc::clone(&self.source),
            drive: Arc::clone(&self.drive),
            globals: self.globals.clone(),
            setup,
            events: self.events.clone(),
            kill: self.kill.subscribe(),
        };
        let result = sweep::run(request, &context).await;

        self.sweep_running.store(false, Ordering::SeqCst);
        self.send_state(if self.reader_active.load(Ordering::SeqCst) {
            BenchState::BackgroundReading
        } else {
            BenchState::Idle
        });
        result
    }

    /// Raise the kill flag. The running sweep unwinds through its finalize
    /// step at the next iteration boundary; without a sweep this is a no-op.
    pub fn kill(&self) {
        info!("kill requested");
        self.kill.send_replace(true);
    }

    /// End-of-session hygiene: stop the reader, drop the outputs and close
    /// the oscilloscope session. Every step is best effort.
    pub async fn shutdown(&self) {
        self.stop_reader();
        for channel in [SourceChannel::Hf, SourceChannel::Bias] {
            if let Err(e) = self.source.output(channel, false).await {
                warn!("output {} not switched off: {e}", channel.index());
            }
        }
        if let Err(e) = self.scope.close().await {
            warn!("oscilloscope session not closed: {e}");
        }
    }

    fn send_state(&self, state: BenchState) {
        let _ = self.events.send(BenchEvent::State(state));
    }
}

/// One live poll: source readback, signal frequency, switched capacitance.
async fn read_live(
    scope: &Arc<dyn Oscilloscope>,
    source: &Arc<dyn PowerSource>,
    drive: &Arc<dyn DriveController>,
) -> Result<LiveReadout> {
    let reading = source.read_values(SourceChannel::Hf).await?;
    let f_hz = scope.measure(MeasureKind::Frequency, PICKUP_CHANNEL).await?;
    let capacitance_pf = drive.capacitance().await;
    Ok(LiveReadout {
        voltage_v: reading.voltage_v,
        current_a: reading.current_a,
        frequency_khz: f_hz / 1e3,
        capacitance_pf,
    })
}

async fn connect_source(address: Option<String>) -> Arc<dyn PowerSource> {
    let Some(address) = address.filter(|a| !a.trim().is_empty()) else {
        return Arc::new(NullSource::substitute("no source_address configured"));
    };
    #[cfg(feature = "instrument_serial")]
    {
        match open_source(&address).await {
            Ok(source) => {
                info!("power source connected at '{address}'");
                source
            }
            Err(e) => {
                let absent = BenchError::TransportAbsent {
                    name: "source".into(),
                    address,
                    reason: e.to_string(),
                };
                Arc::new(NullSource::substitute(&absent.to_string()))
            }
        }
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        let reason = format!(
            "'{address}': {}",
            BenchError::FeatureDisabled("instrument_serial".into())
        );
        Arc::new(NullSource::substitute(&reason))
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_source(address: &str) -> Result<Arc<dyn PowerSource>> {
    let transport = SerialTransport::open(address, SOURCE_BAUD)?;
    let source = HcsSource::new(transport).await?;
    Ok(Arc::new(source))
}

async fn connect_scope(address: Option<String>) -> Arc<dyn Oscilloscope> {
    let Some(address) = address.filter(|a| !a.trim().is_empty()) else {
        return Arc::new(NullScope::substitute(
            "no rigol_oscilloscope_address configured",
        ));
    };
    #[cfg(feature = "instrument_visa")]
    {
        match open_scope(&address).await {
            Ok(scope) => {
                info!("oscilloscope connected at '{address}'");
                scope
            }
            Err(e) => {
                let absent = BenchError::TransportAbsent {
                    name: "oscilloscope".into(),
                    address,
                    reason: e.to_string(),
                };
                Arc::new(NullScope::substitute(&absent.to_string()))
            }
        }
    }
    #[cfg(not(feature = "instrument_visa"))]
    {
        let reason = format!(
            "'{address}': {}",
            BenchError::FeatureDisabled("instrument_visa".into())
        );
        Arc::new(NullScope::substitute(&reason))
    }
}

#[cfg(feature = "instrument_visa")]
async fn open_scope(address: &str) -> Result<Arc<dyn Oscilloscope>> {
    let transport = VisaTransport::open(address, SCOPE_TIMEOUT)?;
    let scope = RigolScope::new(transport).await?;
    Ok(Arc::new(scope))
}

async fn connect_drive(address: Option<String>, globals: &GlobalParams) -> Arc<dyn DriveController> {
    let Some(address) = address.filter(|a| !a.trim().is_empty()) else {
        return Arc::new(NullDrive::substitute("no arduino_address configured"));
    };
    #[cfg(feature = "instrument_serial")]
    {
        match open_drive(&address, globals).await {
            Ok(drive) => {
                info!("microcontroller connected at '{address}'");
                drive
            }
            Err(e) => {
                let absent = BenchError::TransportAbsent {
                    name: "microcontroller".into(),
                    address,
                    reason: e.to_string(),
                };
                Arc::new(NullDrive::substitute(&absent.to_string()))
            }
        }
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = globals;
        let reason = format!(
            "'{address}': {}",
            BenchError::FeatureDisabled("instrument_serial".into())
        );
        Arc::new(NullDrive::substitute(&reason))
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_drive(address: &str, globals: &GlobalParams) -> Result<Arc<dyn DriveController>> {
    let calibration = if globals.calibration_path.as_os_str().is_empty() {
        CalibrationTable::empty()
    } else {
        match CalibrationTable::load(&globals.calibration_path) {
            Ok(table) => table,
            Err(e) => {
                warn!(
                    "calibration table '{}' unavailable: {e}",
                    globals.calibration_path.display()
                );
                CalibrationTable::empty()
            }
        }
    };
    let config = ArduinoConfig {
        base_capacitance_pf: globals.base_capacitance_pf,
        capacitances_pf: globals.capacitances_pf.clone(),
        capacitor_pins: globals.arduino_pins.clone(),
        coil_inductance_h: globals.coil_inductance_h(),
        calibration,
    };
    let transport = SerialTransport::open_with_poll(address, ARDUINO_BAUD, ARDUINO_POLL)?;
    let drive = ArduinoLink::new(transport, config).await?;
    Ok(Arc::new(drive))
}
