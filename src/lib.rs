//! # Magnetoelectric Bench Library
//!
//! This crate is the core library of the `mebench` application. It bundles
//! everything needed to characterize magnetoelectric devices on the benchtop:
//! instrument drivers, the sweep engine, resonance fitting and measurement
//! file output. The binary in `main.rs` is a thin CLI over this library, so
//! the same engine can be embedded by other hosts or driven from tests.
//!
//! ## Crate Structure
//!
//! - **`adapters`**: Byte and SCPI transports over serial and VISA, plus a
//!   scripted mock transport for driver tests.
//! - **`bench`**: Bench assembly. Connects the instruments named in the
//!   settings file (substituting null drivers for absent hardware), runs the
//!   background reader and dispatches sweeps one at a time.
//! - **`data`**: The in-memory result table and the measurement file writer
//!   with its header/units layout and collision-free file naming.
//! - **`error`**: The crate-wide [`error::BenchError`] enum.
//! - **`fit`**: Levenberg-Marquardt fit of the series-RLC resonance model to
//!   a measured current trace.
//! - **`instruments`**: Instrument traits and the concrete drivers: the HCS
//!   power source, the Rigol oscilloscope and the Arduino switch board, plus
//!   the simulated bench.
//! - **`logging`**: Tracing and `log` backend initialization for the binary.
//! - **`messages`**: Events, sweep requests and the operator pause handshake
//!   exchanged between the engine and its host.
//! - **`physics`**: LC resonance and induction-law helpers shared by the
//!   sweeps, the regulator and the simulation.
//! - **`regulator`**: Closed-loop magnetic field regulator driving the HF
//!   output against the pickup coil readback.
//! - **`settings`**: The key/value settings file and the derived
//!   [`settings::GlobalParams`] bench constants.
//! - **`sweep`**: The measurement procedures: frequency, capacitance, bias,
//!   amplitude, lifetime, power and pulse scans over a shared context.

pub mod adapters;
pub mod bench;
pub mod data;
pub mod error;
pub mod fit;
pub mod instruments;
pub mod logging;
pub mod messages;
pub mod physics;
pub mod regulator;
pub mod settings;
pub mod sweep;
