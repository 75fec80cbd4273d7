//! CLI entry point for the magnetoelectric bench.
//!
//! Two subcommands:
//! - `run <params.toml>`: execute the sweep described by a TOML run file,
//!   streaming progress and warnings to the terminal and answering the
//!   operator pause handshake on stdin.
//! - `monitor`: start the background reader and print live readouts.
//!
//! `--mock` wires the simulated bench instead of opening transports, so both
//! commands work without hardware attached.
//!
//! # Usage
//!
//! Run a sweep:
//! ```bash
//! mebench run measurements/freq_scan.toml
//! ```
//!
//! Watch the bench without measuring:
//! ```bash
//! mebench monitor --mock
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;

use mebench::bench::Bench;
use mebench::logging;
use mebench::messages::{BenchEvent, OperatorReply, SweepRequest};
use mebench::settings::{GlobalParams, Settings, DEFAULT_SETTINGS_PATH};
use mebench::sweep::params::SetupParams;

#[derive(Parser)]
#[command(name = "mebench")]
#[command(about = "Benchtop characterization of magnetoelectric devices", long_about = None)]
struct Cli {
    /// Settings file; created with built-in defaults when missing.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// Drive the simulated bench instead of opening transports.
    #[arg(long, global = true)]
    mock: bool,

    /// Fallback log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the sweep described by a TOML run file.
    Run {
        /// Path to the run file.
        params: PathBuf,
    },

    /// Print live readouts from the background reader.
    Monitor,
}

/// One run file: an optional `[setup]` table plus the tagged sweep keys.
#[derive(Debug, Deserialize)]
struct RunFile {
    #[serde(default)]
    setup: SetupParams,
    #[serde(flatten)]
    sweep: SweepRequest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run { params } => run_once(&params, &cli.settings, cli.mock).await,
        Commands::Monitor => monitor(&cli.settings, cli.mock).await,
    }
}

async fn assemble(
    settings_path: &Path,
    mock: bool,
) -> Result<(Bench, mpsc::UnboundedReceiver<BenchEvent>)> {
    let settings = Settings::load_or_create(settings_path)
        .with_context(|| format!("settings file '{}'", settings_path.display()))?;
    if mock {
        let globals = GlobalParams::from_settings(&settings)?;
        Ok(Bench::mock(globals)?)
    } else {
        Ok(Bench::connect(&settings).await?)
    }
}

async fn run_once(params: &Path, settings_path: &Path, mock: bool) -> Result<()> {
    let text = tokio::fs::read_to_string(params)
        .await
        .with_context(|| format!("run file '{}'", params.display()))?;
    let run: RunFile = toml::from_str(&text)
        .with_context(|| format!("run file '{}'", params.display()))?;

    let (bench, events) = assemble(settings_path, mock).await?;
    let bench = Arc::new(bench);
    let printer = tokio::spawn(pump_events(events));

    // Ctrl+C raises the kill flag; the sweep unwinds through its finalize.
    let killer = tokio::spawn({
        let bench = Arc::clone(&bench);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                bench.kill();
            }
        }
    });

    let label = run.sweep.label();
    println!("▶️  Starting {label}");
    let outcome = bench.run_sweep(run.sweep, run.setup).await;

    killer.abort();
    let _ = killer.await;
    bench.shutdown().await;
    drop(bench);
    let _ = printer.await;

    match outcome {
        Ok(outcome) => {
            println!("✅ {label} finished: {} data rows", outcome.rows);
            for file in &outcome.files {
                println!("   wrote {}", file.display());
            }
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            println!("⚠️  {label} stopped: {e}");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {label} failed: {e}");
            Err(e.into())
        }
    }
}

async fn monitor(settings_path: &Path, mock: bool) -> Result<()> {
    let (bench, events) = assemble(settings_path, mock).await?;
    let reader = bench.start_reader();
    let printer = tokio::spawn(pump_events(events));

    println!("📡 Monitoring - Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!();

    bench.shutdown().await;
    if let Some(handle) = reader {
        let _ = handle.await;
    }
    drop(bench);
    let _ = printer.await;
    println!("👋 Bench released");
    Ok(())
}

/// Print engine events and answer pause handshakes until the channel closes.
async fn pump_events(mut events: mpsc::UnboundedReceiver<BenchEvent>) {
    let mut last_pct = None;
    while let Some(event) = events.recv().await {
        match event {
            BenchEvent::Progress(pct) => {
                if last_pct != Some(pct) {
                    last_pct = Some(pct);
                    println!("   progress {pct:3}%");
                }
            }
            BenchEvent::Warning(text) => println!("⚠️  {text}"),
            BenchEvent::Live(live) => println!(
                "   live: {:6.2} V  {:6.3} A  {:8.1} kHz  {:6.0} pF",
                live.voltage_v, live.current_a, live.frequency_khz, live.capacitance_pf
            ),
            BenchEvent::State(state) => tracing::debug!("bench state: {state:?}"),
            BenchEvent::PauseRequest { message, reply } => {
                let _ = reply.send(ask_operator(&message).await);
            }
            // The terminal host has no plot surface.
            BenchEvent::Plot(_) => {}
        }
    }
}

/// Blocking stdin prompt for the pause handshake. EOF counts as abort so an
/// unattended pipe cannot silently resume a sweep.
async fn ask_operator(message: &str) -> OperatorReply {
    println!();
    println!("⏸️  {message}");
    println!("   Press Enter to continue, or type 'abort' and Enter to stop.");
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => "abort".into(),
            Ok(_) => line,
        }
    })
    .await
    .unwrap_or_else(|_| "abort".into());

    if line.trim().eq_ignore_ascii_case("abort") {
        OperatorReply::Abort
    } else {
        OperatorReply::Continue
    }
}
