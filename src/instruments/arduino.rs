//! Microcontroller link: drive-frequency generation and switch banks.
//!
//! # Protocol Overview
//!
//! Line-oriented ASCII over USB serial, every line terminated with `\n`:
//!
//! - `<hertz>` sets the drive square-wave frequency (integer hertz).
//! - `freq` queries it; the firmware answers with one `<hertz>` line.
//! - `cap <mask>` closes the capacitor-bank switches selected by the
//!   decimal pin mask.
//! - `res <mask>` does the same for the load-resistor bank.
//! - `gate <0|1>` enables or disables the square-wave output.
//!
//! The board resets when the port opens, so the driver waits a grace
//! period and drains the boot banner before talking to it.
//!
//! The load resistors are soldered to the board; their values and pins
//! are fixed alongside the firmware and mirrored in
//! [`RESISTANCES_OHM`] / [`RESISTOR_PINS`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::adapters::ByteTransport;
use crate::error::{BenchError, Result};
use crate::instruments::bank::SwitchBank;
use crate::instruments::DriveController;
use crate::physics;

/// Wait after opening the port while the board reboots.
const INIT_GRACE: Duration = Duration::from_secs(1);

/// Overall deadline for one reply line (the port polls at 10 ms).
const REPLY_TIMEOUT: Duration = Duration::from_millis(250);

/// Load-resistor values soldered to the board, in Ω.
pub const RESISTANCES_OHM: [f64; 6] = [47.0, 100.0, 220.0, 470.0, 1000.0, 2200.0];

/// Digital pins gating [`RESISTANCES_OHM`], same order.
pub const RESISTOR_PINS: [u8; 6] = [8, 9, 10, 11, 12, 13];

/// Capacitance calibration measured on the assembled tank.
///
/// Rows map a switched capacitance sum to the resonance frequency actually
/// observed with it, which folds in stray inductance and capacitance the
/// LC formula cannot know about. When a table is present, frequency
/// autoset consults it instead of the formula.
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    points: Vec<(f64, f64)>,
}

impl CalibrationTable {
    /// Table with no points; lookups fall back to the LC formula.
    pub fn empty() -> Self {
        CalibrationTable { points: Vec::new() }
    }

    /// Load a tab-separated `capacitance_pF <TAB> f0_kHz` file. Lines that
    /// do not parse as two numbers (headers, comments) are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_path(path)
            .map_err(|e| BenchError::Settings(format!(
                "cannot read calibration table {}: {e}",
                path.display()
            )))?;
        let mut points = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| {
                BenchError::Settings(format!("calibration table parse error: {e}"))
            })?;
            let capacitance = record.get(0).and_then(|s| s.trim().parse::<f64>().ok());
            let frequency = record.get(1).and_then(|s| s.trim().parse::<f64>().ok());
            if let (Some(c), Some(f)) = (capacitance, frequency) {
                points.push((c, f));
            }
        }
        info!(
            "Loaded {} calibration points from {}",
            points.len(),
            path.display()
        );
        Ok(CalibrationTable { points })
    }

    /// Capacitance of the point whose measured resonance is nearest to
    /// `f_khz`, if any points exist.
    pub fn capacitance_for(&self, f_khz: f64) -> Option<f64> {
        self.points
            .iter()
            .min_by(|a, b| (a.1 - f_khz).abs().total_cmp(&(b.1 - f_khz).abs()))
            .map(|&(c, _)| c)
    }

    /// Number of calibration points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points were loaded.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Bench-side configuration for the microcontroller.
#[derive(Debug, Clone)]
pub struct ArduinoConfig {
    /// Always-connected tank capacitance in pF.
    pub base_capacitance_pf: f64,
    /// Switchable capacitor values in pF.
    pub capacitances_pf: Vec<f64>,
    /// Digital pins gating the capacitors, same order.
    pub capacitor_pins: Vec<u8>,
    /// Drive coil inductance in H, used to predict resonance.
    pub coil_inductance_h: f64,
    /// Measured capacitance/resonance pairs; may be empty.
    pub calibration: CalibrationTable,
}

/// Driver for the bench microcontroller behind any [`ByteTransport`].
pub struct ArduinoLink<T: ByteTransport> {
    transport: T,
    cap_bank: SwitchBank,
    res_bank: SwitchBank,
    coil_inductance_h: f64,
    calibration: CalibrationTable,
    /// Last switched capacitance sum in pF.
    capacitance_pf: Mutex<f64>,
}

impl<T: ByteTransport> ArduinoLink<T> {
    /// Wait out the boot grace, discard the banner, and build the switch
    /// tables.
    pub async fn new(transport: T, config: ArduinoConfig) -> Result<Self> {
        tokio::time::sleep(INIT_GRACE).await;
        transport.drain().await?;

        let cap_bank = SwitchBank::new(
            config.base_capacitance_pf,
            &config.capacitances_pf,
            &config.capacitor_pins,
        )?;
        let res_bank = SwitchBank::new(0.0, &RESISTANCES_OHM, &RESISTOR_PINS)?;
        if config.calibration.is_empty() {
            debug!("No resonance calibration points, autoset will use the LC formula");
        }
        let base = cap_bank.base();
        Ok(ArduinoLink {
            transport,
            cap_bank,
            res_bank,
            coil_inductance_h: config.coil_inductance_h,
            calibration: config.calibration,
            capacitance_pf: Mutex::new(base),
        })
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        self.transport
            .write_all(format!("{line}\n").as_bytes())
            .await
    }

    /// Target capacitance in pF that places the tank resonance at `f_khz`.
    fn resonance_target_pf(&self, f_khz: f64) -> f64 {
        if let Some(calibrated) = self.calibration.capacitance_for(f_khz) {
            return calibrated;
        }
        physics::capacitance_for_resonance(f_khz * 1e3, self.coil_inductance_h) * 1e12
    }
}

#[async_trait]
impl<T: ByteTransport> DriveController for ArduinoLink<T> {
    async fn set_frequency(&self, f_khz: f64, autoset_capacitance: bool) -> Result<()> {
        if !f_khz.is_finite() || f_khz <= 0.0 {
            return Err(BenchError::Validation(format!(
                "drive frequency must be positive, got {f_khz} kHz"
            )));
        }
        if autoset_capacitance {
            let target = self.resonance_target_pf(f_khz);
            let switched = self.set_capacitance(target).await?;
            debug!("Autoset {switched} pF for {f_khz} kHz (target {target:.1} pF)");
        }
        let hertz = (f_khz * 1e3).round() as u64;
        self.send_line(&hertz.to_string()).await
    }

    async fn read_frequency(&self) -> Result<f64> {
        self.send_line("freq").await?;
        let reply = self.transport.read_until(b"\n", REPLY_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&reply);
        let hertz: f64 = text.trim().parse().map_err(|_| {
            BenchError::Framing(format!("frequency reply is not a number: {:?}", text.trim()))
        })?;
        Ok(hertz / 1e3)
    }

    async fn set_capacitance(&self, target_pf: f64) -> Result<f64> {
        let combination = self.cap_bank.pick(target_pf);
        self.send_line(&format!("cap {}", combination.mask)).await?;
        *self.capacitance_pf.lock().await = combination.total;
        debug!(
            "Capacitor bank set to {} pF (mask {:#b}, pins {:?})",
            combination.total,
            combination.mask,
            self.cap_bank.mask_to_pins(combination.mask)
        );
        Ok(combination.total)
    }

    async fn set_resistance(&self, target_ohm: f64) -> Result<f64> {
        // A target of 0 or below selects the open bank (mask 0).
        let combination = self.res_bank.pick(target_ohm);
        self.send_line(&format!("res {}", combination.mask)).await?;
        Ok(combination.total)
    }

    async fn trigger_frequency_generation(&self, on: bool) -> Result<()> {
        self.send_line(if on { "gate 1" } else { "gate 0" }).await
    }

    async fn capacitance(&self) -> f64 {
        *self.capacitance_pf.lock().await
    }

    async fn capacitance_combinations(&self, lo_pf: f64, hi_pf: f64) -> Vec<f64> {
        self.cap_bank
            .combinations_in(lo_pf, hi_pf)
            .into_iter()
            .map(|c| c.total)
            .collect()
    }

    async fn resistance_combinations(&self, lo_ohm: f64, hi_ohm: f64) -> Vec<f64> {
        self.res_bank
            .combinations_in(lo_ohm, hi_ohm)
            .into_iter()
            .map(|c| c.total)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::ScriptedByteTransport;

    fn config() -> ArduinoConfig {
        ArduinoConfig {
            base_capacitance_pf: 0.0,
            capacitances_pf: vec![1000.0, 800.0],
            capacitor_pins: vec![2, 3],
            coil_inductance_h: 1.44e-3,
            calibration: CalibrationTable::empty(),
        }
    }

    async fn link(config: ArduinoConfig) -> ArduinoLink<ScriptedByteTransport> {
        ArduinoLink::new(ScriptedByteTransport::new(), config)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn set_frequency_writes_integer_hertz() {
        let link = link(config()).await;
        link.set_frequency(61.25, false).await.unwrap();
        assert_eq!(link.transport.writes(), vec!["61250\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn autoset_switches_capacitance_from_the_lc_formula() {
        let link = link(config()).await;
        // 1.44 mH at 100 kHz needs 1759 pF; sums are 0/800/1000/1800.
        link.set_frequency(100.0, true).await.unwrap();
        assert_eq!(link.transport.writes(), vec!["cap 3\n", "100000\n"]);
        assert_eq!(link.capacitance().await, 1800.0);
    }

    #[tokio::test(start_paused = true)]
    async fn autoset_prefers_the_calibration_table() {
        let mut config = config();
        config.capacitances_pf = vec![1500.0, 2200.0];
        config.calibration = CalibrationTable {
            points: vec![(1500.0, 95.0), (3700.0, 80.0)],
        };
        let link = link(config).await;

        // 94 kHz is nearest the 95 kHz point, so the 1500 pF sum is picked
        // even though the formula would ask for ~1991 pF.
        link.set_frequency(94.0, true).await.unwrap();
        assert_eq!(link.transport.writes(), vec!["cap 1\n", "94000\n"]);
        assert_eq!(link.capacitance().await, 1500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_frequency_returns_kilohertz() {
        let link = link(config()).await;
        link.transport.push_reply(b"61250\n");
        let f = link.read_frequency().await.unwrap();
        assert!((f - 61.25).abs() < 1e-9);
        assert_eq!(link.transport.writes(), vec!["freq\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resistor_bank_uses_the_soldered_values() {
        let link = link(config()).await;
        let applied = link.set_resistance(150.0).await.unwrap();
        assert_eq!(applied, 220.0);
        assert_eq!(link.transport.writes(), vec!["res 4\n"]);

        let sums = link.resistance_combinations(100.0, 400.0).await;
        assert_eq!(sums, vec![100.0, 147.0, 220.0, 267.0, 320.0, 367.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_lines_carry_the_flag() {
        let link = link(config()).await;
        link.trigger_frequency_generation(true).await.unwrap();
        link.trigger_frequency_generation(false).await.unwrap();
        assert_eq!(link.transport.writes(), vec!["gate 1\n", "gate 0\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_nonpositive_frequency() {
        let link = link(config()).await;
        assert!(link.set_frequency(0.0, false).await.is_err());
        assert!(link.set_frequency(f64::NAN, false).await.is_err());
    }

    #[test]
    fn calibration_table_loads_tsv_and_skips_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resonance_calibration.csv");
        std::fs::write(
            &path,
            "capacitance_pF\tf0_kHz\n# measured 2024-11\n1500\t95.0\n3700\t80.5\n",
        )
        .unwrap();

        let table = CalibrationTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.capacitance_for(94.0), Some(1500.0));
        assert_eq!(table.capacitance_for(70.0), Some(3700.0));
        assert!(CalibrationTable::empty().capacitance_for(94.0).is_none());
    }
}
