//! Persistent bench settings.
//!
//! Settings live in `usr/global_settings.json` as two flat string maps:
//! `overwrite` (operator edits) and `default` (shipped values). Lookups
//! check `overwrite` first, then `default`, then the built-in table, so a
//! partially filled file never leaves the bench unconfigured.
//!
//! Every value is stored as a string and coerced at read time; numeric
//! parameters coerce to `f64`, list parameters (`capacitances`,
//! `arduino_pins`) split on commas, and `pid_parameters` parses as three
//! doubles.
//!
//! Stored units: capacitances in pF, `coil_inductance` in mH,
//! `circuit_resistance` in Ω, `pickup_coil_radius` in mm.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BenchError, Result};

/// Default on-disk location, relative to the working directory.
pub const DEFAULT_SETTINGS_PATH: &str = "usr/global_settings.json";

/// Keys the bench recognizes. Unknown keys are preserved but unused.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "source_address",
    "rigol_oscilloscope_address",
    "arduino_address",
    "default_saving_path",
    "base_capacitance",
    "capacitances",
    "arduino_pins",
    "coil_inductance",
    "circuit_resistance",
    "pickup_coil_windings",
    "pickup_coil_radius",
    "pid_parameters",
    "resonance_frequency_calibration_path",
];

fn builtin_default(key: &str) -> Option<&'static str> {
    match key {
        "source_address" => Some("/dev/ttyUSB0"),
        "rigol_oscilloscope_address" => Some("USB0::0x1AB1::0x0588::DS1ED141904883::INSTR"),
        "arduino_address" => Some("/dev/ttyACM0"),
        "default_saving_path" => Some("data"),
        "base_capacitance" => Some("33"),
        "capacitances" => Some("47,100,220,470,1000,2200"),
        "arduino_pins" => Some("2,3,4,5,6,7"),
        "coil_inductance" => Some("1.44"),
        "circuit_resistance" => Some("10.0"),
        "pickup_coil_windings" => Some("50"),
        "pickup_coil_radius" => Some("2.5"),
        "pid_parameters" => Some("0.5,0.2,0.0"),
        "resonance_frequency_calibration_path" => Some("usr/resonance_calibration.csv"),
        _ => None,
    }
}

/// On-disk shape of the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    overwrite: BTreeMap<String, String>,
    #[serde(default)]
    default: BTreeMap<String, String>,
}

/// Layered settings store with overwrite-over-default precedence.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    file: SettingsFile,
}

impl Settings {
    /// Settings with the built-in defaults materialized in the `default`
    /// section and an empty `overwrite` section.
    pub fn builtin() -> Self {
        let mut default = BTreeMap::new();
        for &key in RECOGNIZED_KEYS {
            if let Some(value) = builtin_default(key) {
                default.insert(key.to_string(), value.to_string());
            }
        }
        Settings {
            file: SettingsFile {
                overwrite: BTreeMap::new(),
                default,
            },
        }
    }

    /// Load from `path`, failing if the file is absent or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let file: SettingsFile = serde_json::from_str(&text)
            .map_err(|e| BenchError::Settings(format!("{}: {e}", path.display())))?;
        Ok(Settings { file })
    }

    /// Load from `path`, writing the built-in defaults there on first run.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Settings::load(path)
        } else {
            let settings = Settings::builtin();
            settings.save(path)?;
            info!(path = %path.display(), "created default settings file");
            Ok(settings)
        }
    }

    /// Persist both sections as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&self.file)
            .map_err(|e| BenchError::Settings(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Raw lookup: overwrite, then default, then the built-in table.
    pub fn get(&self, key: &str) -> Option<String> {
        self.file
            .overwrite
            .get(key)
            .or_else(|| self.file.default.get(key))
            .cloned()
            .or_else(|| builtin_default(key).map(str::to_string))
    }

    /// Place a value in the `overwrite` section.
    pub fn set_overwrite(&mut self, key: &str, value: &str) {
        self.file.overwrite.insert(key.into(), value.into());
    }

    /// String value for a required key.
    pub fn get_str(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| BenchError::Settings(format!("missing key '{key}'")))
    }

    /// Numeric value for a required key.
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        let raw = self.get_str(key)?;
        raw.trim()
            .parse::<f64>()
            .map_err(|_| BenchError::Settings(format!("key '{key}': '{raw}' is not a number")))
    }

    /// Comma-separated numeric list for a required key. Surrounding
    /// brackets and whitespace are tolerated.
    pub fn get_list_f64(&self, key: &str) -> Result<Vec<f64>> {
        let raw = self.get_str(key)?;
        let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
        let mut values = Vec::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let value = part.parse::<f64>().map_err(|_| {
                BenchError::Settings(format!("key '{key}': '{part}' is not a number"))
            })?;
            values.push(value);
        }
        if values.is_empty() {
            return Err(BenchError::Settings(format!("key '{key}': empty list")));
        }
        Ok(values)
    }

    /// The three PID gains `(kp, ki, kd)`.
    pub fn pid_parameters(&self) -> Result<(f64, f64, f64)> {
        let values = self.get_list_f64("pid_parameters")?;
        if values.len() != 3 {
            return Err(BenchError::Settings(format!(
                "pid_parameters needs exactly 3 values, got {}",
                values.len()
            )));
        }
        Ok((values[0], values[1], values[2]))
    }

    /// Check that every recognized key is present and coercible.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for &key in RECOGNIZED_KEYS {
            match key {
                "capacitances" | "arduino_pins" => {
                    self.get_list_f64(key).map_err(|e| e.to_string())?;
                }
                "pid_parameters" => {
                    self.pid_parameters().map_err(|e| e.to_string())?;
                }
                "source_address"
                | "rigol_oscilloscope_address"
                | "arduino_address"
                | "default_saving_path"
                | "resonance_frequency_calibration_path" => {
                    let value = self.get_str(key).map_err(|e| e.to_string())?;
                    if value.trim().is_empty() {
                        return Err(format!("key '{key}' is empty"));
                    }
                }
                _ => {
                    self.get_f64(key).map_err(|e| e.to_string())?;
                }
            }
        }
        Ok(())
    }
}

/// Snapshot of the numeric bench parameters, coerced once when a sweep or
/// regulator is constructed.
#[derive(Debug, Clone)]
pub struct GlobalParams {
    /// Always-connected tank capacitance in pF.
    pub base_capacitance_pf: f64,
    /// Switchable capacitor values in pF, one per digital pin.
    pub capacitances_pf: Vec<f64>,
    /// Digital pins gating the capacitors, same order as `capacitances_pf`.
    pub arduino_pins: Vec<u8>,
    /// Drive coil inductance in mH.
    pub coil_inductance_mh: f64,
    /// Series circuit resistance in Ω.
    pub circuit_resistance_ohm: f64,
    /// Pickup coil turn count.
    pub pickup_windings: f64,
    /// Pickup coil radius in mm.
    pub pickup_radius_mm: f64,
    /// PID gains `(kp, ki, kd)`.
    pub pid: (f64, f64, f64),
    /// Folder for measurement files.
    pub saving_path: PathBuf,
    /// Optional capacitance→resonance calibration table.
    pub calibration_path: PathBuf,
}

impl GlobalParams {
    /// Coerce from the string store, failing on the first bad value.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let capacitances_pf = settings.get_list_f64("capacitances")?;
        let arduino_pins: Vec<u8> = settings
            .get_list_f64("arduino_pins")?
            .into_iter()
            .map(|p| p as u8)
            .collect();
        if capacitances_pf.len() != arduino_pins.len() {
            return Err(BenchError::Settings(format!(
                "capacitances ({}) and arduino_pins ({}) differ in length",
                capacitances_pf.len(),
                arduino_pins.len()
            )));
        }
        Ok(GlobalParams {
            base_capacitance_pf: settings.get_f64("base_capacitance")?,
            capacitances_pf,
            arduino_pins,
            coil_inductance_mh: settings.get_f64("coil_inductance")?,
            circuit_resistance_ohm: settings.get_f64("circuit_resistance")?,
            pickup_windings: settings.get_f64("pickup_coil_windings")?,
            pickup_radius_mm: settings.get_f64("pickup_coil_radius")?,
            pid: settings.pid_parameters()?,
            saving_path: PathBuf::from(settings.get_str("default_saving_path")?),
            calibration_path: PathBuf::from(
                settings.get_str("resonance_frequency_calibration_path")?,
            ),
        })
    }

    /// Pickup radius in metres.
    pub fn pickup_radius_m(&self) -> f64 {
        self.pickup_radius_mm * 1e-3
    }

    /// Coil inductance in henry.
    pub fn coil_inductance_h(&self) -> f64 {
        self.coil_inductance_mh * 1e-3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_takes_precedence_over_default() {
        let mut settings = Settings::builtin();
        assert_eq!(settings.get_f64("circuit_resistance").unwrap(), 10.0);
        settings.set_overwrite("circuit_resistance", "22.5");
        assert_eq!(settings.get_f64("circuit_resistance").unwrap(), 22.5);
    }

    #[test]
    fn builtin_table_backs_missing_keys() {
        let settings = Settings::default();
        // Empty store, every recognized key still resolves.
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn pid_parameters_parse_as_three_doubles() {
        let mut settings = Settings::builtin();
        settings.set_overwrite("pid_parameters", "1.5, 0.25, 0.01");
        assert_eq!(settings.pid_parameters().unwrap(), (1.5, 0.25, 0.01));

        settings.set_overwrite("pid_parameters", "1.0,2.0");
        assert!(settings.pid_parameters().is_err());
    }

    #[test]
    fn lists_tolerate_brackets_and_spaces() {
        let mut settings = Settings::builtin();
        settings.set_overwrite("capacitances", "[47, 100, 220]");
        assert_eq!(
            settings.get_list_f64("capacitances").unwrap(),
            vec![47.0, 100.0, 220.0]
        );
    }

    #[test]
    fn bad_numbers_are_reported_with_the_key() {
        let mut settings = Settings::builtin();
        settings.set_overwrite("coil_inductance", "one point four");
        let err = settings.get_f64("coil_inductance").unwrap_err();
        assert!(err.to_string().contains("coil_inductance"));
    }

    #[test]
    fn load_or_create_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usr").join("global_settings.json");

        let created = Settings::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.get_str("default_saving_path").unwrap(), "data");

        let mut edited = created;
        edited.set_overwrite("base_capacitance", "47");
        edited.save(&path).unwrap();

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded.get_f64("base_capacitance").unwrap(), 47.0);
    }

    #[test]
    fn global_params_coerce_and_check_lengths() {
        let params = GlobalParams::from_settings(&Settings::builtin()).unwrap();
        assert_eq!(params.capacitances_pf.len(), params.arduino_pins.len());
        assert_eq!(params.pid, (0.5, 0.2, 0.0));
        assert!((params.coil_inductance_h() - 1.44e-3).abs() < 1e-12);

        let mut bad = Settings::builtin();
        bad.set_overwrite("arduino_pins", "2,3");
        assert!(GlobalParams::from_settings(&bad).is_err());
    }
}
