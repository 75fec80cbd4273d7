//! Measurement file naming and writing.
//!
//! # File format
//!
//! ```text
//! <free-form header lines>
//! ### Measurement data ###
//! Frequency<TAB>Voltage<TAB>...
//! kHz<TAB>V<TAB>...
//! 50<TAB>4.2<TAB>...
//! ```
//!
//! Tab-delimited with `.` as the decimal point, `\n` line ends and no
//! quoting; empty cells stay empty. Files are named
//! `<YYYY-MM-DD>_<batch>_d<device>[_<suffix>].csv`; when that name is
//! taken, a `_02`, `_03`, ... counter is swapped in until a free name is
//! found, so repeated runs of the same batch never overwrite each other.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use log::info;

use crate::data::table::ResultTable;
use crate::error::Result;

/// Separates the free-form header from the column block.
pub const DATA_SENTINEL: &str = "### Measurement data ###";

/// File name for one measurement, without collision handling.
pub fn measurement_file_name(
    date: NaiveDate,
    batch: &str,
    device: u32,
    suffix: Option<&str>,
) -> String {
    let mut name = format!("{}_{}_d{}", date.format("%Y-%m-%d"), batch, device);
    if let Some(suffix) = suffix {
        name.push('_');
        name.push_str(suffix);
    }
    name.push_str(".csv");
    name
}

/// Collision-free path for one measurement file under `folder`.
pub fn measurement_path(
    folder: &Path,
    date: NaiveDate,
    batch: &str,
    device: u32,
    suffix: Option<&str>,
) -> PathBuf {
    resolve_collision(folder.join(measurement_file_name(date, batch, device, suffix)))
}

/// Swap a `_NN` counter into the file stem until the name is free.
fn resolve_collision(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut counter = 2u32;
    loop {
        let candidate = parent.join(format!("{stem}_{counter:02}.csv"));
        if !candidate.exists() {
            info!(
                "'{}' already exists, writing to '{}'",
                path.display(),
                candidate.display()
            );
            return candidate;
        }
        counter += 1;
    }
}

/// Incremental writer: header and column block on create, rows flushed to
/// disk as they are appended.
pub struct TableWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl TableWriter {
    /// Create the file, write the free-form header, the sentinel and the
    /// column/unit lines. Missing parent directories are created.
    pub fn create(
        path: &Path,
        header_lines: &[String],
        columns: &[String],
        units: &[String],
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = File::create(path)?;
        for line in header_lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.write_all(DATA_SENTINEL.as_bytes())?;
        file.write_all(b"\n")?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .from_writer(file);
        writer.write_record(columns)?;
        writer.write_record(units)?;
        info!("Measurement file created at '{}'", path.display());
        Ok(TableWriter {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Append one row and flush it, so a crash loses at most the current
    /// row.
    pub fn append_row(&mut self, row: &[Option<f64>]) -> Result<()> {
        let record: Vec<String> = row
            .iter()
            .map(|cell| cell.map(|v| v.to_string()).unwrap_or_default())
            .collect();
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Where the rows are going.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close.
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        info!("Measurement file '{}' closed", self.path.display());
        Ok(())
    }
}

/// Write a complete table in one go.
pub fn write_table(path: &Path, table: &ResultTable) -> Result<()> {
    let mut writer = TableWriter::create(
        path,
        table.header_lines(),
        table.columns(),
        table.units(),
    )?;
    for row in table.rows() {
        writer.append_row(row)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 23).unwrap()
    }

    #[test]
    fn file_names_carry_date_batch_device_and_suffix() {
        assert_eq!(
            measurement_file_name(date(), "batchA", 3, Some("freq_scan")),
            "2026-08-23_batchA_d3_freq_scan.csv"
        );
        assert_eq!(
            measurement_file_name(date(), "batchA", 3, None),
            "2026-08-23_batchA_d3.csv"
        );
    }

    #[test]
    fn collisions_swap_in_a_counter_instead_of_stacking() {
        let dir = tempfile::tempdir().unwrap();
        let first = measurement_path(dir.path(), date(), "b", 1, Some("freq_scan"));
        assert_eq!(
            first.file_name().unwrap().to_str().unwrap(),
            "2026-08-23_b_d1_freq_scan.csv"
        );
        std::fs::write(&first, "x").unwrap();

        let second = measurement_path(dir.path(), date(), "b", 1, Some("freq_scan"));
        assert_eq!(
            second.file_name().unwrap().to_str().unwrap(),
            "2026-08-23_b_d1_freq_scan_02.csv"
        );
        std::fs::write(&second, "x").unwrap();

        let third = measurement_path(dir.path(), date(), "b", 1, Some("freq_scan"));
        assert_eq!(
            third.file_name().unwrap().to_str().unwrap(),
            "2026-08-23_b_d1_freq_scan_03.csv"
        );
    }

    #[test]
    fn layout_is_header_sentinel_columns_units_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let mut table = ResultTable::new(&[("Frequency", "kHz"), ("Voltage", "V")]);
        table.push_header_line("Device 3, batch A");
        table.push_values(&[50.0, 4.2]).unwrap();
        table.push_row(vec![Some(55.0), None]).unwrap();
        write_table(&path, &table).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "Device 3, batch A\n\
             ### Measurement data ###\n\
             Frequency\tVoltage\n\
             kHz\tV\n\
             50\t4.2\n\
             55\t\n"
        );
    }

    #[test]
    fn incremental_rows_hit_the_disk_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lifetime.csv");

        let mut writer = TableWriter::create(
            &path,
            &[],
            &["time_s".to_string(), "ME Voltage".to_string()],
            &["s".to_string(), "V".to_string()],
        )
        .unwrap();
        writer.append_row(&[Some(0.0), Some(0.5)]).unwrap();

        // Visible on disk while the writer is still open.
        let partial = std::fs::read_to_string(&path).unwrap();
        assert!(partial.ends_with("0\t0.5\n"));

        writer.append_row(&[Some(30.0), Some(0.6)]).unwrap();
        writer.finish().unwrap();
        let full = std::fs::read_to_string(&path).unwrap();
        assert_eq!(full.lines().count(), 5);
    }
}
