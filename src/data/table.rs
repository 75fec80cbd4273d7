//! In-memory measurement table.

use crate::error::{BenchError, Result};

/// One sweep's results: free-form header lines, named columns with units,
/// and numeric rows. Cells are optional so rows with a failed measurement
/// (a diverged fit, for example) persist with empty fields instead of
/// being dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    header_lines: Vec<String>,
    columns: Vec<String>,
    units: Vec<String>,
    rows: Vec<Vec<Option<f64>>>,
}

impl ResultTable {
    /// Build from `(column name, unit)` pairs, so the two line up by
    /// construction.
    pub fn new(spec: &[(&str, &str)]) -> Self {
        ResultTable {
            header_lines: Vec::new(),
            columns: spec.iter().map(|(name, _)| name.to_string()).collect(),
            units: spec.iter().map(|(_, unit)| unit.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Add a free-form line above the data sentinel.
    pub fn push_header_line(&mut self, line: impl Into<String>) {
        self.header_lines.push(line.into());
    }

    /// Append a row; every cell may be empty.
    pub fn push_row(&mut self, row: Vec<Option<f64>>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(BenchError::Validation(format!(
                "row has {} cells, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append a fully populated row.
    pub fn push_values(&mut self, row: &[f64]) -> Result<()> {
        self.push_row(row.iter().map(|&v| Some(v)).collect())
    }

    /// Header lines in insertion order.
    pub fn header_lines(&self) -> &[String] {
        &self.header_lines
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Column units, same order as [`columns`](Self::columns).
    pub fn units(&self) -> &[String] {
        &self.units
    }

    /// All rows.
    pub fn rows(&self) -> &[Vec<Option<f64>>] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows have been appended.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Paired `(x, y)` values for plotting; rows where either cell is
    /// empty are skipped.
    pub fn xy(&self, x_index: usize, y_index: usize) -> (Vec<f64>, Vec<f64>) {
        let mut xs = Vec::with_capacity(self.rows.len());
        let mut ys = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            if let (Some(Some(x)), Some(Some(y))) = (row.get(x_index), row.get(y_index)) {
                xs.push(*x);
                ys.push(*y);
            }
        }
        (xs, ys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_must_match_the_column_count() {
        let mut table = ResultTable::new(&[("Frequency", "kHz"), ("Voltage", "V")]);
        assert!(table.push_values(&[50.0, 4.2]).is_ok());
        assert!(table.push_values(&[50.0]).is_err());
        assert!(table.push_row(vec![Some(55.0), None]).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn xy_skips_rows_with_empty_cells() {
        let mut table = ResultTable::new(&[("x", ""), ("y", "")]);
        table.push_values(&[1.0, 10.0]).unwrap();
        table.push_row(vec![Some(2.0), None]).unwrap();
        table.push_values(&[3.0, 30.0]).unwrap();

        let (xs, ys) = table.xy(0, 1);
        assert_eq!(xs, vec![1.0, 3.0]);
        assert_eq!(ys, vec![10.0, 30.0]);
    }

    #[test]
    fn header_lines_keep_insertion_order() {
        let mut table = ResultTable::new(&[("x", "")]);
        table.push_header_line("first");
        table.push_header_line(String::from("second"));
        assert_eq!(table.header_lines(), &["first", "second"]);
    }
}
