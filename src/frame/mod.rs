//! In-memory `(symbol, timestamp)` tables.
//!
//! A [`Frame`] is an ordered columnar table with a two-level index and a
//! per-symbol row-range map, enough to support the group-by operations the
//! resample/align engine needs without a dataframe dependency. Values are
//! `f64`; missing cells are NaN. Query results are frames; callers own them.

mod align;
mod resample;

use std::ops::Range;

use anyhow::{bail, Result};

pub use align::{align_to_kline_timestamps, resample_and_align, AlignMethod, Aligned};
pub use resample::{kline_agg, resample_klines, resample_with_strategy, Agg};

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    /// Row index, sorted ascending by `(symbol, timestamp)`, no duplicates.
    index: Vec<(String, i64)>,
    /// Column-major cells: `values[col][row]`.
    values: Vec<Vec<f64>>,
    /// Contiguous row range per symbol, in index order.
    symbol_ranges: Vec<(String, Range<usize>)>,
}

impl Frame {
    /// Empty frame with the given column set.
    pub fn empty(columns: Vec<String>) -> Self {
        let values = columns.iter().map(|_| Vec::new()).collect();
        Self {
            columns,
            index: Vec::new(),
            values,
            symbol_ranges: Vec::new(),
        }
    }

    /// Build from unsorted rows. Rows are sorted by `(symbol, timestamp)`;
    /// on duplicate keys the last row wins.
    pub fn from_rows(columns: Vec<String>, mut rows: Vec<(String, i64, Vec<f64>)>) -> Result<Self> {
        for (_, _, cells) in &rows {
            if cells.len() != columns.len() {
                bail!(
                    "row has {} cells, frame has {} columns",
                    cells.len(),
                    columns.len()
                );
            }
        }
        rows.sort_by(|a, b| (a.0.as_str(), a.1).cmp(&(b.0.as_str(), b.1)));
        // Last write wins on duplicate (symbol, timestamp).
        rows.reverse();
        rows.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
        rows.reverse();

        let mut frame = Self::empty(columns);
        frame.index.reserve(rows.len());
        for col in &mut frame.values {
            col.reserve(rows.len());
        }
        for (symbol, ts, cells) in rows {
            frame.index.push((symbol, ts));
            for (col, cell) in frame.values.iter_mut().zip(cells) {
                col.push(cell);
            }
        }
        frame.rebuild_ranges();
        Ok(frame)
    }

    fn rebuild_ranges(&mut self) {
        self.symbol_ranges.clear();
        let n = self.index.len();
        let mut start = 0usize;
        for row in 1..=n {
            if row == n || self.index[row].0 != self.index[start].0 {
                self.symbol_ranges
                    .push((self.index[start].0.clone(), start..row));
                start = row;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn index(&self) -> &[(String, i64)] {
        &self.index
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.column_position(name).map(|i| self.values[i].as_slice())
    }

    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.values[col][row]
    }

    /// Distinct symbols in index order.
    pub fn symbols(&self) -> Vec<String> {
        self.symbol_ranges.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn symbol_ranges(&self) -> &[(String, Range<usize>)] {
        &self.symbol_ranges
    }

    pub fn symbol_range(&self, symbol: &str) -> Option<Range<usize>> {
        self.symbol_ranges
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, r)| r.clone())
    }

    /// Timestamps of one symbol's rows.
    pub fn symbol_timestamps(&self, range: &Range<usize>) -> impl Iterator<Item = i64> + '_ {
        self.index[range.clone()].iter().map(|(_, ts)| *ts)
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        match self.column_position(from) {
            Some(pos) => {
                self.columns[pos] = to.to_string();
                Ok(())
            }
            None => bail!("no such column: {from}"),
        }
    }

    pub fn drop_column(&mut self, name: &str) -> Result<Vec<f64>> {
        match self.column_position(name) {
            Some(pos) => {
                self.columns.remove(pos);
                Ok(self.values.remove(pos))
            }
            None => bail!("no such column: {name}"),
        }
    }

    /// Append a column whose values are aligned to this frame's rows.
    pub fn add_column(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.index.len() {
            bail!(
                "column {name} has {} values, frame has {} rows",
                values.len(),
                self.index.len()
            );
        }
        if self.column_position(name).is_some() {
            bail!("column {name} already exists");
        }
        self.columns.push(name.to_string());
        self.values.push(values);
        Ok(())
    }

    /// Merge another frame's columns into this one. The other frame must be
    /// indexed identically (the alignment engine guarantees this).
    pub fn merge_columns(&mut self, other: &Frame) -> Result<()> {
        if other.index != self.index {
            bail!("cannot merge frames with different indexes");
        }
        for (name, col) in other.columns.iter().zip(&other.values) {
            self.add_column(name, col.clone())?;
        }
        Ok(())
    }

    /// All distinct UTC day keys (`YYYYMMDD`) covered by the index, sorted.
    pub fn day_keys(&self) -> Vec<String> {
        let mut days: Vec<String> = self
            .index
            .iter()
            .map(|(_, ts)| crate::time::day_key(*ts))
            .collect();
        days.sort();
        days.dedup();
        days
    }

    /// Rows whose timestamp falls inside `[start_ms, end_ms]`, as a new
    /// frame preserving column order.
    pub fn slice_time(&self, start_ms: i64, end_ms: i64) -> Frame {
        let mut rows = Vec::new();
        for (row, (symbol, ts)) in self.index.iter().enumerate() {
            if *ts >= start_ms && *ts <= end_ms {
                let cells = self.values.iter().map(|col| col[row]).collect();
                rows.push((symbol.clone(), *ts, cells));
            }
        }
        Frame::from_rows(self.columns.clone(), rows).expect("slice preserves arity")
    }

}
