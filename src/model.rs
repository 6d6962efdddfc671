//! Core tabular data model shared by the pipeline phases.

use serde::{Deserialize, Serialize};

/// A single scalar value inside a frame. The flattener only ever produces
/// scalars; array- and object-valued leaves are rejected upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Treats `Null` and blank text alike, matching how empty upstream
    /// fields are handled throughout the pipeline.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Null => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used for port matching: accepts both JSON numbers and
    /// numeric strings like `"12"` or `"12.0"`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

/// A flat, schema-conformant table: an ordered column list plus rows whose
/// cells positionally match the columns. Every row in a frame carries the
/// exact same column set in the exact same order.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Append a row; the cell count must match the column count.
    pub fn push_row(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn set(&mut self, row: usize, column: &str, value: Cell) {
        if let Some(idx) = self.column_index(column) {
            if let Some(r) = self.rows.get_mut(row) {
                r[idx] = value;
            }
        }
    }

    /// Project to `keep`, preserving the order of `keep`. Columns absent
    /// from the frame come out as all-null; source columns not listed are
    /// dropped. Used both to conform to a job's expected schema and to
    /// project out columns the live destination does not carry.
    pub fn project(&self, keep: &[String]) -> Frame {
        let indices: Vec<Option<usize>> = keep.iter().map(|c| self.column_index(c)).collect();
        let mut out = Frame::new(keep.to_vec());
        for row in &self.rows {
            let cells = indices
                .iter()
                .map(|idx| match idx {
                    Some(i) => row[*i].clone(),
                    None => Cell::Null,
                })
                .collect();
            out.push_row(cells);
        }
        out
    }

    /// Drop rows for which `pred` returns false.
    pub fn retain_rows<F: FnMut(&[Cell]) -> bool>(&mut self, mut pred: F) {
        self.rows.retain(|r| pred(r));
    }
}

/// How a job writes into its destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadMode {
    /// Full refresh: truncate, then plain inserts.
    Truncate,
    /// Insert-or-update on the natural primary key (the upstream record id).
    Upsert { key: &'static str },
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Truncate => "truncate",
            LoadMode::Upsert { .. } => "upsert",
        }
    }
}

/// What null-like values become in the final frame. Database loads keep
/// true nulls; display/CSV-shaped outputs use empty strings. The two are
/// not interchangeable and each job picks one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullPolicy {
    DatabaseNull,
    EmptyString,
}

/// Per-job aggregate of row-level enrichment outcomes. Row failures never
/// abort the batch; they are counted here and logged once per job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichSummary {
    pub looked_up: usize,
    pub skipped_incomplete: usize,
    pub invalid_port: usize,
    pub upstream_not_found: usize,
    pub port_not_found: usize,
    pub auth_errors: usize,
    pub transport_errors: usize,
    pub connected: usize,
}

impl EnrichSummary {
    pub fn total_rows(&self) -> usize {
        self.looked_up + self.skipped_incomplete + self.invalid_port
    }
}

/// Final accounting for one job run.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub job: String,
    pub records_fetched: usize,
    pub rows_loaded: usize,
    pub chunks_failed: usize,
    pub enrich: Option<EnrichSummary>,
}

impl JobReport {
    pub fn empty(job: &str) -> Self {
        Self {
            job: job.to_string(),
            ..Default::default()
        }
    }

    /// A job degrades (rather than fails) when some chunks committed and
    /// others did not.
    pub fn is_degraded(&self) -> bool {
        self.chunks_failed > 0
    }
}
