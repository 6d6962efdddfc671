//! Record flattener/normalizer: turns a batch of nested Salesforce records
//! into a flat, schema-conformant [`Frame`].
//!
//! The steps run in a fixed order and each is independently testable:
//! flatten → strip metadata keys → timestamp coercion → value remap →
//! column rename → conform to the expected column list → null policy →
//! optional row filter. A parse failure on one value never aborts the
//! batch; the raw value is kept and a warning is logged, because partially
//! malformed upstream data is expected.

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use crate::model::{Cell, Frame, NullPolicy};

/// Separator joining nested object paths, matching the warehouse column
/// naming convention (`WorkOrder__r.Status` → `WorkOrder__r_Status`).
pub const PATH_SEPARATOR: char = '_';

/// Keys containing this infix are Salesforce envelope metadata, not data.
pub const METADATA_MARKER: &str = "attributes";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("array-valued field '{0}' cannot be flattened")]
    ArrayLeaf(String),
}

/// Everything the normalizer needs to know about one job's shape.
#[derive(Debug, Clone)]
pub struct NormalizeSpec {
    /// Flattened source column names holding timestamps to localize.
    pub timestamp_cols: Vec<String>,
    /// Per-column value → label remaps, applied on flattened source names.
    pub value_maps: HashMap<String, HashMap<String, String>>,
    /// Flattened source name → destination column name.
    pub rename: Vec<(String, String)>,
    /// The destination schema: exact output column set and order.
    pub expected: Vec<String>,
    pub utc_offset_hours: i32,
    pub null_policy: NullPolicy,
    /// Optional equality filter on a destination column; the only permitted
    /// row drop in the pipeline.
    pub keep_where: Option<(String, String)>,
}

impl NormalizeSpec {
    pub fn offset(&self) -> FixedOffset {
        // Validated by config to be within ±14h.
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| {
            FixedOffset::east_opt(0).expect("zero offset is always valid")
        })
    }
}

/// Flatten one nested record into `(path, cell)` pairs, joining levels with
/// [`PATH_SEPARATOR`]. Scalar leaves only: the upstream queries never
/// return arrays here, so an array leaf is rejected explicitly instead of
/// being silently mangled.
pub fn flatten_record(record: &Value) -> Result<Vec<(String, Cell)>, NormalizeError> {
    let obj = record.as_object().ok_or(NormalizeError::NotAnObject)?;
    let mut out = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        flatten_into(key.clone(), value, &mut out)?;
    }
    Ok(out)
}

fn flatten_into(
    path: String,
    value: &Value,
    out: &mut Vec<(String, Cell)>,
) -> Result<(), NormalizeError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(format!("{path}{PATH_SEPARATOR}{key}"), child, out)?;
            }
            Ok(())
        }
        Value::Array(_) => Err(NormalizeError::ArrayLeaf(path)),
        Value::Null => {
            out.push((path, Cell::Null));
            Ok(())
        }
        Value::Bool(b) => {
            out.push((path, Cell::Bool(*b)));
            Ok(())
        }
        Value::Number(n) => {
            out.push((path, Cell::Number(n.as_f64().unwrap_or(0.0))));
            Ok(())
        }
        Value::String(s) => {
            out.push((path, Cell::Text(s.clone())));
            Ok(())
        }
    }
}

/// Lightweight probe distinguishing a full ISO timestamp from a bare date
/// or arbitrary text, so mixed-format columns never need a throwing parse
/// per value: full timestamps are longer than a date and carry a `T`.
pub fn looks_like_timestamp(s: &str) -> bool {
    s.len() > 10 && s.as_bytes().get(4) == Some(&b'-') && s.contains('T')
}

/// Convert one timestamp cell to the canonical local `YYYY-MM-DD HH:MM:SS`
/// string. Returns `None` when the value should be left untouched: bare
/// dates pass through unchanged and unparseable values degrade to as-is.
pub fn convert_timestamp(cell: &Cell, offset: FixedOffset) -> Option<String> {
    match cell {
        // Epoch milliseconds, as some formula fields serialize.
        Cell::Number(n) => {
            let millis = *n as i64;
            let dt = Utc.timestamp_millis_opt(millis).single()?;
            Some(dt.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string())
        }
        Cell::Text(s) => {
            if !looks_like_timestamp(s) {
                return None;
            }
            // Salesforce emits offsets like "+0000"; the API never sends a
            // bare "Z" but RFC 3339 values are accepted as a fallback.
            if let Ok(dt) = chrono::DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
                return Some(dt.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string());
            }
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string());
            }
            // Offset-less values are already local; render without shifting.
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(dt.format("%Y-%m-%d %H:%M:%S").to_string());
            }
            None
        }
        _ => None,
    }
}

/// Run the full normalization pipeline over one buffered batch of records.
/// The output frame's column set exactly equals `spec.expected`, in order,
/// regardless of which optional fields the upstream happened to return.
pub fn normalize_batch(records: &[Value], spec: &NormalizeSpec) -> Result<Frame, NormalizeError> {
    let offset = spec.offset();
    let rename: HashMap<&str, &str> = spec
        .rename
        .iter()
        .map(|(from, to)| (from.as_str(), to.as_str()))
        .collect();

    let mut frame = Frame::new(spec.expected.clone());

    for record in records {
        let mut flat = flatten_record(record)?;

        // Strip envelope metadata (case-sensitive infix match).
        flat.retain(|(key, _)| !key.contains(METADATA_MARKER));

        let mut row: HashMap<String, Cell> = HashMap::with_capacity(flat.len());
        for (key, mut cell) in flat {
            if spec.timestamp_cols.iter().any(|c| c == &key) {
                match convert_timestamp(&cell, offset) {
                    Some(converted) => cell = Cell::Text(converted),
                    None => {
                        if let Cell::Text(s) = &cell {
                            // Bare dates are expected; anything else that
                            // probed as a timestamp but failed to parse is
                            // kept raw and reported.
                            if looks_like_timestamp(s) {
                                warn!(column = %key, value = %s, "timestamp parse failed; keeping raw value");
                            }
                        }
                    }
                }
            }

            if let Some(map) = spec.value_maps.get(&key) {
                if let Cell::Text(s) = &cell {
                    if let Some(label) = map.get(s) {
                        cell = Cell::Text(label.clone());
                    }
                }
            }

            let out_name = rename.get(key.as_str()).map_or(key.as_str(), |v| v);
            row.insert(out_name.to_string(), cell);
        }

        // Conform: every expected column exists; extras are dropped here.
        let cells = spec
            .expected
            .iter()
            .map(|col| row.remove(col).unwrap_or(Cell::Null))
            .collect();
        frame.push_row(cells);
    }

    if let Some((col, wanted)) = &spec.keep_where {
        if let Some(idx) = frame.column_index(col) {
            frame.retain_rows(|cells| cells[idx].as_text() == Some(wanted.as_str()));
        }
    }

    if spec.null_policy == NullPolicy::EmptyString {
        let mut filled = Frame::new(frame.columns().to_vec());
        for row in frame.rows() {
            filled.push_row(
                row.iter()
                    .map(|c| match c {
                        Cell::Null => Cell::Text(String::new()),
                        other => other.clone(),
                    })
                    .collect(),
            );
        }
        return Ok(filled);
    }

    Ok(frame)
}
