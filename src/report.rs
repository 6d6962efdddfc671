//! CSV report sink for display-shaped outputs. Unlike warehouse loads,
//! reports carry human-facing column headers and render nulls as empty
//! fields.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::model::{Cell, Frame};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Excel in pt-BR locales only decodes UTF-8 when the BOM is present, and
/// the headers carry accented characters.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Write the frame as a CSV file, header row first, creating parent
/// directories as needed. The file is replaced wholesale on every run.
pub fn write_csv(frame: &Frame, path: &Path) -> Result<usize, ReportError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut file = File::create(path)?;
    file.write_all(UTF8_BOM)?;

    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(frame.columns())?;
    for row in frame.rows() {
        writer.write_record(row.iter().map(cell_field))?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = frame.len(), "report written");
    Ok(frame.len())
}

fn cell_field(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Bool(b) => b.to_string(),
        Cell::Number(n) => {
            if n.fract() == 0.0 {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        Cell::Text(s) => s.clone(),
    }
}
