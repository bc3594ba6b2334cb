//! Reader for measurement logs written by [`MeasurementLog`](crate::MeasurementLog).

use crate::error::StorageError;
use crate::log_file::{TIMESTAMP_COLUMN, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;
use probe_core::CvReading;
use std::io::Read;
use std::path::Path;

/// One parsed log row.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Local wall-clock time of the reading, second resolution.
    pub timestamp: NaiveDateTime,
    /// Source voltage in volts.
    pub voltage: f64,
    /// Measured current in amps.
    pub current: f64,
    /// Frequency converted back to hertz.
    pub cv: Option<CvReading>,
}

/// Parse every data row of a log, skipping comments, blank lines and
/// column headers.
pub fn parse_log(reader: impl Read) -> Result<Vec<LogRecord>, StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .comment(Some(b'#'))
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|e| StorageError::Parse {
            line: e.position().map_or(0, |p| p.line() as usize),
            message: e.to_string(),
        })?;
        if row.get(0) == Some(TIMESTAMP_COLUMN) {
            continue;
        }
        records.push(parse_row(&row)?);
    }
    Ok(records)
}

/// Parse the log file at `path`.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogRecord>, StorageError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| StorageError::io(path, e))?;
    parse_log(file)
}

fn parse_row(row: &csv::StringRecord) -> Result<LogRecord, StorageError> {
    let line = row.position().map_or(0, |p| p.line() as usize);
    if row.len() != 3 && row.len() != 6 {
        return Err(StorageError::Parse {
            line,
            message: format!("expected 3 or 6 fields, found {}", row.len()),
        });
    }
    let field = |i: usize| row.get(i).unwrap_or_default();
    let number = |i: usize| -> Result<f64, StorageError> {
        field(i).parse::<f64>().map_err(|e| StorageError::Parse {
            line,
            message: format!("field {} '{}': {}", i + 1, field(i), e),
        })
    };
    let timestamp =
        NaiveDateTime::parse_from_str(field(0), TIMESTAMP_FORMAT).map_err(|e| StorageError::Parse {
            line,
            message: format!("timestamp '{}': {}", field(0), e),
        })?;
    let cv = if row.len() == 6 {
        Some(CvReading {
            capacitance: number(3)?,
            resistance: number(4)?,
            frequency: number(5)? * 1000.0,
        })
    } else {
        None
    };
    Ok(LogRecord {
        timestamp,
        voltage: number(1)?,
        current: number(2)?,
        cv,
    })
}
