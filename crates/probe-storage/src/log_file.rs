//! Append-only measurement log.
//!
//! # Format
//!
//! ```text
//! # 2026/10/16-14:02:11 IV sweep: 71 targets from 0 V to -700 V, Imax 5e-5 A
//! Date-Time Voltage(V) Current(A)
//! 2026/10/16-14:02:13 0 1.3e-12
//! 2026/10/16-14:02:15 -10 -2.41e-9
//! ```
//!
//! CV logs add `Capacitance(F) Resistance(Ohm) Frequency(kHz)` columns.
//! Each sweep appends its own comment block and header line, so repeated
//! runs accumulate in one file. Numbers are written in Rust's shortest
//! round-trip form, so parsing a row returns the exact values written.

use crate::error::StorageError;
use probe_core::{Measurement, SweepKind, SweepSpec};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Timestamp layout of the first column.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d-%H:%M:%S";

/// First field of every column header record.
pub const TIMESTAMP_COLUMN: &str = "Date-Time";

const IV_COLUMNS: &[&str] = &[TIMESTAMP_COLUMN, "Voltage(V)", "Current(A)"];
const CV_COLUMNS: &[&str] = &[
    TIMESTAMP_COLUMN,
    "Voltage(V)",
    "Current(A)",
    "Capacitance(F)",
    "Resistance(Ohm)",
    "Frequency(kHz)",
];

/// Column header record for a sweep type.
pub fn header_fields(kind: SweepKind) -> &'static [&'static str] {
    if kind.is_cv() {
        CV_COLUMNS
    } else {
        IV_COLUMNS
    }
}

/// Fields of one log row.
pub fn row_fields(measurement: &Measurement) -> Vec<String> {
    let mut fields = vec![
        measurement.timestamp().format(TIMESTAMP_FORMAT).to_string(),
        measurement.voltage().to_string(),
        format!("{:e}", measurement.current()),
    ];
    if let Some(cv) = measurement.cv_reading() {
        fields.push(format!("{:e}", cv.capacitance));
        fields.push(format!("{:e}", cv.resistance));
        fields.push((cv.frequency / 1000.0).to_string());
    }
    fields
}

/// Space-delimited record writer shared by the header and data rows.
pub(crate) fn record_writer<W: Write>(inner: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(inner)
}

fn preamble(spec: &SweepSpec) -> String {
    let targets = spec.targets();
    let first = targets.first().copied().unwrap_or_default();
    let last = targets.last().copied().unwrap_or_default();
    let mut line = format!(
        "# {} {} sweep: {} targets from {} V to {} V, Imax {:e} A",
        chrono::Local::now().format(TIMESTAMP_FORMAT),
        spec.kind(),
        targets.len(),
        first,
        last,
        spec.imax
    );
    if let Some(bias) = &spec.bias {
        line.push_str(&format!(", bias {} V", bias.voltage));
    }
    if !spec.frequencies.is_empty() {
        let khz: Vec<String> = spec
            .frequencies
            .iter()
            .map(|f| format!("{}", f / 1000.0))
            .collect();
        line.push_str(&format!(", frequencies {} kHz", khz.join(",")));
    }
    line.push('\n');
    line
}

/// Append-mode writer for one log file.
pub struct MeasurementLog {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: usize,
}

impl MeasurementLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;
        info!(path = %path.display(), "Measurement log opened");
        Ok(Self {
            path,
            writer: Some(record_writer(file)),
            rows: 0,
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this writer.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Write the comment block and column header for a new sweep.
    ///
    /// The comment line goes straight to the file; the header is a record.
    pub fn write_preamble(&mut self, spec: &SweepSpec) -> Result<(), StorageError> {
        let comment = preamble(spec);
        let path = self.path.clone();
        let writer = self.writer_mut()?;
        writer.flush().map_err(|e| StorageError::io(&path, e))?;
        let mut file: &File = writer.get_ref();
        file
            .write_all(comment.as_bytes())
            .map_err(|e| StorageError::io(&path, e))?;
        self.write_flushed(header_fields(spec.kind()))
    }

    /// Append one row and flush it to disk.
    pub fn append(&mut self, measurement: &Measurement) -> Result<(), StorageError> {
        self.write_flushed(row_fields(measurement))?;
        self.rows += 1;
        debug!(path = %self.path.display(), rows = self.rows, "Row appended");
        Ok(())
    }

    /// Flush and release the file.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| StorageError::io(&self.path, e))?;
        }
        Ok(())
    }

    fn writer_mut(&mut self) -> Result<&mut csv::Writer<File>, StorageError> {
        self.writer
            .as_mut()
            .ok_or_else(|| StorageError::NotOpen(self.path.clone()))
    }

    fn write_flushed<I, T>(&mut self, record: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let path = self.path.clone();
        let writer = self.writer_mut()?;
        writer
            .write_record(record)
            .map_err(|e| StorageError::csv(&path, e))?;
        writer.flush().map_err(|e| StorageError::io(&path, e))
    }
}
