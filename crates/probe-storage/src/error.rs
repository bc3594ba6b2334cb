use probe_core::SweepError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the log writer, log parser and plot sinks.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A file operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Writing a log record failed.
    #[error("Record error on '{path}': {source}")]
    Csv {
        /// Log file being written.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: csv::Error,
    },

    /// A log line could not be parsed.
    #[error("Malformed log line {line}: {message}")]
    Parse {
        /// 1-based line number, 0 when unknown.
        line: usize,
        /// What was wrong with the line.
        message: String,
    },

    /// Write after close.
    #[error("Log file '{0}' is not open")]
    NotOpen(PathBuf),

    /// A plot backend failed.
    #[error("Plot error: {0}")]
    Plot(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        StorageError::Csv {
            path: path.into(),
            source,
        }
    }
}

impl From<StorageError> for SweepError {
    fn from(err: StorageError) -> Self {
        SweepError::Storage(err.to_string())
    }
}
