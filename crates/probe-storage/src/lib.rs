//! Result storage for probe-station sweeps.
//!
//! - [`MeasurementLog`]: append-mode, space-separated measurement log
//! - [`parse_log`] / [`read_log`]: reader for that format
//! - [`PlotSink`]: live plot seam, with [`NullPlot`] and [`SvgPlot`]
//! - [`ResultSink`]: the `MeasurementSink` used by the sweep engine

pub mod error;
pub mod log_file;
pub mod parse;
pub mod plot;
pub mod sink;

pub use error::StorageError;
pub use log_file::{header_fields, row_fields, MeasurementLog, TIMESTAMP_COLUMN, TIMESTAMP_FORMAT};
pub use parse::{parse_log, read_log, LogRecord};
pub use plot::{NullPlot, PlotSink, SvgPlot};
pub use sink::ResultSink;
