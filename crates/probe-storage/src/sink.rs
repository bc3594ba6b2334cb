//! Result sink combining the measurement log and a live plot.

use crate::error::StorageError;
use crate::log_file::MeasurementLog;
use crate::plot::{NullPlot, PlotSink};
use probe_core::{Measurement, MeasurementSink, SweepError, SweepResult, SweepSpec};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Writes every accepted measurement to the log, then to the plot.
///
/// Log failures are returned and abort the sweep. Plot failures are logged
/// at warn and skipped.
pub struct ResultSink {
    log: MeasurementLog,
    plot: Box<dyn PlotSink>,
    plot_path: Option<PathBuf>,
    plot_failures: usize,
}

impl ResultSink {
    /// Sink appending to the log at `log_path`, without a plot.
    pub fn open(log_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            log: MeasurementLog::open_append(log_path)?,
            plot: Box::new(NullPlot),
            plot_path: None,
            plot_failures: 0,
        })
    }

    /// Attach a plot; when `save_to` is set the curve is saved there at the
    /// end of the sweep.
    pub fn with_plot(mut self, plot: Box<dyn PlotSink>, save_to: Option<PathBuf>) -> Self {
        self.plot = plot;
        self.plot_path = save_to;
        self
    }

    /// Path of the measurement log.
    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Rows appended to the log.
    pub fn rows_written(&self) -> usize {
        self.log.rows()
    }

    /// Plot updates that failed.
    pub fn plot_failures(&self) -> usize {
        self.plot_failures
    }

    fn plot_failed(&mut self, action: &str, err: StorageError) {
        self.plot_failures += 1;
        warn!(action, error = %err, "Plot failed, continuing");
    }
}

impl MeasurementSink for ResultSink {
    fn begin(&mut self, spec: &SweepSpec) -> Result<(), SweepError> {
        self.log.write_preamble(spec).map_err(SweepError::from)
    }

    fn record(&mut self, measurement: &Measurement) -> Result<(), SweepError> {
        self.log.append(measurement)?;
        if let Err(err) = self.plot.update(measurement) {
            self.plot_failed("update", err);
        }
        Ok(())
    }

    fn finish(&mut self, _result: &SweepResult) {
        if let Err(err) = self.log.close() {
            error!(path = %self.log.path().display(), error = %err, "Failed to close measurement log");
        }
        if let Some(path) = self.plot_path.clone() {
            if let Err(err) = self.plot.savefig(&path) {
                self.plot_failed("savefig", err);
            }
        }
        if let Err(err) = self.plot.close() {
            self.plot_failed("close", err);
        }
    }
}
