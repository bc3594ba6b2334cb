//! Seam between the sweep engine and result storage.

use crate::error::SweepError;
use crate::measurement::Measurement;
use crate::result::SweepResult;
use crate::sweep::SweepSpec;

/// Receives every accepted measurement of a sweep.
///
/// # Contract
/// - `begin()` is called once before the first measurement.
/// - `record()` failures are fatal: the sweep aborts and ramps down.
/// - `finish()` is called once on every exit path and must not fail the
///   sweep; implementations log their own problems.
pub trait MeasurementSink: Send {
    /// Prepare for `spec`, before any source is energized.
    fn begin(&mut self, spec: &SweepSpec) -> Result<(), SweepError>;

    /// Store one accepted measurement.
    fn record(&mut self, measurement: &Measurement) -> Result<(), SweepError>;

    /// The sweep has ended with `result`.
    fn finish(&mut self, _result: &SweepResult) {}
}

/// Sink that keeps measurements in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    /// Accepted measurements in order.
    pub measurements: Vec<Measurement>,
}

impl MeasurementSink for MemorySink {
    fn begin(&mut self, _spec: &SweepSpec) -> Result<(), SweepError> {
        Ok(())
    }

    fn record(&mut self, measurement: &Measurement) -> Result<(), SweepError> {
        self.measurements.push(measurement.clone());
        Ok(())
    }
}
