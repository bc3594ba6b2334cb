//! Core types for probe-station IV/CV sweeps.
//!
//! This crate holds what every other crate in the workspace shares:
//!
//! - [`error`]: `DriverError` for instrument failures and `SweepError`, the
//!   typed outcome channel of a sweep
//! - [`capabilities`]: the `VoltageSource` and `LcrMeter` traits the engine
//!   commands instruments through
//! - [`sweep`]: `SweepSpec` and its target-list helpers
//! - [`measurement`] / [`result`]: values produced by a sweep
//! - [`sink`]: the `MeasurementSink` seam to storage
//! - [`abort`]: cooperative operator cancel
//! - [`limits`]: safety tolerances and pacing defaults

pub mod abort;
pub mod capabilities;
pub mod error;
pub mod limits;
pub mod measurement;
pub mod result;
pub mod sink;
pub mod sweep;

pub use abort::AbortSignal;
pub use capabilities::{LcrMeter, Switch, VoltageSource};
pub use error::{DriverError, DriverErrorKind, SweepError};
pub use measurement::{CvReading, Measurement};
pub use result::{SourceShutdown, SweepResult, SweepStatus};
pub use sink::{MeasurementSink, MemorySink};
pub use sweep::{BiasSpec, RampProfile, SweepKind, SweepSpec};
