//! Progress events broadcast by the orchestrator.

use crate::orchestrator::SweepState;
use probe_core::{Measurement, SweepStatus};

/// One progress notification. Subscribers that lag simply miss events; the
/// sweep never waits for them.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// The orchestrator changed state.
    StateChanged {
        /// Previous state.
        from: SweepState,
        /// New state.
        to: SweepState,
    },
    /// A source reached a target voltage.
    TargetReached {
        /// Source that moved.
        instrument: String,
        /// Voltage reached.
        voltage: f64,
    },
    /// A measurement was accepted.
    Measured(Measurement),
    /// The current range was raised to 1e`range` A.
    RangeEscalated {
        /// New range exponent.
        range: i32,
    },
    /// The sweep reached a terminal state.
    Finished {
        /// Terminal status.
        status: SweepStatus,
        /// Measurements handed to the sink.
        accepted: usize,
    },
}
