//! Terminal outcome of a sweep.

use crate::capabilities::Switch;
use crate::error::SweepError;
use serde::{Deserialize, Serialize};

/// Terminal status of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepStatus {
    /// Every target was measured.
    Completed,
    /// A source stayed in compliance for the maximum number of checks.
    AbortedCompliance,
    /// Read-back voltage diverged from the commanded voltage.
    AbortedMismatch,
    /// Overcurrent with the current range already at its ceiling.
    AbortedCurrentCeiling,
    /// Operator cancel.
    AbortedExternal,
    /// Instrument transport, storage or configuration failure.
    AbortedFault,
}

impl SweepStatus {
    /// Whether every target was measured.
    pub fn is_completed(self) -> bool {
        self == SweepStatus::Completed
    }
}

impl std::fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SweepStatus::Completed => "completed",
            SweepStatus::AbortedCompliance => "aborted: compliance",
            SweepStatus::AbortedMismatch => "aborted: voltage mismatch",
            SweepStatus::AbortedCurrentCeiling => "aborted: current range ceiling",
            SweepStatus::AbortedExternal => "aborted: operator cancel",
            SweepStatus::AbortedFault => "aborted: fault",
        };
        write!(f, "{}", label)
    }
}

/// Where one source was left when the sweep returned.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceShutdown {
    /// Name of the source.
    pub instrument: String,
    /// Last voltage successfully commanded.
    pub final_voltage: f64,
    /// Output state after teardown.
    pub output: Switch,
    /// False when any teardown command failed and was swallowed.
    pub clean: bool,
}

/// Created once at sweep end, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    /// How the sweep ended.
    pub status: SweepStatus,
    /// Measurements handed to the sink.
    pub accepted: usize,
    /// The fault behind an aborted status.
    pub error: Option<SweepError>,
    /// Teardown record per source, in teardown order.
    pub shutdown: Vec<SourceShutdown>,
}

impl SweepResult {
    /// Result of a sweep that measured every target.
    pub fn completed(accepted: usize, shutdown: Vec<SourceShutdown>) -> Self {
        Self {
            status: SweepStatus::Completed,
            accepted,
            error: None,
            shutdown,
        }
    }

    /// Result of an aborted sweep; the status follows from `error`.
    pub fn aborted(error: SweepError, accepted: usize, shutdown: Vec<SourceShutdown>) -> Self {
        Self {
            status: error.status(),
            accepted,
            error: Some(error),
            shutdown,
        }
    }

    /// Surface the abort reason to the caller.
    pub fn into_result(self) -> Result<SweepResult, SweepError> {
        match self.error.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_result_carries_status_of_error() {
        let result = SweepResult::aborted(
            SweepError::ComplianceExceeded {
                instrument: "ps".into(),
                voltage: -4.0,
                checks: 5,
            },
            2,
            Vec::new(),
        );
        assert_eq!(result.status, SweepStatus::AbortedCompliance);
        assert!(result.into_result().is_err());
        assert!(SweepResult::completed(3, Vec::new()).into_result().is_ok());
    }
}
