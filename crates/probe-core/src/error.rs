//! Error taxonomy for probe-station sweeps.
//!
//! Two layers of error live here:
//!
//! 1. [`DriverError`] describes a failure inside one instrument driver
//!    (a refused command, a lost link, an injected fault in simulation).
//!    Capability traits return `anyhow::Result`, and drivers put a
//!    `DriverError` inside so the sweep layer can recover the kind.
//! 2. [`SweepError`] is the typed outcome channel of a sweep. Every fatal
//!    condition is converted into exactly one variant at the orchestrator
//!    boundary and mapped onto a terminal [`SweepStatus`].
//!
//! # Severity
//!
//! All `SweepError` variants are fatal to the running sweep. None of them are
//! retried by the engine; the caller decides whether to rerun the whole sweep.

use crate::result::SweepStatus;
use thiserror::Error;

/// Category of an instrument driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The driver could not reach the instrument (bus, cable, session).
    Communication,
    /// The instrument answered, but refused or could not execute the command.
    Hardware,
    /// The instrument did not answer in time.
    Timeout,
    /// A parameter was outside the range the instrument accepts.
    InvalidParameter,
    /// The instrument answered with text that could not be parsed.
    Protocol,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// A failure reported by an instrument driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Instrument '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Instrument that failed.
    pub driver_type: String,
    /// Failure class, used to pick the sweep status.
    pub kind: DriverErrorKind,
    /// Driver message.
    pub message: String,
}

impl DriverError {
    /// Error of `kind` from the instrument named `driver_type`.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Recover a `DriverError` from an `anyhow` chain returned by a capability
    /// call, or wrap the chain's message as an unknown-kind error of `instrument`.
    pub fn from_anyhow(instrument: &str, err: anyhow::Error) -> Self {
        match err.downcast::<DriverError>() {
            Ok(driver) => driver,
            Err(other) => DriverError::new(instrument, DriverErrorKind::Unknown, format!("{:#}", other)),
        }
    }
}

/// Convenience alias for results carrying a [`SweepError`].
pub type SweepResultOf<T> = std::result::Result<T, SweepError>;

/// Fatal conditions that end a sweep.
///
/// Each variant maps onto one terminal [`SweepStatus`] through
/// [`SweepError::status`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    /// Commanded and measured voltage diverge beyond the tolerance.
    ///
    /// Raised at start-up when the instrument is not sitting at the declared
    /// initial voltage, and for every measurement whose read-back voltage is
    /// off target. Indicates a hardware or configuration integrity fault.
    #[error(
        "Voltage mismatch on '{instrument}': expected {expected} V, measured {measured} V (tolerance {tolerance} V)"
    )]
    VoltageMismatch {
        /// Source whose read-back diverged.
        instrument: String,
        /// Commanded volts.
        expected: f64,
        /// Read-back volts.
        measured: f64,
        /// Allowed difference in volts.
        tolerance: f64,
    },

    /// The instrument stayed in compliance for the maximum number of
    /// consecutive checks.
    #[error("Compliance exceeded on '{instrument}' at {voltage} V after {checks} consecutive checks")]
    ComplianceExceeded {
        /// Source in compliance.
        instrument: String,
        /// Voltage at which the last check ran.
        voltage: f64,
        /// Consecutive hits seen.
        checks: u32,
    },

    /// A reading exceeded Imax and the current range is already at the ceiling
    /// implied by Imax, so the reading is a genuine overcurrent.
    #[error(
        "Current {current} A exceeds Imax {imax} A with range already at 1e{range} A (ceiling 1e{ceiling} A)"
    )]
    CurrentRangeCeilingReached {
        /// Offending reading in amps.
        current: f64,
        /// Configured limit in amps.
        imax: f64,
        /// Range exponent in use.
        range: i32,
        /// Highest range exponent allowed by `imax`.
        ceiling: i32,
    },

    /// Any instrument I/O failure.
    #[error("Transport failure: {0}")]
    Transport(#[from] DriverError),

    /// The operator cancelled the sweep.
    #[error("Sweep interrupted by operator")]
    Interrupted,

    /// The measurement log could not be written. Data loss during a
    /// physical sweep is never ignored.
    #[error("Result storage failed: {0}")]
    Storage(String),

    /// The sweep description is inconsistent and was rejected before any
    /// hardware was commanded.
    #[error("Invalid sweep configuration: {0}")]
    Configuration(String),
}

impl SweepError {
    /// Build a transport error from a failed capability call.
    pub fn transport(instrument: &str, err: anyhow::Error) -> Self {
        SweepError::Transport(DriverError::from_anyhow(instrument, err))
    }

    /// Terminal status this error resolves to.
    pub fn status(&self) -> SweepStatus {
        match self {
            SweepError::VoltageMismatch { .. } => SweepStatus::AbortedMismatch,
            SweepError::ComplianceExceeded { .. } => SweepStatus::AbortedCompliance,
            SweepError::CurrentRangeCeilingReached { .. } => SweepStatus::AbortedCurrentCeiling,
            SweepError::Interrupted => SweepStatus::AbortedExternal,
            SweepError::Transport(_) | SweepError::Storage(_) | SweepError::Configuration(_) => {
                SweepStatus::AbortedFault
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display() {
        let err = SweepError::Transport(DriverError::new(
            "keithley2410",
            DriverErrorKind::Communication,
            "no response",
        ));
        assert!(err
            .to_string()
            .contains("Instrument 'keithley2410' communication error"));
    }

    #[test]
    fn anyhow_chain_keeps_driver_kind() {
        let inner = DriverError::new("smu", DriverErrorKind::Timeout, "read timed out");
        let wrapped = anyhow::Error::new(inner.clone());
        assert_eq!(DriverError::from_anyhow("smu", wrapped), inner);

        let plain = anyhow::anyhow!("socket closed");
        let converted = DriverError::from_anyhow("lcr", plain);
        assert_eq!(converted.kind, DriverErrorKind::Unknown);
        assert_eq!(converted.driver_type, "lcr");
    }

    #[test]
    fn every_error_maps_to_an_abort_status() {
        let mismatch = SweepError::VoltageMismatch {
            instrument: "ps".into(),
            expected: -10.0,
            measured: -10.5,
            tolerance: 0.01,
        };
        assert_eq!(mismatch.status(), SweepStatus::AbortedMismatch);
        assert_eq!(SweepError::Interrupted.status(), SweepStatus::AbortedExternal);
        assert_eq!(
            SweepError::Storage("disk full".into()).status(),
            SweepStatus::AbortedFault
        );
    }
}
