//! Error injection framework for simulated instruments.
//!
//! Scenarios are keyed by operation name (`"set_voltage"`, `"read"`,
//! `"in_compliance"`, `"control_source"`, ...) and produce
//! [`DriverError`]s, the same type real drivers report.

use super::rng::MockRng;
use probe_core::error::{DriverError, DriverErrorKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Error injection configuration for simulated instruments
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Failure probability applied to every operation (Chaos mode)
    failure_rate: f64,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Fail every call of `operation` after `count` successful ones
    FailAfterN {
        /// Operation name, e.g. `set_voltage`.
        operation: &'static str,
        /// Calls that succeed first.
        count: u32,
    },
    /// `operation` never answers
    Timeout {
        /// Operation name.
        operation: &'static str,
    },
    /// The first call of `operation` fails and the link stays down for
    /// every operation afterwards
    CommunicationLoss {
        /// Operation that drops the link.
        operation: &'static str,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self::scenarios(Vec::new())
    }

    /// Uniform random failures on every operation
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self {
            failure_rate: rate,
            scenarios: Arc::new(Vec::new()),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// A single scripted failure.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scripted failures, checked in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            failure_rate: 0.0,
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(Some(0))),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check whether `operation` should fail and build the error if so.
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.communication_lost {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected '{}' failure after {} calls", operation, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss { operation: op } if *op == operation => {
                    state.communication_lost = true;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                _ => {}
            }
        }

        if self.rng.should_fail(self.failure_rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Reset error state (clear counters, restore the link)
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_errors_by_default() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("smu", "read").is_ok());
        }
    }

    #[test]
    fn fail_after_n_counts_only_its_operation() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "set_voltage",
            count: 2,
        });
        assert!(config.check_operation("smu", "set_voltage").is_ok());
        assert!(config.check_operation("smu", "read").is_ok());
        assert!(config.check_operation("smu", "set_voltage").is_ok());
        let err = config.check_operation("smu", "set_voltage").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);

        config.reset();
        assert!(config.check_operation("smu", "set_voltage").is_ok());
    }

    #[test]
    fn communication_loss_is_sticky() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss {
            operation: "read",
        });
        assert!(config.check_operation("smu", "set_voltage").is_ok());
        assert!(config.check_operation("smu", "read").is_err());
        let err = config.check_operation("smu", "control_source").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
    }

    #[test]
    fn random_failures_follow_rate() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("smu", "read").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }
}
