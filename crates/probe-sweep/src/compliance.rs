//! Compliance interlock.
//!
//! A single compliance flag can be a settling artifact, so only a run of
//! consecutive hits is treated as a fault. The monitor re-queries after a
//! back-off for as long as the instrument keeps reporting compliance, and
//! raises [`SweepError::ComplianceExceeded`] once the run reaches the limit.

use crate::ramp::StepCheck;
use async_trait::async_trait;
use probe_core::limits::{COMPLIANCE_BACKOFF, COMPLIANCE_CHECK_MAX};
use probe_core::{SweepError, VoltageSource};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Counters of one monitor, scoped to one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComplianceState {
    /// Current run of consecutive hits. Reset by any passing query.
    pub consecutive: u32,
    /// `check()` calls made.
    pub checks: u32,
    /// Compliance queries that reported a hit.
    pub hits: u32,
}

/// Consecutive-failure compliance interlock for one source.
#[derive(Debug, Clone)]
pub struct ComplianceMonitor {
    max_consecutive: u32,
    backoff: Duration,
    state: ComplianceState,
}

impl Default for ComplianceMonitor {
    fn default() -> Self {
        Self::new(COMPLIANCE_CHECK_MAX, COMPLIANCE_BACKOFF)
    }
}

impl ComplianceMonitor {
    /// Monitor that aborts after `max_consecutive` hits, waiting `backoff` between re-checks.
    pub fn new(max_consecutive: u32, backoff: Duration) -> Self {
        Self {
            max_consecutive: max_consecutive.max(1),
            backoff,
            state: ComplianceState::default(),
        }
    }

    /// Counters so far.
    pub fn state(&self) -> ComplianceState {
        self.state
    }

    /// Consecutive hits that abort.
    pub fn max_consecutive(&self) -> u32 {
        self.max_consecutive
    }

    /// Query `source` until it passes or the consecutive-hit limit is reached.
    ///
    /// `voltage` is only used for logs and the error.
    pub async fn check(&mut self, source: &dyn VoltageSource, voltage: f64) -> Result<(), SweepError> {
        self.state.checks += 1;
        loop {
            let hit = source
                .in_compliance()
                .await
                .map_err(|e| SweepError::transport(source.name(), e))?;

            if !hit {
                if self.state.consecutive > 0 {
                    info!(
                        instrument = source.name(),
                        voltage,
                        after = self.state.consecutive,
                        "Compliance cleared"
                    );
                }
                self.state.consecutive = 0;
                return Ok(());
            }

            self.state.consecutive += 1;
            self.state.hits += 1;
            warn!(
                instrument = source.name(),
                voltage,
                attempt = self.state.consecutive,
                max = self.max_consecutive,
                "Source in compliance"
            );

            if self.state.consecutive >= self.max_consecutive {
                error!(instrument = source.name(), voltage, "Compliance limit reached");
                return Err(SweepError::ComplianceExceeded {
                    instrument: source.name().to_string(),
                    voltage,
                    checks: self.state.consecutive,
                });
            }

            sleep(self.backoff).await;
        }
    }
}

#[async_trait]
impl StepCheck for ComplianceMonitor {
    async fn on_step(&mut self, source: &dyn VoltageSource, voltage: f64) -> Result<(), SweepError> {
        self.check(source, voltage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use probe_core::Switch;
    use std::sync::Mutex;

    /// Replays a fixed sequence of compliance flags, then reports clear.
    struct ScriptedFlags {
        flags: Mutex<Vec<bool>>,
    }

    impl ScriptedFlags {
        fn new(mut flags: Vec<bool>) -> Self {
            flags.reverse();
            Self {
                flags: Mutex::new(flags),
            }
        }
    }

    #[async_trait]
    impl VoltageSource for ScriptedFlags {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn set_voltage(&self, _volts: f64) -> Result<()> {
            Ok(())
        }
        async fn read_voltage_and_current(&self) -> Result<(f64, f64)> {
            Ok((0.0, 0.0))
        }
        async fn in_compliance(&self) -> Result<bool> {
            Ok(self.flags.lock().unwrap().pop().unwrap_or(false))
        }
        async fn control_source(&self, _state: Switch) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_hits_are_tolerated() {
        let source = ScriptedFlags::new(vec![true, true, true, false]);
        let mut monitor = ComplianceMonitor::default();
        let start = tokio::time::Instant::now();

        monitor.check(&source, -10.0).await.unwrap();

        assert_eq!(monitor.state().consecutive, 0);
        assert_eq!(monitor.state().hits, 3);
        assert_eq!(start.elapsed(), COMPLIANCE_BACKOFF * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_consecutive_hit_aborts() {
        let source = ScriptedFlags::new(vec![true; 5]);
        let mut monitor = ComplianceMonitor::default();

        let err = monitor.check(&source, -4.0).await.unwrap_err();

        assert_eq!(
            err,
            SweepError::ComplianceExceeded {
                instrument: "scripted".into(),
                voltage: -4.0,
                checks: 5,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_between_checks() {
        let source = ScriptedFlags::new(vec![true, true, false, true, true, true, false]);
        let mut monitor = ComplianceMonitor::new(4, Duration::from_millis(10));

        monitor.check(&source, -1.0).await.unwrap();
        monitor.check(&source, -2.0).await.unwrap();

        assert_eq!(monitor.state().checks, 2);
        assert_eq!(monitor.state().hits, 5);
        assert_eq!(monitor.state().consecutive, 0);
    }
}
