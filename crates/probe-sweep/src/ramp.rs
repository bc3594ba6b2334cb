//! Stepwise voltage ramps.
//!
//! [`RampStepper::ramp_to`] turns a `(from, to)` pair into a bounded
//! sequence of increments:
//!
//! - full-step mode issues one command straight to the target
//! - otherwise increments of the profile's step size (at least
//!   [`MIN_RAMP_STEP`](probe_core::limits::MIN_RAMP_STEP)) are applied, each
//!   followed by the settle time
//! - every time the cumulative travel crosses a multiple of the check
//!   interval, the injected [`StepCheck`] runs, once per multiple crossed
//! - a full-step command runs the check once at the target when it covers
//!   at least one interval
//! - the last increment absorbs the fractional residual, so the ramp ends
//!   exactly on `to`
//!
//! Increments are computed from the start voltage and the step index, never
//! accumulated, so no drift builds up over long ramps.

use async_trait::async_trait;
use probe_core::limits::TRAVEL_EPSILON;
use probe_core::{AbortSignal, RampProfile, SweepError, VoltageSource};
use tokio::time::sleep;
use tracing::{debug, trace};

/// Hook run at compliance-check points of a ramp.
#[async_trait]
pub trait StepCheck: Send {
    /// Called after the increment to `voltage`. An error stops the ramp.
    async fn on_step(&mut self, source: &dyn VoltageSource, voltage: f64) -> Result<(), SweepError>;
}

/// Check that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheck;

#[async_trait]
impl StepCheck for NoCheck {
    async fn on_step(&mut self, _source: &dyn VoltageSource, _voltage: f64) -> Result<(), SweepError> {
        Ok(())
    }
}

/// What one ramp did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RampReport {
    /// `set_voltage` commands issued.
    pub steps: usize,
    /// Check hook invocations.
    pub checks: usize,
    /// Absolute volts travelled.
    pub distance: f64,
}

/// Per-call ramp bookkeeping. Lives only for one `ramp_to` call.
struct RampState {
    from: f64,
    to: f64,
    direction: f64,
    increment: f64,
    total_steps: usize,
    travelled: f64,
    checks: usize,
}

impl RampState {
    fn new(from: f64, to: f64, profile: &RampProfile) -> Self {
        let distance = (to - from).abs();
        let increment = if profile.full_step {
            distance
        } else {
            profile.effective_step()
        };
        let total_steps = if distance <= TRAVEL_EPSILON {
            0
        } else {
            ((distance / increment) - TRAVEL_EPSILON).ceil().max(1.0) as usize
        };
        Self {
            from,
            to,
            direction: (to - from).signum(),
            increment,
            total_steps,
            travelled: 0.0,
            checks: 0,
        }
    }

    /// Voltage after increment `k` (1-based). The last one is exactly `to`.
    fn voltage_at(&self, k: usize) -> f64 {
        if k >= self.total_steps {
            self.to
        } else {
            self.from + self.direction * self.increment * k as f64
        }
    }

    /// Checks owed for the travel so far, minus those already run.
    fn checks_due(&self, interval: f64) -> usize {
        let owed = ((self.travelled + TRAVEL_EPSILON) / interval).floor() as usize;
        owed.saturating_sub(self.checks)
    }
}

/// Ramps one source according to a [`RampProfile`].
#[derive(Debug, Clone)]
pub struct RampStepper {
    profile: RampProfile,
    abort: Option<AbortSignal>,
}

impl RampStepper {
    /// Stepper for `profile`, without an abort signal.
    pub fn new(profile: RampProfile) -> Self {
        Self {
            profile,
            abort: None,
        }
    }

    /// Stop between increments when `signal` is triggered.
    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Pacing in use.
    pub fn profile(&self) -> &RampProfile {
        &self.profile
    }

    /// Ramp `source` from `*position` to `to`.
    ///
    /// `position` is updated after every accepted command, so on error it
    /// holds the last voltage the instrument took.
    ///
    /// # Errors
    /// - `Interrupted` when the abort signal is seen between increments
    /// - `Transport` when a command fails
    /// - whatever the check hook returns, typically `ComplianceExceeded`
    pub async fn ramp_to(
        &self,
        source: &dyn VoltageSource,
        position: &mut f64,
        to: f64,
        check: &mut dyn StepCheck,
    ) -> Result<RampReport, SweepError> {
        let mut ramp = RampState::new(*position, to, &self.profile);
        if ramp.total_steps == 0 {
            return Ok(RampReport::default());
        }
        debug!(
            instrument = source.name(),
            from = ramp.from,
            to,
            steps = ramp.total_steps,
            full_step = self.profile.full_step,
            "Ramping"
        );

        for k in 1..=ramp.total_steps {
            if self.abort.as_ref().is_some_and(AbortSignal::is_triggered) {
                return Err(SweepError::Interrupted);
            }
            let next = ramp.voltage_at(k);
            source
                .set_voltage(next)
                .await
                .map_err(|e| SweepError::transport(source.name(), e))?;
            ramp.travelled += (next - *position).abs();
            *position = next;
            trace!(instrument = source.name(), voltage = next, "Ramp step");
            sleep(self.profile.settle).await;

            let mut due = ramp.checks_due(self.profile.check_interval);
            if self.profile.full_step {
                // All crossings share one voltage.
                due = due.min(1);
            }
            for _ in 0..due {
                check.on_step(source, next).await?;
                ramp.checks += 1;
            }
        }

        Ok(RampReport {
            steps: ramp.total_steps,
            checks: ramp.checks,
            distance: ramp.travelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::{Switch, VoltageSource};
    use probe_driver_mock::MockSourceMeter;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingCheck {
        voltages: Vec<f64>,
    }

    #[async_trait]
    impl StepCheck for CountingCheck {
        async fn on_step(&mut self, _source: &dyn VoltageSource, voltage: f64) -> Result<(), SweepError> {
            self.voltages.push(voltage);
            Ok(())
        }
    }

    fn profile(step: f64, interval: f64) -> RampProfile {
        RampProfile {
            full_step: false,
            step_size: step,
            check_interval: interval,
            settle: Duration::from_millis(20),
        }
    }

    async fn powered(name: &str) -> MockSourceMeter {
        let smu = MockSourceMeter::new(name);
        smu.control_source(Switch::On).await.unwrap();
        smu
    }

    #[tokio::test(start_paused = true)]
    async fn lands_exactly_on_target_with_residual() {
        let smu = powered("ps").await;
        let stepper = RampStepper::new(profile(0.3, 2.5));
        let mut position = 0.0;
        let mut check = CountingCheck::default();

        let report = stepper.ramp_to(&smu, &mut position, -1.0, &mut check).await.unwrap();

        assert_eq!(position, -1.0);
        assert_eq!(smu.voltage().await, -1.0);
        assert_eq!(report.steps, 4);
        let history = smu.history().await;
        assert_eq!(history.len(), 4);
        assert!((history[2] - -0.9).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn check_count_covers_travel() {
        // (from, to, step, interval)
        let cases = [
            (0.0, -10.0, 0.1, 2.5),
            (0.0, -4.0, 0.7, 1.0),
            (5.0, -5.0, 0.3, 0.5),
            (-3.0, -3.05, 0.1, 2.5),
            (0.0, 12.34, 1.0, 2.5),
            (0.0, -10.0, 5.0, 2.5),
        ];
        for (from, to, step, interval) in cases {
            let smu = powered("ps").await;
            let stepper = RampStepper::new(profile(step, interval));
            let mut position = from;
            let mut check = CountingCheck::default();

            let report = stepper.ramp_to(&smu, &mut position, to, &mut check).await.unwrap();

            let distance: f64 = (to - from).abs();
            let floor = (distance / interval + 1e-9).floor() as usize;
            assert!(
                report.checks >= floor,
                "{from} -> {to} step {step} interval {interval}: {} checks < {floor}",
                report.checks
            );
            assert_eq!(position, to);
            assert_eq!(smu.voltage().await, to);
            assert_eq!(check.voltages.len(), report.checks);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_step_is_checked_once_at_target() {
        let smu = powered("ps").await;
        let mut full = profile(0.1, 2.5);
        full.full_step = true;
        let mut position = 0.0;
        let mut check = CountingCheck::default();

        let report = RampStepper::new(full)
            .ramp_to(&smu, &mut position, -10.0, &mut check)
            .await
            .unwrap();

        assert_eq!(report.steps, 1);
        assert_eq!(report.checks, 1);
        assert_eq!(check.voltages, vec![-10.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_step_below_interval_is_not_checked() {
        let smu = powered("ps").await;
        let mut full = profile(0.1, 2.5);
        full.full_step = true;
        let mut position = 0.0;
        let mut check = CountingCheck::default();

        RampStepper::new(full)
            .ramp_to(&smu, &mut position, -1.0, &mut check)
            .await
            .unwrap();

        assert!(check.voltages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn small_steps_are_raised_to_minimum() {
        let smu = powered("ps").await;
        let stepper = RampStepper::new(profile(0.01, 2.5));
        let mut position = 0.0;

        let report = stepper.ramp_to(&smu, &mut position, -1.0, &mut NoCheck).await.unwrap();

        assert_eq!(report.steps, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn full_step_issues_one_command() {
        let smu = powered("ps").await;
        let mut full = profile(0.1, 2.5);
        full.full_step = true;
        let stepper = RampStepper::new(full);
        let mut position = -2.0;

        let report = stepper.ramp_to(&smu, &mut position, -4.0, &mut NoCheck).await.unwrap();

        assert_eq!(report.steps, 1);
        assert_eq!(smu.history().await, vec![-4.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_distance_is_a_no_op() {
        let smu = powered("ps").await;
        let stepper = RampStepper::new(profile(0.1, 2.5));
        let mut position = -3.0;

        let report = stepper.ramp_to(&smu, &mut position, -3.0, &mut NoCheck).await.unwrap();

        assert_eq!(report, RampReport::default());
        assert!(smu.history().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_between_steps() {
        let smu = powered("ps").await;
        let signal = AbortSignal::new();
        signal.trigger();
        let stepper = RampStepper::new(profile(0.1, 2.5)).with_abort(signal);
        let mut position = 0.0;

        let err = stepper.ramp_to(&smu, &mut position, -5.0, &mut NoCheck).await.unwrap_err();

        assert_eq!(err, SweepError::Interrupted);
        assert_eq!(position, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn check_failure_keeps_last_position() {
        let smu = powered("ps").await.with_compliance_threshold(1.0);
        let stepper = RampStepper::new(profile(0.5, 0.5));
        let mut position = 0.0;
        let mut monitor = crate::ComplianceMonitor::new(2, Duration::from_millis(1));

        let err = stepper.ramp_to(&smu, &mut position, -3.0, &mut monitor).await.unwrap_err();

        assert!(matches!(err, SweepError::ComplianceExceeded { .. }));
        assert_eq!(position, -1.0);
    }
}
