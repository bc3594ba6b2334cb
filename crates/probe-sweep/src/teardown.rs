//! Guaranteed return of energized sources to 0 V.
//!
//! [`SafetyRampDown`] walks a source back to exactly 0 V and disables its
//! output. It never fails: every command error or timeout is logged and
//! swallowed, because at this point the goal is best-effort hardware safety.
//!
//! [`EnergizedSource`] is the scoped guard around a source whose output has
//! been switched on. The orchestrator releases guards explicitly (ramp down,
//! kill or hold); a guard dropped while still armed (panic, cancelled
//! future) spawns an emergency ramp-down on the current runtime.
//!
//! # Ramp-down walk
//!
//! ```text
//!  -12.0 ──0.5 V──▶ ... ──▶ -1.0 ──0.1 V──▶ ... ──▶ 0.0 ──▶ output off
//!        coarse steps        fine window
//! ```

use probe_core::limits::{
    HIT_COMPLIANCE_ATTEMPTS, MIN_RAMP_STEP, RAMP_DOWN_FINE_WINDOW, RAMP_DOWN_PRE_WAIT,
    RAMP_DOWN_STEP, RAMP_SETTLE, TRAVEL_EPSILON,
};
use probe_core::{SourceShutdown, SweepError, Switch, VoltageSource};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Pacing of a ramp-down.
#[derive(Debug, Clone, PartialEq)]
pub struct RampDownSettings {
    /// Coarse descending step magnitude.
    pub step: f64,
    /// Within this distance of 0 V the walk uses `fine_step`.
    pub fine_window: f64,
    /// Step magnitude inside the fine window.
    pub fine_step: f64,
    /// Wait after each step.
    pub settle: Duration,
    /// Wait before the first step.
    pub pre_wait: Duration,
    /// Poll `hit_compliance` after each step. Hits are logged, never acted on.
    pub check_compliance: bool,
    /// Upper bound on each instrument command.
    pub command_timeout: Duration,
}

impl Default for RampDownSettings {
    fn default() -> Self {
        Self {
            step: RAMP_DOWN_STEP,
            fine_window: RAMP_DOWN_FINE_WINDOW,
            fine_step: MIN_RAMP_STEP,
            settle: RAMP_SETTLE,
            pre_wait: RAMP_DOWN_PRE_WAIT,
            check_compliance: false,
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Best-effort controlled shutdown of one source.
#[derive(Debug, Clone, Default)]
pub struct SafetyRampDown {
    settings: RampDownSettings,
}

impl SafetyRampDown {
    /// Ramp-down with `settings`.
    pub fn new(settings: RampDownSettings) -> Self {
        Self { settings }
    }

    /// Pacing in use.
    pub fn settings(&self) -> &RampDownSettings {
        &self.settings
    }

    /// Next voltage on the walk from `v` toward 0 V.
    fn next_toward_zero(&self, v: f64) -> f64 {
        let magnitude = v.abs();
        let step = self.settings.step.abs().max(MIN_RAMP_STEP);
        let fine = self.settings.fine_step.abs().max(MIN_RAMP_STEP);
        let window = self.settings.fine_window.abs();
        let next = if magnitude > window + TRAVEL_EPSILON {
            (magnitude - step).max(window)
        } else {
            magnitude - fine
        };
        if next <= TRAVEL_EPSILON {
            0.0
        } else {
            next.copysign(v)
        }
    }

    /// The voltages a ramp-down from `from` commands, ending with 0 V.
    pub fn plan(&self, from: f64) -> Vec<f64> {
        if !from.is_finite() {
            return vec![0.0];
        }
        let mut plan = Vec::new();
        let mut v = from;
        while v != 0.0 {
            v = self.next_toward_zero(v);
            plan.push(v);
        }
        plan
    }

    async fn guarded<T, F>(&self, source: &dyn VoltageSource, action: &'static str, fut: F) -> bool
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match timeout(self.settings.command_timeout, fut).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                error!(instrument = source.name(), action, error = %SweepError::transport(source.name(), e), "Teardown command failed");
                false
            }
            Err(_) => {
                error!(instrument = source.name(), action, "Teardown command timed out");
                false
            }
        }
    }

    /// Walk `source` from `from` to 0 V, then switch its output off.
    ///
    /// `from` is the last voltage the instrument accepted. The walk stops at
    /// the first failed command; the output is switched off regardless.
    pub async fn teardown(&self, source: &dyn VoltageSource, from: f64) -> SourceShutdown {
        let mut position = from;
        let mut clean = true;

        if from != 0.0 {
            info!(instrument = source.name(), from, "Ramping down");
            sleep(self.settings.pre_wait).await;
            for next in self.plan(from) {
                if !self.guarded(source, "set_voltage", source.set_voltage(next)).await {
                    clean = false;
                    break;
                }
                position = next;
                sleep(self.settings.settle).await;
                if self.settings.check_compliance {
                    self.log_compliance(source, next).await;
                }
            }
        }

        let output = self.switch_off(source, &mut clean).await;
        if clean {
            info!(instrument = source.name(), "Source at 0 V, output off");
        } else {
            error!(instrument = source.name(), voltage = position, %output, "Ramp-down incomplete");
        }
        SourceShutdown {
            instrument: source.name().to_string(),
            final_voltage: position,
            output,
            clean,
        }
    }

    /// Switch the output off without ramping. Used when the operator opted
    /// into killing the source on compliance.
    pub async fn kill(&self, source: &dyn VoltageSource, at: f64) -> SourceShutdown {
        warn!(instrument = source.name(), voltage = at, "Disabling output without ramp-down");
        let mut clean = true;
        let output = self.switch_off(source, &mut clean).await;
        SourceShutdown {
            instrument: source.name().to_string(),
            final_voltage: at,
            output,
            clean,
        }
    }

    async fn switch_off(&self, source: &dyn VoltageSource, clean: &mut bool) -> Switch {
        if self
            .guarded(source, "control_source", source.control_source(Switch::Off))
            .await
        {
            Switch::Off
        } else {
            *clean = false;
            Switch::On
        }
    }

    async fn log_compliance(&self, source: &dyn VoltageSource, voltage: f64) {
        match timeout(
            self.settings.command_timeout,
            source.hit_compliance(HIT_COMPLIANCE_ATTEMPTS),
        )
        .await
        {
            Ok(Ok(true)) => warn!(instrument = source.name(), voltage, "Compliance during ramp-down"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(instrument = source.name(), error = %e, "Compliance query failed during ramp-down"),
            Err(_) => warn!(instrument = source.name(), "Compliance query timed out during ramp-down"),
        }
    }
}

/// Scoped guard for a source whose output is on.
///
/// Tracks the last commanded voltage so a ramp-down can start from an exact
/// value even if read-back is unreliable.
pub struct EnergizedSource {
    source: Arc<dyn VoltageSource>,
    position: f64,
    ramp_down: SafetyRampDown,
    armed: bool,
}

impl EnergizedSource {
    /// Arm a guard and switch the output on. On failure the guard is
    /// returned with the error so the caller can still tear it down.
    pub async fn energize(
        source: Arc<dyn VoltageSource>,
        position: f64,
        ramp_down: SafetyRampDown,
    ) -> Result<Self, (Self, SweepError)> {
        let guard = Self {
            source,
            position,
            ramp_down,
            armed: true,
        };
        match guard.source.control_source(Switch::On).await {
            Ok(()) => {
                info!(instrument = guard.source.name(), voltage = position, "Output enabled");
                Ok(guard)
            }
            Err(e) => {
                let err = SweepError::transport(guard.source.name(), e);
                Err((guard, err))
            }
        }
    }

    /// The guarded instrument.
    pub fn source(&self) -> Arc<dyn VoltageSource> {
        Arc::clone(&self.source)
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Last voltage the instrument accepted.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Mutable last accepted voltage, updated by ramps.
    pub fn position_mut(&mut self) -> &mut f64 {
        &mut self.position
    }

    /// Ramp to 0 V and switch off.
    pub async fn release(mut self) -> SourceShutdown {
        self.armed = false;
        self.ramp_down.teardown(self.source.as_ref(), self.position).await
    }

    /// Switch off immediately.
    pub async fn kill(mut self) -> SourceShutdown {
        self.armed = false;
        self.ramp_down.kill(self.source.as_ref(), self.position).await
    }

    /// Leave the source energized at its present voltage.
    pub fn hold(mut self) -> SourceShutdown {
        self.armed = false;
        warn!(instrument = self.source.name(), voltage = self.position, "Source left energized");
        SourceShutdown {
            instrument: self.source.name().to_string(),
            final_voltage: self.position,
            output: Switch::On,
            clean: true,
        }
    }
}

impl Drop for EnergizedSource {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot await in Drop: hand the ramp-down to the runtime.
        if let Ok(handle) = Handle::try_current() {
            let source = Arc::clone(&self.source);
            let ramp_down = self.ramp_down.clone();
            let from = self.position;
            error!(instrument = source.name(), voltage = from, "Energized source dropped, spawning emergency ramp-down");
            handle.spawn(async move {
                ramp_down.teardown(source.as_ref(), from).await;
            });
        } else {
            error!(
                instrument = self.source.name(),
                voltage = self.position,
                "Energized source dropped with no runtime, cannot ramp down!"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_driver_mock::{ErrorConfig, ErrorScenario, MockSourceMeter};
    use tracing_test::traced_test;

    fn quick() -> SafetyRampDown {
        SafetyRampDown::new(RampDownSettings {
            pre_wait: Duration::from_secs(5),
            ..Default::default()
        })
    }

    #[test]
    fn plan_uses_coarse_then_fine_steps() {
        let plan = quick().plan(-2.3);
        assert!((plan[0] - -1.8).abs() < 1e-12);
        assert!((plan[1] - -1.3).abs() < 1e-12);
        assert_eq!(plan[2], -1.0);
        assert!((plan[3] - -0.9).abs() < 1e-12);
        assert_eq!(plan.len(), 3 + 10);
        assert_eq!(*plan.last().unwrap(), 0.0);
    }

    #[test]
    fn plan_follows_polarity() {
        let plan = quick().plan(3.0);
        assert!(plan.iter().all(|v| *v >= 0.0));
        assert_eq!(*plan.last().unwrap(), 0.0);
        assert!(quick().plan(0.0).is_empty());
        assert_eq!(quick().plan(0.05), vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_returns_to_zero_and_switches_off() {
        let smu = MockSourceMeter::new("ps");
        smu.control_source(Switch::On).await.unwrap();
        smu.set_voltage(-4.0).await.unwrap();

        let report = quick().teardown(&smu, -4.0).await;

        assert!(report.clean);
        assert_eq!(report.final_voltage, 0.0);
        assert_eq!(report.output, Switch::Off);
        assert_eq!(smu.voltage().await, 0.0);
        assert_eq!(smu.output().await, Switch::Off);
        let history = smu.history().await;
        assert!(history.windows(2).all(|w| w[1].abs() <= w[0].abs()));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failures_are_swallowed_and_logged() {
        let smu = MockSourceMeter::new("ps").with_errors(ErrorConfig::scenario(
            ErrorScenario::FailAfterN {
                operation: "set_voltage",
                count: 1,
            },
        ));
        smu.control_source(Switch::On).await.unwrap();
        smu.set_voltage(-10.0).await.unwrap();

        let report = quick().teardown(&smu, -10.0).await;

        assert!(!report.clean);
        assert_eq!(report.final_voltage, -10.0);
        // Output is still switched off after the walk failed.
        assert_eq!(report.output, Switch::Off);
        assert!(logs_contain("Teardown command failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_instrument_reports_output_unknown() {
        let smu = MockSourceMeter::new("ps").with_errors(ErrorConfig::scenario(
            ErrorScenario::CommunicationLoss {
                operation: "set_voltage",
            },
        ));
        let report = quick().teardown(&smu, -1.0).await;
        assert!(!report.clean);
        assert_eq!(report.output, Switch::On);
    }

    #[tokio::test(start_paused = true)]
    async fn compliance_during_ramp_down_does_not_stop_walk() {
        let smu = MockSourceMeter::new("ps").with_compliance_threshold(0.5);
        smu.control_source(Switch::On).await.unwrap();
        let ramp_down = SafetyRampDown::new(RampDownSettings {
            check_compliance: true,
            ..Default::default()
        });

        let report = ramp_down.teardown(&smu, -2.0).await;

        assert!(report.clean);
        assert_eq!(report.final_voltage, 0.0);
        assert!(smu.compliance_queries().await > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_guard_ramps_down_in_background() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let guard = EnergizedSource::energize(smu.clone(), 0.0, quick())
            .await
            .map_err(|(_, e)| e)
            .unwrap();
        smu.set_voltage(-3.0).await.unwrap();
        let mut guard = guard;
        *guard.position_mut() = -3.0;

        drop(guard);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(smu.voltage().await, 0.0);
        assert_eq!(smu.output().await, Switch::Off);
    }

    #[tokio::test]
    async fn hold_leaves_output_on() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let guard = EnergizedSource::energize(smu.clone(), 0.0, quick())
            .await
            .map_err(|(_, e)| e)
            .unwrap();
        let report = guard.hold();
        assert_eq!(report.output, Switch::On);
        assert_eq!(smu.output().await, Switch::On);
    }
}
