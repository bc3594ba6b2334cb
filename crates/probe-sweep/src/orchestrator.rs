//! SweepOrchestrator - state machine driving one IV or CV sweep
//!
//! The orchestrator walks a [`SweepSpec`]'s target list. It ramps the swept
//! source to each target with compliance checks, waits the rest time,
//! measures, validates, escalates the current range when needed and hands
//! accepted measurements to a [`MeasurementSink`].
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  initial V ok  ┌────────────────┐
//! │ Init │───────────────▶│ RampingToStart │
//! └──┬───┘                └───────┬────────┘
//!    │ mismatch                   ▼
//!    │                      ┌───────────┐  next target  ┌─────────────┐
//!    │                      │ Measuring │──────────────▶│ RampingStep │
//!    │                      │           │◀──────────────│             │
//!    │                      └─────┬─────┘               └─────────────┘
//!    │         done / any abort   │
//!    │                            ▼
//!    │                     ┌─────────────┐
//!    │                     │ RampingDown │
//!    │                     └──────┬──────┘
//!    ▼                            ▼
//! Finished(AbortedMismatch)   Finished(status)
//! ```
//!
//! Every path that energized a source goes through ramp-down, except a
//! compliance abort with `kill_on_hit_compliance`, which switches outputs
//! off immediately. Dual-source sweeps energize the bias source first and
//! tear it down last.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(smu));
//! let cancel = orchestrator.abort_handle();
//! let mut events = orchestrator.subscribe();
//!
//! let result = orchestrator.run(&mut sink).await;
//! println!("{}: {} points", result.status, result.accepted);
//! ```

use crate::compliance::ComplianceMonitor;
use crate::events::SweepEvent;
use crate::ramp::RampStepper;
use crate::range::{ceiling_for, CurrentRangeController};
use crate::teardown::{EnergizedSource, RampDownSettings, SafetyRampDown};
use chrono::Local;
use probe_core::limits::{within_tolerance, COMPLIANCE_BACKOFF, COMPLIANCE_CHECK_MAX, VOLTAGE_TOLERANCE};
use probe_core::{
    AbortSignal, CvReading, LcrMeter, Measurement, MeasurementSink, SourceShutdown, SweepError,
    SweepResult, SweepSpec, SweepStatus, Switch, VoltageSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// Checking instruments before anything is energized
    Init,
    /// Ramping a source to its first voltage
    RampingToStart,
    /// Resting and reading at a target
    Measuring,
    /// Ramping the swept source to the next target
    RampingStep,
    /// Returning sources to 0 V
    RampingDown,
    /// Terminal
    Finished(SweepStatus),
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepState::Init => write!(f, "init"),
            SweepState::RampingToStart => write!(f, "ramping_to_start"),
            SweepState::Measuring => write!(f, "measuring"),
            SweepState::RampingStep => write!(f, "ramping_step"),
            SweepState::RampingDown => write!(f, "ramping_down"),
            SweepState::Finished(status) => write!(f, "finished ({})", status),
        }
    }
}

/// Instruments taking part in one sweep. Owned by the caller, who opens
/// them before and closes them after.
#[derive(Clone)]
pub struct SweepInstruments {
    /// The swept source. Its current is the IV read-back.
    pub source: Arc<dyn VoltageSource>,
    /// Held bias source of a dual-source sweep.
    pub bias: Option<Arc<dyn VoltageSource>>,
    /// Impedance meter of a CV sweep.
    pub lcr: Option<Arc<dyn LcrMeter>>,
}

impl SweepInstruments {
    /// Only a swept source.
    pub fn single(source: Arc<dyn VoltageSource>) -> Self {
        Self {
            source,
            bias: None,
            lcr: None,
        }
    }

    /// Add a held bias source.
    pub fn with_bias(mut self, bias: Arc<dyn VoltageSource>) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Add an LCR meter for CV sweeps.
    pub fn with_lcr(mut self, lcr: Arc<dyn LcrMeter>) -> Self {
        self.lcr = Some(lcr);
        self
    }
}

/// Per-run state. Dropped when `run` returns.
struct Session {
    source: Option<EnergizedSource>,
    bias: Option<EnergizedSource>,
    monitor: ComplianceMonitor,
    bias_monitor: ComplianceMonitor,
    range: Option<CurrentRangeController>,
    accepted: usize,
}

/// Drives one sweep from Init to a terminal state.
pub struct SweepOrchestrator {
    spec: SweepSpec,
    instruments: SweepInstruments,
    ramp_down: SafetyRampDown,
    compliance_max: u32,
    compliance_backoff: Duration,
    abort: AbortSignal,
    state: SweepState,
    events: broadcast::Sender<SweepEvent>,
}

impl SweepOrchestrator {
    /// Orchestrator for `spec`, with default ramp-down and compliance limits.
    pub fn new(spec: SweepSpec, instruments: SweepInstruments) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            spec,
            instruments,
            ramp_down: SafetyRampDown::default(),
            compliance_max: COMPLIANCE_CHECK_MAX,
            compliance_backoff: COMPLIANCE_BACKOFF,
            abort: AbortSignal::new(),
            state: SweepState::Init,
            events,
        }
    }

    /// Pacing of the final ramp-down.
    pub fn with_ramp_down(mut self, settings: RampDownSettings) -> Self {
        self.ramp_down = SafetyRampDown::new(settings);
        self
    }

    /// Consecutive-hit limit and back-off of both compliance monitors.
    pub fn with_compliance(mut self, max_consecutive: u32, backoff: Duration) -> Self {
        self.compliance_max = max_consecutive;
        self.compliance_backoff = backoff;
        self
    }

    /// Use an externally created cancel flag.
    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Handle that cancels the sweep at the next step boundary.
    pub fn abort_handle(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Receive progress events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.events.subscribe()
    }

    /// Present state.
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// The sweep being run.
    pub fn spec(&self) -> &SweepSpec {
        &self.spec
    }

    /// Run the sweep to completion.
    ///
    /// Never returns with a source left energized, except a completed sweep
    /// with `ramp_down` disabled. The abort reason, if any, is in
    /// `SweepResult::error`.
    pub async fn run(&mut self, sink: &mut dyn MeasurementSink) -> SweepResult {
        info!(
            kind = %self.spec.kind(),
            targets = self.spec.targets().len(),
            imax = self.spec.imax,
            "Sweep starting"
        );
        self.state = SweepState::Init;
        let mut session = Session {
            source: None,
            bias: None,
            monitor: ComplianceMonitor::new(self.compliance_max, self.compliance_backoff),
            bias_monitor: ComplianceMonitor::new(self.compliance_max, self.compliance_backoff),
            range: self
                .spec
                .initial_range
                .map(|r| CurrentRangeController::new(r, self.spec.imax)),
            accepted: 0,
        };

        let outcome = self.execute(&mut session, sink).await;
        if let Err(err) = &outcome {
            error!(state = %self.state, error = %err, "Sweep aborted");
        }
        let shutdown = self.shut_down(&mut session, &outcome).await;

        let result = match outcome {
            Ok(()) => SweepResult::completed(session.accepted, shutdown),
            Err(err) => SweepResult::aborted(err, session.accepted, shutdown),
        };
        self.set_state(SweepState::Finished(result.status));
        sink.finish(&result);
        info!(status = %result.status, accepted = result.accepted, "Sweep finished");
        let _ = self.events.send(SweepEvent::Finished {
            status: result.status,
            accepted: result.accepted,
        });
        result
    }

    fn set_state(&mut self, next: SweepState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "State transition");
        let _ = self.events.send(SweepEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    fn check_abort(&self) -> Result<(), SweepError> {
        if self.abort.is_triggered() {
            warn!(state = %self.state, "Abort requested");
            return Err(SweepError::Interrupted);
        }
        Ok(())
    }

    fn check_configuration(&self) -> Result<(), SweepError> {
        self.spec.validate()?;
        match (&self.spec.bias, &self.instruments.bias) {
            (Some(_), None) => {
                return Err(SweepError::Configuration(
                    "dual-source sweep without a bias instrument".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(SweepError::Configuration(
                    "bias instrument supplied without a bias voltage".into(),
                ))
            }
            _ => {}
        }
        if !self.spec.frequencies.is_empty() && self.instruments.lcr.is_none() {
            return Err(SweepError::Configuration(
                "CV sweep without an LCR meter".into(),
            ));
        }
        Ok(())
    }

    async fn verify_idle(source: &dyn VoltageSource, expected: f64) -> Result<(), SweepError> {
        let (measured, _) = source
            .read_voltage_and_current()
            .await
            .map_err(|e| SweepError::transport(source.name(), e))?;
        if !within_tolerance(expected, measured) {
            return Err(SweepError::VoltageMismatch {
                instrument: source.name().to_string(),
                expected,
                measured,
                tolerance: VOLTAGE_TOLERANCE,
            });
        }
        debug!(instrument = source.name(), measured, "Initial voltage verified");
        Ok(())
    }

    /// Switch `source` on. The guard lands in `slot` even when enabling
    /// fails, so teardown still reaches it.
    async fn energize(
        &self,
        source: Arc<dyn VoltageSource>,
        at: f64,
        slot: &mut Option<EnergizedSource>,
    ) -> Result<(), SweepError> {
        match EnergizedSource::energize(source, at, self.ramp_down.clone()).await {
            Ok(guard) => {
                *slot = Some(guard);
                Ok(())
            }
            Err((guard, err)) => {
                *slot = Some(guard);
                Err(err)
            }
        }
    }

    async fn execute(
        &mut self,
        session: &mut Session,
        sink: &mut dyn MeasurementSink,
    ) -> Result<(), SweepError> {
        self.check_configuration()?;

        if let (Some(bias), Some(bias_spec)) = (&self.instruments.bias, &self.spec.bias) {
            Self::verify_idle(bias.as_ref(), bias_spec.initial_voltage).await?;
        }
        Self::verify_idle(self.instruments.source.as_ref(), self.spec.initial_voltage).await?;
        sink.begin(&self.spec)?;

        if let (Some(bias), Some(bias_spec)) = (self.instruments.bias.clone(), self.spec.bias.clone()) {
            self.set_state(SweepState::RampingToStart);
            self.energize(bias.clone(), bias_spec.initial_voltage, &mut session.bias).await?;
            let guard = session
                .bias
                .as_mut()
                .ok_or_else(|| SweepError::Configuration("bias guard missing".into()))?;
            RampStepper::new(bias_spec.profile)
                .with_abort(self.abort.clone())
                .ramp_to(
                    bias.as_ref(),
                    guard.position_mut(),
                    bias_spec.voltage,
                    &mut session.bias_monitor,
                )
                .await?;
            info!(instrument = bias.name(), voltage = bias_spec.voltage, "Bias held");
            let _ = self.events.send(SweepEvent::TargetReached {
                instrument: bias.name().to_string(),
                voltage: bias_spec.voltage,
            });
        }

        let source = Arc::clone(&self.instruments.source);
        self.energize(Arc::clone(&source), self.spec.initial_voltage, &mut session.source)
            .await?;
        if let Some(range) = &session.range {
            range.apply(source.as_ref()).await?;
        }

        let targets = self.spec.targets().to_vec();
        for (index, target) in targets.into_iter().enumerate() {
            self.step_to_target(session, index, target, sink).await?;
        }
        info!(accepted = session.accepted, "All targets measured");
        Ok(())
    }

    async fn step_to_target(
        &mut self,
        session: &mut Session,
        index: usize,
        target: f64,
        sink: &mut dyn MeasurementSink,
    ) -> Result<(), SweepError> {
        self.check_abort()?;
        let guard = session
            .source
            .as_mut()
            .ok_or_else(|| SweepError::Configuration("source guard missing".into()))?;
        let source = guard.source();
        let name = source.name().to_string();

        source
            .control_average(Switch::Off)
            .await
            .map_err(|e| SweepError::transport(&name, e))?;
        self.set_state(if index == 0 {
            SweepState::RampingToStart
        } else {
            SweepState::RampingStep
        });
        let report = RampStepper::new(self.spec.profile)
            .with_abort(self.abort.clone())
            .ramp_to(source.as_ref(), guard.position_mut(), target, &mut session.monitor)
            .await?;
        info!(instrument = %name, target, steps = report.steps, checks = report.checks, "Target reached");
        let _ = self.events.send(SweepEvent::TargetReached {
            instrument: name.clone(),
            voltage: target,
        });

        self.set_state(SweepState::Measuring);
        source
            .control_average(Switch::On)
            .await
            .map_err(|e| SweepError::transport(&name, e))?;
        let mut rest = self.spec.rest_time;
        if index == 0 {
            rest += self.spec.first_point_rest_time;
        }
        sleep(rest).await;

        loop {
            self.check_abort()?;
            session.monitor.check(source.as_ref(), target).await?;
            if let (Some(bias_guard), Some(bias_spec)) = (&session.bias, &self.spec.bias) {
                session
                    .bias_monitor
                    .check(bias_guard.source().as_ref(), bias_spec.voltage)
                    .await?;
            }

            let readings = self.read_point(source.as_ref()).await?;
            for reading in &readings {
                if !within_tolerance(target, reading.voltage()) {
                    return Err(SweepError::VoltageMismatch {
                        instrument: name,
                        expected: target,
                        measured: reading.voltage(),
                        tolerance: VOLTAGE_TOLERANCE,
                    });
                }
            }

            let overcurrent = readings
                .iter()
                .map(Measurement::current)
                .find(|i| i.abs() > self.spec.imax);
            if let Some(current) = overcurrent {
                warn!(instrument = %name, target, current, imax = self.spec.imax, "Current above Imax");
                let range = match session.range.as_mut() {
                    Some(controller) => {
                        controller
                            .escalate(source.as_ref(), current, self.spec.imax)
                            .await?
                    }
                    None => {
                        let ceiling = ceiling_for(self.spec.imax);
                        return Err(SweepError::CurrentRangeCeilingReached {
                            current,
                            imax: self.spec.imax,
                            range: ceiling,
                            ceiling,
                        });
                    }
                };
                let _ = self.events.send(SweepEvent::RangeEscalated { range });
                sleep(self.spec.rest_time).await;
                continue;
            }

            for measurement in readings {
                sink.record(&measurement)?;
                session.accepted += 1;
                info!(
                    voltage = measurement.voltage(),
                    current = measurement.current(),
                    capacitance = measurement.cv_reading().map(|cv| cv.capacitance),
                    accepted = session.accepted,
                    "Measurement accepted"
                );
                let _ = self.events.send(SweepEvent::Measured(measurement));
            }
            return Ok(());
        }
    }

    /// One IV reading, or one CV reading per configured frequency.
    async fn read_point(&self, source: &dyn VoltageSource) -> Result<Vec<Measurement>, SweepError> {
        let lcr = match (&self.instruments.lcr, self.spec.frequencies.is_empty()) {
            (Some(lcr), false) => lcr,
            _ => {
                let (voltage, current) = read_iv(source).await?;
                return Ok(vec![Measurement::iv(Local::now(), voltage, current)]);
            }
        };

        let lcr_err = |e: anyhow::Error| SweepError::transport(lcr.name(), e);
        let mut readings = Vec::with_capacity(self.spec.frequencies.len());
        for &frequency in &self.spec.frequencies {
            lcr.set_frequency(frequency).await.map_err(lcr_err)?;
            sleep(self.spec.lcr_settle).await;
            let (voltage, current) = read_iv(source).await?;
            let capacitance = lcr.read_capacitance().await.map_err(lcr_err)?;
            let resistance = lcr.read_resistance().await.map_err(lcr_err)?;
            readings.push(Measurement::cv(
                Local::now(),
                voltage,
                current,
                CvReading {
                    capacitance,
                    resistance,
                    frequency,
                },
            ));
        }
        Ok(readings)
    }

    /// Release every energized source, swept source first, bias last.
    async fn shut_down(
        &mut self,
        session: &mut Session,
        outcome: &Result<(), SweepError>,
    ) -> Vec<SourceShutdown> {
        let guards: Vec<EnergizedSource> = [session.source.take(), session.bias.take()]
            .into_iter()
            .flatten()
            .collect();
        if guards.is_empty() {
            return Vec::new();
        }

        let kill = self.spec.kill_on_hit_compliance
            && matches!(outcome, Err(SweepError::ComplianceExceeded { .. }));
        let hold = outcome.is_ok() && !self.spec.ramp_down;
        if !kill && !hold {
            self.set_state(SweepState::RampingDown);
        }

        let mut reports = Vec::with_capacity(guards.len());
        for guard in guards {
            let report = if hold {
                guard.hold()
            } else if kill {
                guard.kill().await
            } else {
                guard.release().await
            };
            reports.push(report);
        }
        reports
    }
}

async fn read_iv(source: &dyn VoltageSource) -> Result<(f64, f64), SweepError> {
    source
        .read_voltage_and_current()
        .await
        .map_err(|e| SweepError::transport(source.name(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::{BiasSpec, MemorySink, RampProfile};
    use probe_driver_mock::{ErrorConfig, ErrorScenario, MockLcrMeter, MockSourceMeter};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Op {
        Set(f64),
        Read,
    }

    /// Source that logs each command with the averaging state and clock.
    struct Recorder {
        inner: Arc<MockSourceMeter>,
        log: tokio::sync::Mutex<Vec<(Op, Switch, tokio::time::Instant)>>,
    }

    impl Recorder {
        fn new(inner: Arc<MockSourceMeter>) -> Self {
            Self {
                inner,
                log: tokio::sync::Mutex::new(Vec::new()),
            }
        }

        async fn note(&self, op: Op) {
            let average = self.inner.average().await;
            self.log.lock().await.push((op, average, tokio::time::Instant::now()));
        }

        async fn entries(&self) -> Vec<(Op, Switch, tokio::time::Instant)> {
            self.log.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl VoltageSource for Recorder {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn set_voltage(&self, volts: f64) -> anyhow::Result<()> {
            self.note(Op::Set(volts)).await;
            self.inner.set_voltage(volts).await
        }

        async fn read_voltage_and_current(&self) -> anyhow::Result<(f64, f64)> {
            self.note(Op::Read).await;
            self.inner.read_voltage_and_current().await
        }

        async fn in_compliance(&self) -> anyhow::Result<bool> {
            self.inner.in_compliance().await
        }

        async fn set_current_range(&self, amps: f64) -> anyhow::Result<()> {
            self.inner.set_current_range(amps).await
        }

        async fn control_average(&self, state: Switch) -> anyhow::Result<()> {
            self.inner.control_average(state).await
        }

        async fn control_source(&self, state: Switch) -> anyhow::Result<()> {
            self.inner.control_source(state).await
        }
    }

    fn iv_spec(targets: Vec<f64>) -> SweepSpec {
        SweepSpec::from_targets(targets, 1e-6)
            .with_full_step(true)
            .with_rest_time(Duration::from_millis(100))
    }

    #[test]
    fn state_display() {
        assert_eq!(SweepState::RampingDown.to_string(), "ramping_down");
        assert_eq!(
            SweepState::Finished(SweepStatus::Completed).to_string(),
            "finished (completed)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn states_are_broadcast_in_order() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let mut orchestrator = SweepOrchestrator::new(iv_spec(vec![0.0, -1.0]), SweepInstruments::single(smu));
        let mut events = orchestrator.subscribe();
        let mut sink = MemorySink::default();

        orchestrator.run(&mut sink).await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SweepEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(
            states,
            vec![
                SweepState::RampingToStart,
                SweepState::Measuring,
                SweepState::RampingStep,
                SweepState::Measuring,
                SweepState::RampingDown,
                SweepState::Finished(SweepStatus::Completed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn initial_mismatch_aborts_before_energizing() {
        let smu = Arc::new(MockSourceMeter::with_config(
            probe_driver_mock::MockSourceMeterConfig {
                name: "ps".into(),
                initial_voltage: -3.0,
                output_on: true,
                ..Default::default()
            },
        ));
        let mut orchestrator =
            SweepOrchestrator::new(iv_spec(vec![0.0, -1.0]), SweepInstruments::single(smu.clone()));
        let mut sink = MemorySink::default();

        let result = orchestrator.run(&mut sink).await;

        assert_eq!(result.status, SweepStatus::AbortedMismatch);
        assert!(result.shutdown.is_empty());
        assert!(smu.history().await.is_empty());
        assert_eq!(orchestrator.state(), SweepState::Finished(SweepStatus::AbortedMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn operator_cancel_ramps_down() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let spec = SweepSpec::from_targets(vec![0.0, -10.0, -20.0], 1e-6)
            .with_rest_time(Duration::from_millis(10));
        let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(smu.clone()));
        let cancel = orchestrator.abort_handle();
        let mut events = orchestrator.subscribe();

        let watcher = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let SweepEvent::Measured(m) = event {
                    if m.voltage() == -10.0 {
                        cancel.trigger();
                    }
                }
            }
        });
        let mut sink = MemorySink::default();
        let result = orchestrator.run(&mut sink).await;
        drop(orchestrator);
        let _ = watcher.await;

        assert_eq!(result.status, SweepStatus::AbortedExternal);
        assert_eq!(result.accepted, 2);
        assert_eq!(smu.voltage().await, 0.0);
        assert_eq!(smu.output().await, Switch::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_on_compliance_skips_ramp_down() {
        let smu = Arc::new(MockSourceMeter::new("ps").with_compliance_threshold(4.0));
        let spec = iv_spec(vec![0.0, -2.0, -4.0]).with_kill_on_hit_compliance(true);
        let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(smu.clone()));
        let mut sink = MemorySink::default();

        let result = orchestrator.run(&mut sink).await;

        assert_eq!(result.status, SweepStatus::AbortedCompliance);
        assert_eq!(result.shutdown[0].final_voltage, -4.0);
        assert_eq!(smu.output().await, Switch::Off);
        assert_eq!(*smu.history().await.last().unwrap(), -4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_at_end_leaves_source_energized() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let spec = iv_spec(vec![0.0, -5.0]).with_ramp_down(false);
        let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(smu.clone()));
        let mut sink = MemorySink::default();

        let result = orchestrator.run(&mut sink).await;

        assert!(result.status.is_completed());
        assert_eq!(result.shutdown[0].output, Switch::On);
        assert_eq!(smu.voltage().await, -5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_still_ramps_down() {
        let smu = Arc::new(MockSourceMeter::new("ps").with_errors(ErrorConfig::scenario(
            ErrorScenario::FailAfterN {
                operation: "read",
                count: 2,
            },
        )));
        let spec = iv_spec(vec![0.0, -1.0, -2.0]);
        let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(smu.clone()));
        let mut sink = MemorySink::default();

        let result = orchestrator.run(&mut sink).await;

        // One read for the initial check, one for the first target.
        assert_eq!(result.status, SweepStatus::AbortedFault);
        assert_eq!(result.accepted, 1);
        assert!(matches!(result.error, Some(SweepError::Transport(_))));
        assert_eq!(smu.voltage().await, 0.0);
        assert_eq!(smu.output().await, Switch::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn cv_sweep_reads_every_frequency() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let lcr = Arc::new(MockLcrMeter::new("lcr").attached_to(smu.clone()));
        let spec = iv_spec(vec![0.0, -15.0]).with_frequencies(vec![1_000.0, 10_000.0]);
        let instruments = SweepInstruments::single(smu.clone()).with_lcr(lcr.clone());
        let mut orchestrator = SweepOrchestrator::new(spec, instruments);
        let mut sink = MemorySink::default();

        let result = orchestrator.run(&mut sink).await;

        assert!(result.status.is_completed());
        assert_eq!(result.accepted, 4);
        let at_15: Vec<_> = sink.measurements.iter().filter(|m| m.voltage() == -15.0).collect();
        assert_eq!(at_15.len(), 2);
        let cv = at_15[1].cv_reading().unwrap();
        assert_eq!(cv.frequency, 10_000.0);
        assert!((cv.capacitance - 50e-12).abs() < 1e-18);
    }

    #[tokio::test(start_paused = true)]
    async fn cv_without_lcr_is_rejected() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let spec = iv_spec(vec![0.0]).with_frequencies(vec![1_000.0]);
        let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(smu.clone()));

        let result = orchestrator.run(&mut MemorySink::default()).await;

        assert_eq!(result.status, SweepStatus::AbortedFault);
        assert!(matches!(result.error, Some(SweepError::Configuration(_))));
        assert!(smu.history().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dual_source_bias_first_up_last_down() {
        let bias = Arc::new(MockSourceMeter::new("hv"));
        let smu = Arc::new(MockSourceMeter::new("smu"));
        let spec = SweepSpec::from_targets(vec![0.0, -1.0, -2.0], 1e-6)
            .with_profile(RampProfile::source_measure_unit())
            .with_bias(BiasSpec::new(-50.0));
        let instruments = SweepInstruments::single(smu.clone()).with_bias(bias.clone());
        let mut orchestrator = SweepOrchestrator::new(spec, instruments);
        let mut sink = MemorySink::default();

        let result = orchestrator.run(&mut sink).await;

        assert!(result.status.is_completed());
        assert_eq!(result.accepted, 3);
        let order: Vec<_> = result.shutdown.iter().map(|s| s.instrument.as_str()).collect();
        assert_eq!(order, vec!["smu", "hv"]);
        assert!(bias.history().await.contains(&-50.0));
        assert_eq!(bias.voltage().await, 0.0);
        assert_eq!(smu.voltage().await, 0.0);
        assert_eq!(bias.output().await, Switch::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn averaging_off_while_ramping_on_while_reading() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let recorder = Arc::new(Recorder::new(smu.clone()));
        let spec = SweepSpec::from_targets(vec![0.0, -1.0, -2.0], 1e-6)
            .with_rest_time(Duration::from_millis(10));
        let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(recorder.clone()));

        let result = orchestrator.run(&mut MemorySink::default()).await;
        assert!(result.status.is_completed());

        let entries = recorder.entries().await;
        // The idle check reads before anything is switched.
        assert_eq!(entries[0].0, Op::Read);
        let last_read = entries
            .iter()
            .rposition(|(op, _, _)| *op == Op::Read)
            .unwrap();
        let sweep = &entries[1..=last_read];
        assert_eq!(sweep.iter().filter(|(op, _, _)| *op == Op::Read).count(), 3);
        assert_eq!(sweep.iter().filter(|(op, _, _)| matches!(op, Op::Set(_))).count(), 20);
        for (op, average, _) in sweep {
            match op {
                Op::Set(v) => assert_eq!(*average, Switch::Off, "ramp step to {v} V averaged"),
                Op::Read => assert_eq!(*average, Switch::On, "read without averaging"),
            }
        }
        assert_eq!(smu.voltage().await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_point_waits_longer() {
        let smu = Arc::new(MockSourceMeter::new("ps"));
        let recorder = Arc::new(Recorder::new(smu));
        let rest = Duration::from_millis(100);
        let first_extra = Duration::from_secs(1);
        let settle = RampProfile::high_voltage().settle;
        let spec = iv_spec(vec![0.0, -1.0, -2.0]).with_first_point_rest_time(first_extra);
        let mut orchestrator = SweepOrchestrator::new(spec, SweepInstruments::single(recorder.clone()));
        let mut events = orchestrator.subscribe();

        let started = tokio::time::Instant::now();
        let result = orchestrator.run(&mut MemorySink::default()).await;
        assert_eq!(result.accepted, 3);

        let mut first_measured = None;
        while let Ok(event) = events.try_recv() {
            if let SweepEvent::Measured(m) = event {
                first_measured.get_or_insert(m.voltage());
            }
        }
        assert_eq!(first_measured, Some(0.0));

        let entries = recorder.entries().await;
        let read_after = |from: usize| {
            entries[from..]
                .iter()
                .find(|(op, _, _)| *op == Op::Read)
                .map(|(_, _, at)| *at)
                .unwrap()
        };
        let slack = Duration::from_millis(5);
        let within = |gap: Duration, expected: Duration| gap >= expected && gap < expected + slack;

        // Target 0 V needs no ramp: its read follows the idle check after
        // the rest time plus the first-point extra.
        let first_gap = read_after(1) - started;
        assert!(within(first_gap, rest + first_extra), "first point after {first_gap:?}");

        // Later targets: one full-step command, its settle, then the rest time only.
        for target in [-1.0, -2.0] {
            let set = entries
                .iter()
                .position(|(op, _, _)| *op == Op::Set(target))
                .unwrap();
            let gap = read_after(set) - entries[set].2;
            assert!(within(gap, settle + rest), "{target} V read {gap:?} after its step");
        }
    }
}
