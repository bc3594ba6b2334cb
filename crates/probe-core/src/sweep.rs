//! Declarative description of one IV or CV sweep.
//!
//! A [`SweepSpec`] is built once from caller configuration and is read-only
//! while the sweep runs. Target lists are cleaned of adjacent duplicates at
//! construction, since re-measuring an identical voltage indicates a
//! configuration error rather than new data.

use crate::error::SweepError;
use crate::limits::{
    COMPLIANCE_CHECK_INTERVAL, LCR_SETTLE, MAX_TARGETS, MIN_RAMP_STEP, RAMP_SETTLE,
    SMU_COMPLIANCE_CHECK_INTERVAL, SMU_RAMP_SETTLE,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Which named test a sweep implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepKind {
    /// Single source, current read-back.
    Iv,
    /// Held bias source plus a swept source-measure unit.
    IvSmu,
    /// Single source, LCR read-back at each frequency.
    Cv,
    /// Held bias source plus a swept source, LCR read-back.
    CvSmu,
}

impl SweepKind {
    /// Whether the sweep reads an LCR meter.
    pub fn is_cv(self) -> bool {
        matches!(self, SweepKind::Cv | SweepKind::CvSmu)
    }

    /// Whether a held bias source takes part.
    pub fn is_dual(self) -> bool {
        matches!(self, SweepKind::IvSmu | SweepKind::CvSmu)
    }
}

impl std::fmt::Display for SweepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepKind::Iv => write!(f, "IV"),
            SweepKind::IvSmu => write!(f, "IV_SMU"),
            SweepKind::Cv => write!(f, "CV"),
            SweepKind::CvSmu => write!(f, "CV_SMU"),
        }
    }
}

/// How one source moves between voltages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampProfile {
    /// Jump straight to each target with a single command.
    pub full_step: bool,
    /// Volts per increment when not full-step. Raised to
    /// [`MIN_RAMP_STEP`] if smaller.
    pub step_size: f64,
    /// Volts of travel between compliance checks.
    pub check_interval: f64,
    /// Wait after each increment.
    pub settle: Duration,
}

impl RampProfile {
    /// Pacing for a high-voltage supply.
    pub fn high_voltage() -> Self {
        Self {
            full_step: false,
            step_size: MIN_RAMP_STEP,
            check_interval: COMPLIANCE_CHECK_INTERVAL,
            settle: RAMP_SETTLE,
        }
    }

    /// Pacing for a source-measure unit.
    pub fn source_measure_unit() -> Self {
        Self {
            full_step: false,
            step_size: MIN_RAMP_STEP,
            check_interval: SMU_COMPLIANCE_CHECK_INTERVAL,
            settle: SMU_RAMP_SETTLE,
        }
    }

    /// Increment magnitude actually used.
    pub fn effective_step(&self) -> f64 {
        self.step_size.abs().max(MIN_RAMP_STEP)
    }

    fn validate(&self, what: &str) -> Result<(), SweepError> {
        if !self.step_size.is_finite() {
            return Err(SweepError::Configuration(format!("{what} step size must be finite")));
        }
        if !(self.check_interval.is_finite() && self.check_interval > 0.0) {
            return Err(SweepError::Configuration(format!(
                "{what} compliance check interval must be positive, got {}",
                self.check_interval
            )));
        }
        Ok(())
    }
}

/// The held bias source of a dual-source sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasSpec {
    /// Voltage the bias source is ramped to and held at.
    pub voltage: f64,
    /// Voltage the bias source must read before it is ramped.
    pub initial_voltage: f64,
    /// Ramp pacing of the bias source.
    pub profile: RampProfile,
}

impl BiasSpec {
    /// Bias held at `voltage`, ramped up from 0 V at high-voltage pacing.
    pub fn new(voltage: f64) -> Self {
        Self {
            voltage,
            initial_voltage: 0.0,
            profile: RampProfile::high_voltage(),
        }
    }
}

/// Everything the orchestrator needs to run one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSpec {
    targets: Vec<f64>,
    /// Voltage the swept source must read before the sweep starts.
    pub initial_voltage: f64,
    /// Wait after reaching a target before measuring.
    pub rest_time: Duration,
    /// Extra wait before the very first measurement.
    pub first_point_rest_time: Duration,
    /// Ramp behaviour of the swept source.
    pub profile: RampProfile,
    /// Current limit in amps. Readings above it trigger range escalation.
    pub imax: f64,
    /// Starting current range as a log10-of-amps exponent. `None` leaves the
    /// instrument auto-ranging and turns any overcurrent into a ceiling abort.
    pub initial_range: Option<i32>,
    /// Disable the output immediately on a compliance abort instead of
    /// ramping down.
    pub kill_on_hit_compliance: bool,
    /// Ramp to 0 V after a completed sweep. Aborts always ramp down.
    pub ramp_down: bool,
    /// LCR test frequencies in hertz. Empty for IV sweeps.
    pub frequencies: Vec<f64>,
    /// Wait after changing the LCR frequency.
    pub lcr_settle: Duration,
    /// Dual-source sweeps: the held bias source.
    pub bias: Option<BiasSpec>,
}

impl SweepSpec {
    /// Build a spec from a literal target list.
    ///
    /// Adjacent duplicates are dropped with a warning.
    pub fn from_targets(targets: impl Into<Vec<f64>>, imax: f64) -> Self {
        let (targets, dropped) = filter_adjacent_duplicates(targets.into());
        if dropped > 0 {
            warn!(dropped, "Removed adjacent duplicate target voltages");
        }
        Self {
            targets,
            initial_voltage: 0.0,
            rest_time: Duration::from_secs(1),
            first_point_rest_time: Duration::ZERO,
            profile: RampProfile::high_voltage(),
            imax,
            initial_range: None,
            kill_on_hit_compliance: false,
            ramp_down: true,
            frequencies: Vec::new(),
            lcr_settle: LCR_SETTLE,
            bias: None,
        }
    }

    /// Build a spec from a `(start, step, end)` triple.
    ///
    /// The step sign is taken from the direction of travel and `end` is
    /// always included, even when it is not a whole number of steps from
    /// `start`.
    pub fn linear(start: f64, step: f64, end: f64, imax: f64) -> Result<Self, SweepError> {
        Ok(Self::from_targets(linear_targets(start, step, end)?, imax))
    }

    /// Target voltages in sweep order.
    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    /// Named test implied by the bias and frequency settings.
    pub fn kind(&self) -> SweepKind {
        match (self.bias.is_some(), self.frequencies.is_empty()) {
            (false, true) => SweepKind::Iv,
            (true, true) => SweepKind::IvSmu,
            (false, false) => SweepKind::Cv,
            (true, false) => SweepKind::CvSmu,
        }
    }

    /// Wait at each target before reading.
    pub fn with_rest_time(mut self, rest: Duration) -> Self {
        self.rest_time = rest;
        self
    }

    /// Extra wait before the first reading only.
    pub fn with_first_point_rest_time(mut self, rest: Duration) -> Self {
        self.first_point_rest_time = rest;
        self
    }

    /// Ramp pacing of the swept source.
    pub fn with_profile(mut self, profile: RampProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Command each target in one step.
    pub fn with_full_step(mut self, full_step: bool) -> Self {
        self.profile.full_step = full_step;
        self
    }

    /// Voltage the source must read before the sweep starts.
    pub fn with_initial_voltage(mut self, volts: f64) -> Self {
        self.initial_voltage = volts;
        self
    }

    /// Start at current range 1e`exponent` A.
    pub fn with_initial_range(mut self, exponent: i32) -> Self {
        self.initial_range = Some(exponent);
        self
    }

    /// Switch off without ramping on a compliance abort.
    pub fn with_kill_on_hit_compliance(mut self, kill: bool) -> Self {
        self.kill_on_hit_compliance = kill;
        self
    }

    /// Ramp down after a completed sweep. `false` holds the last voltage.
    pub fn with_ramp_down(mut self, ramp_down: bool) -> Self {
        self.ramp_down = ramp_down;
        self
    }

    /// LCR test frequencies in hertz. A non-empty list makes this a CV sweep.
    pub fn with_frequencies(mut self, hz: impl Into<Vec<f64>>) -> Self {
        self.frequencies = hz.into();
        self
    }

    /// Wait after each LCR frequency change.
    pub fn with_lcr_settle(mut self, settle: Duration) -> Self {
        self.lcr_settle = settle;
        self
    }

    /// Add a held bias source.
    pub fn with_bias(mut self, bias: BiasSpec) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Reject values the engine cannot run safely.
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.targets.is_empty() {
            return Err(SweepError::Configuration("target voltage list is empty".into()));
        }
        if self.targets.len() > MAX_TARGETS {
            return Err(SweepError::Configuration(format!(
                "{} targets exceed the limit of {MAX_TARGETS}",
                self.targets.len()
            )));
        }
        if let Some(v) = self.targets.iter().find(|v| !v.is_finite()) {
            return Err(SweepError::Configuration(format!("target voltage {v} is not finite")));
        }
        if !(self.imax.is_finite() && self.imax > 0.0) {
            return Err(SweepError::Configuration(format!(
                "Imax must be a positive current, got {}",
                self.imax
            )));
        }
        if let Some(f) = self.frequencies.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
            return Err(SweepError::Configuration(format!("frequency {f} Hz is not positive")));
        }
        self.profile.validate("sweep")?;
        if let Some(bias) = &self.bias {
            if !bias.voltage.is_finite() {
                return Err(SweepError::Configuration("bias voltage must be finite".into()));
            }
            bias.profile.validate("bias")?;
        }
        Ok(())
    }
}

/// Drop every target equal to its predecessor. Returns the cleaned list and
/// the number of values removed.
pub fn filter_adjacent_duplicates(targets: Vec<f64>) -> (Vec<f64>, usize) {
    let before = targets.len();
    let mut cleaned: Vec<f64> = Vec::with_capacity(before);
    for v in targets {
        if cleaned.last() != Some(&v) {
            cleaned.push(v);
        }
    }
    let dropped = before - cleaned.len();
    (cleaned, dropped)
}

/// Expand a `(start, step, end)` triple into target voltages.
pub fn linear_targets(start: f64, step: f64, end: f64) -> Result<Vec<f64>, SweepError> {
    if !(start.is_finite() && step.is_finite() && end.is_finite()) {
        return Err(SweepError::Configuration("start, step and end must be finite".into()));
    }
    if step == 0.0 {
        return Err(SweepError::Configuration("voltage step must be non-zero".into()));
    }
    let span = end - start;
    let signed_step = step.abs().copysign(span);
    // Whole steps that fit without passing `end`.
    let steps = (span.abs() / step.abs() + 1e-9).floor();
    if steps >= MAX_TARGETS as f64 {
        return Err(SweepError::Configuration(format!(
            "step {step} V from {start} V to {end} V gives more than {MAX_TARGETS} targets"
        )));
    }
    let whole = steps as usize;
    let mut targets: Vec<f64> = (0..=whole).map(|k| start + signed_step * k as f64).collect();
    match targets.last_mut() {
        Some(last) if (*last - end).abs() < 1e-9 => *last = end,
        _ => targets.push(end),
    }
    Ok(targets)
}
