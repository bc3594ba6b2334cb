//! Simulated voltage source with current read-back.
//!
//! Models both a high-voltage supply and a source-measure unit. Behaviour is
//! driven by [`MockSourceMeterConfig`]:
//!
//! - `readback_gain` scales the read-back voltage, simulating an instrument
//!   whose output does not follow the command
//! - `compliance_threshold` sets the bias magnitude at or beyond which the
//!   compliance flag is raised
//! - `leakage_resistance` turns voltage into current (ohmic leakage)
//! - `overrange` pegs the current reading while the current range is too
//!   low, like a saturated ammeter
//!
//! Every commanded voltage is kept in a history for test assertions.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use anyhow::Result;
use async_trait::async_trait;
use probe_core::capabilities::{Switch, VoltageSource};
use probe_core::error::{DriverError, DriverErrorKind};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Saturated-reading model for a current range set too low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverrangeConfig {
    /// Readings are pegged while the range exponent is below this decade.
    pub below_range: i32,
    /// Current reported while pegged, in amps.
    pub reading: f64,
}

/// Configuration for a simulated source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSourceMeterConfig {
    /// Instrument name.
    pub name: String,
    /// Largest voltage magnitude the instrument accepts.
    pub max_voltage: f64,
    /// Read-back voltage divided by commanded voltage.
    pub readback_gain: f64,
    /// Ohms between the terminals.
    pub leakage_resistance: f64,
    /// Bias magnitude at or beyond which the compliance flag is set.
    pub compliance_threshold: Option<f64>,
    /// Pinned readings below a range exponent.
    pub overrange: Option<OverrangeConfig>,
    /// Peak uniform noise added to current readings, in amps.
    pub current_noise: f64,
    /// Output level at power-up.
    pub initial_voltage: f64,
    /// Whether the output stage starts enabled.
    pub output_on: bool,
    /// Noise seed. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for MockSourceMeterConfig {
    fn default() -> Self {
        Self {
            name: "mock_smu".to_string(),
            max_voltage: 1100.0,
            readback_gain: 1.0,
            leakage_resistance: 1e10,
            compliance_threshold: None,
            overrange: None,
            current_noise: 0.0,
            initial_voltage: 0.0,
            output_on: false,
            seed: Some(0),
        }
    }
}

#[derive(Debug)]
struct SourceState {
    voltage: f64,
    output: Switch,
    average: Switch,
    range_exponent: Option<i32>,
    history: Vec<f64>,
    compliance_queries: u32,
}

/// Simulated source-measure unit.
///
/// # Example
///
/// ```rust,ignore
/// let smu = MockSourceMeter::new("ps").with_compliance_threshold(4.0);
/// smu.control_source(Switch::On).await?;
/// smu.set_voltage(-2.0).await?;
/// assert!(!smu.in_compliance().await?);
/// ```
#[derive(Debug)]
pub struct MockSourceMeter {
    config: MockSourceMeterConfig,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    rng: MockRng,
    state: RwLock<SourceState>,
}

impl MockSourceMeter {
    /// Source with default behaviour.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(MockSourceMeterConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    /// Source built from `config`.
    pub fn with_config(config: MockSourceMeterConfig) -> Self {
        let state = SourceState {
            voltage: config.initial_voltage,
            output: Switch::from(config.output_on),
            average: Switch::Off,
            range_exponent: None,
            history: Vec::new(),
            compliance_queries: 0,
        };
        Self {
            rng: MockRng::new(config.seed),
            mode: MockMode::Instant,
            timing: TimingConfig::source_measure_unit(),
            errors: ErrorConfig::none(),
            state: RwLock::new(state),
            config,
        }
    }

    /// Chaos mode also installs a 2% random failure rate unless explicit
    /// scenarios were set.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        if mode == MockMode::Chaos {
            self.errors = ErrorConfig::random_failures_seeded(0.02, self.config.seed);
        }
        self
    }

    /// Override command and read delays.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Inject failures.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Set the compliance flag at or beyond `volts` of bias.
    pub fn with_compliance_threshold(mut self, volts: f64) -> Self {
        self.config.compliance_threshold = Some(volts.abs());
        self
    }

    /// Scale the read-back voltage.
    pub fn with_readback_gain(mut self, gain: f64) -> Self {
        self.config.readback_gain = gain;
        self
    }

    /// Set the terminal resistance.
    pub fn with_leakage_resistance(mut self, ohms: f64) -> Self {
        self.config.leakage_resistance = ohms;
        self
    }

    /// Report `reading` amps while the range exponent is below `below_range`.
    pub fn with_overrange(mut self, below_range: i32, reading: f64) -> Self {
        self.config.overrange = Some(OverrangeConfig {
            below_range,
            reading,
        });
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &MockSourceMeterConfig {
        &self.config
    }

    /// Last commanded voltage.
    pub async fn voltage(&self) -> f64 {
        self.state.read().await.voltage
    }

    /// Output stage state.
    pub async fn output(&self) -> Switch {
        self.state.read().await.output
    }

    /// Averaging filter state.
    pub async fn average(&self) -> Switch {
        self.state.read().await.average
    }

    /// Current range last programmed, as a log10 exponent.
    pub async fn range_exponent(&self) -> Option<i32> {
        self.state.read().await.range_exponent
    }

    /// Every voltage accepted by `set_voltage`, in order.
    pub async fn history(&self) -> Vec<f64> {
        self.state.read().await.history.clone()
    }

    /// Number of `in_compliance` queries answered.
    pub async fn compliance_queries(&self) -> u32 {
        self.state.read().await.compliance_queries
    }

    /// Present bias across the device: commanded voltage while the output is
    /// on, 0 V otherwise.
    pub async fn applied_voltage(&self) -> f64 {
        let state = self.state.read().await;
        match state.output {
            Switch::On => state.voltage,
            Switch::Off => 0.0,
        }
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        self.errors
            .check_operation(&self.config.name, operation)
            .map_err(anyhow::Error::new)
    }

    async fn command_latency(&self) {
        if self.mode.has_latency() {
            sleep(self.timing.command_delay()).await;
        }
    }

    async fn read_latency(&self) {
        if self.mode.has_latency() {
            sleep(self.timing.read_delay()).await;
        }
    }
}

#[async_trait]
impl VoltageSource for MockSourceMeter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.check("set_voltage")?;
        if !volts.is_finite() || volts.abs() > self.config.max_voltage {
            return Err(DriverError::new(
                &self.config.name,
                DriverErrorKind::InvalidParameter,
                format!("{} V outside ±{} V", volts, self.config.max_voltage),
            )
            .into());
        }
        self.command_latency().await;
        let mut state = self.state.write().await;
        state.voltage = volts;
        state.history.push(volts);
        trace!(instrument = %self.config.name, volts, "Voltage set");
        Ok(())
    }

    async fn read_voltage_and_current(&self) -> Result<(f64, f64)> {
        self.check("read")?;
        self.read_latency().await;
        let state = self.state.read().await;
        if state.output == Switch::Off {
            return Ok((0.0, 0.0));
        }
        let voltage = state.voltage * self.config.readback_gain;
        let pegged = match (self.config.overrange, state.range_exponent) {
            (Some(over), Some(range)) => range < over.below_range,
            _ => false,
        };
        let current = if pegged {
            self.config.overrange.map_or(0.0, |o| o.reading)
        } else {
            voltage / self.config.leakage_resistance + self.rng.jitter(self.config.current_noise)
        };
        Ok((voltage, current))
    }

    async fn in_compliance(&self) -> Result<bool> {
        self.check("in_compliance")?;
        let mut state = self.state.write().await;
        state.compliance_queries += 1;
        let tripped = state.output == Switch::On
            && self
                .config
                .compliance_threshold
                .is_some_and(|limit| state.voltage.abs() >= limit);
        Ok(tripped)
    }

    async fn set_current_range(&self, amps: f64) -> Result<()> {
        self.check("set_current_range")?;
        if !(amps.is_finite() && amps > 0.0) {
            return Err(DriverError::new(
                &self.config.name,
                DriverErrorKind::InvalidParameter,
                format!("current range {} A is not positive", amps),
            )
            .into());
        }
        self.command_latency().await;
        let exponent = amps.log10().round() as i32;
        self.state.write().await.range_exponent = Some(exponent);
        debug!(instrument = %self.config.name, exponent, "Current range set");
        Ok(())
    }

    async fn control_average(&self, state: Switch) -> Result<()> {
        self.check("control_average")?;
        self.state.write().await.average = state;
        Ok(())
    }

    async fn control_source(&self, output: Switch) -> Result<()> {
        self.check("control_source")?;
        self.command_latency().await;
        self.state.write().await.output = output;
        debug!(instrument = %self.config.name, %output, "Output switched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;

    #[tokio::test]
    async fn echoes_commanded_voltage() -> Result<()> {
        let smu = MockSourceMeter::new("ps").with_leakage_resistance(1e9);
        smu.control_source(Switch::On).await?;
        smu.set_voltage(-2.0).await?;
        let (v, i) = smu.read_voltage_and_current().await?;
        assert_eq!(v, -2.0);
        assert!((i - -2e-9).abs() < 1e-15);
        assert_eq!(smu.history().await, vec![-2.0]);
        Ok(())
    }

    #[tokio::test]
    async fn output_off_reads_zero() -> Result<()> {
        let smu = MockSourceMeter::new("ps");
        smu.set_voltage(-5.0).await?;
        assert_eq!(smu.read_voltage_and_current().await?, (0.0, 0.0));
        assert_eq!(smu.applied_voltage().await, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn readback_gain_skews_voltage() -> Result<()> {
        let smu = MockSourceMeter::new("ps").with_readback_gain(1.05);
        smu.control_source(Switch::On).await?;
        smu.set_voltage(-10.0).await?;
        let (v, _) = smu.read_voltage_and_current().await?;
        assert!((v - -10.5).abs() < 1e-12);
        Ok(())
    }

    #[tokio::test]
    async fn compliance_flag_follows_threshold() -> Result<()> {
        let smu = MockSourceMeter::new("ps").with_compliance_threshold(4.0);
        smu.control_source(Switch::On).await?;
        smu.set_voltage(-2.0).await?;
        assert!(!smu.in_compliance().await?);
        smu.set_voltage(-4.0).await?;
        assert!(smu.in_compliance().await?);
        assert!(smu.hit_compliance(3).await?);
        assert_eq!(smu.compliance_queries().await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn overrange_reading_until_range_raised() -> Result<()> {
        let smu = MockSourceMeter::new("am")
            .with_leakage_resistance(1e7)
            .with_overrange(-7, 2e-6);
        smu.control_source(Switch::On).await?;
        smu.set_current_range(1e-8).await?;
        smu.set_voltage(-2.0).await?;
        assert_eq!(smu.read_voltage_and_current().await?.1, 2e-6);

        smu.set_current_range(1e-7).await?;
        assert_eq!(smu.range_exponent().await, Some(-7));
        let (_, i) = smu.read_voltage_and_current().await?;
        assert!((i - -2e-7).abs() < 1e-15);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_voltage_beyond_limit() {
        let smu = MockSourceMeter::new("ps");
        let err = smu.set_voltage(-2000.0).await.unwrap_err();
        let driver = err.downcast::<DriverError>().unwrap();
        assert_eq!(driver.kind, DriverErrorKind::InvalidParameter);
        assert!(smu.history().await.is_empty());
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_driver_error() {
        let smu = MockSourceMeter::new("ps").with_errors(ErrorConfig::scenario(
            ErrorScenario::Timeout { operation: "read" },
        ));
        let err = smu.read_voltage_and_current().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<DriverError>().map(|e| e.kind),
            Some(DriverErrorKind::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn realistic_mode_adds_latency() -> Result<()> {
        let smu = MockSourceMeter::new("ps")
            .with_mode(MockMode::Realistic)
            .with_timing(TimingConfig::high_voltage_supply());
        let start = tokio::time::Instant::now();
        smu.set_voltage(-1.0).await?;
        assert!(start.elapsed() >= std::time::Duration::from_millis(5));
        Ok(())
    }
}
