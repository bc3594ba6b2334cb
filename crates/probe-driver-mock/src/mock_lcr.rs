//! Simulated LCR meter.
//!
//! When attached to a [`MockSourceMeter`] the capacitance follows a
//! depletion curve of the live bias: `C = C_full * sqrt(V_dep / |V|)` below
//! full depletion, flat at `C_full` beyond it. Unattached meters read
//! `C_full`.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::mock_smu::MockSourceMeter;
use anyhow::Result;
use async_trait::async_trait;
use probe_core::capabilities::LcrMeter;
use probe_core::error::{DriverError, DriverErrorKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::sleep;

/// Configuration for a simulated LCR meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockLcrMeterConfig {
    /// Instrument name.
    pub name: String,
    /// Capacitance at and beyond full depletion, in farads.
    pub full_depletion_capacitance: f64,
    /// Bias magnitude of full depletion, in volts.
    pub depletion_voltage: f64,
    /// Lower clamp on |V| to keep the curve finite at 0 V.
    pub built_in_voltage: f64,
    /// Parallel resistance at 1 kHz, in ohms. Scales as 1/f.
    pub resistance_at_1khz: f64,
    /// Relative peak noise on capacitance readings.
    pub relative_noise: f64,
    /// Noise seed. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for MockLcrMeterConfig {
    fn default() -> Self {
        Self {
            name: "mock_lcr".to_string(),
            full_depletion_capacitance: 25e-12,
            depletion_voltage: 60.0,
            built_in_voltage: 0.6,
            resistance_at_1khz: 1e6,
            relative_noise: 0.0,
            seed: Some(0),
        }
    }
}

/// Simulated LCR meter.
#[derive(Debug)]
pub struct MockLcrMeter {
    config: MockLcrMeterConfig,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    rng: MockRng,
    frequency: RwLock<f64>,
    bias: Option<Arc<MockSourceMeter>>,
}

impl MockLcrMeter {
    /// Meter with default behaviour.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(MockLcrMeterConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    /// Meter built from `config`.
    pub fn with_config(config: MockLcrMeterConfig) -> Self {
        Self {
            rng: MockRng::new(config.seed),
            mode: MockMode::Instant,
            timing: TimingConfig::lcr_meter(),
            errors: ErrorConfig::none(),
            frequency: RwLock::new(1_000.0),
            bias: None,
            config,
        }
    }

    /// Read the bias for the C(V) curve from `source`.
    pub fn attached_to(mut self, source: Arc<MockSourceMeter>) -> Self {
        self.bias = Some(source);
        self
    }

    /// Set the timing mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Inject failures.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Last frequency set, in hertz.
    pub async fn frequency(&self) -> f64 {
        *self.frequency.read().await
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        self.errors
            .check_operation(&self.config.name, operation)
            .map_err(anyhow::Error::new)
    }

    async fn latency(&self) {
        if self.mode.has_latency() {
            sleep(self.timing.read_delay()).await;
        }
    }

    fn capacitance_at(&self, bias: f64) -> f64 {
        let magnitude = bias.abs().max(self.config.built_in_voltage);
        if magnitude >= self.config.depletion_voltage {
            self.config.full_depletion_capacitance
        } else {
            self.config.full_depletion_capacitance
                * (self.config.depletion_voltage / magnitude).sqrt()
        }
    }
}

#[async_trait]
impl LcrMeter for MockLcrMeter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn set_frequency(&self, hz: f64) -> Result<()> {
        self.check("set_frequency")?;
        if !(hz.is_finite() && hz > 0.0) {
            return Err(DriverError::new(
                &self.config.name,
                DriverErrorKind::InvalidParameter,
                format!("frequency {} Hz is not positive", hz),
            )
            .into());
        }
        *self.frequency.write().await = hz;
        Ok(())
    }

    async fn read_capacitance(&self) -> Result<f64> {
        self.check("read_capacitance")?;
        self.latency().await;
        let bias = match &self.bias {
            Some(source) => source.applied_voltage().await,
            None => self.config.depletion_voltage,
        };
        let c = self.capacitance_at(bias);
        Ok(c * (1.0 + self.rng.jitter(self.config.relative_noise)))
    }

    async fn read_resistance(&self) -> Result<f64> {
        self.check("read_resistance")?;
        self.latency().await;
        let f = *self.frequency.read().await;
        Ok(self.config.resistance_at_1khz * 1_000.0 / f)
    }
}
