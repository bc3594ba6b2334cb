//! Instrument capabilities consumed by the sweep engine.
//!
//! The engine never opens, configures or closes an instrument. It only
//! commands instruments through the two capability traits below, which the
//! transport drivers (and the simulated instruments) implement:
//!
//! - [`VoltageSource`]: a high-voltage supply or source-measure unit that
//!   applies a bias and reads back voltage and current.
//! - [`LcrMeter`]: an impedance meter read at a chosen AC test frequency.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Takes `&self` so handles can be shared as `Arc<dyn VoltageSource>`
//!
//! Drivers should put a [`DriverError`](crate::error::DriverError) into the
//! returned `anyhow::Error` so the engine can keep the failure kind.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// On/off state of a source output or of the read-back averaging filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    /// Enabled.
    On,
    /// Disabled.
    Off,
}

impl std::fmt::Display for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Switch::On => write!(f, "on"),
            Switch::Off => write!(f, "off"),
        }
    }
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on {
            Switch::On
        } else {
            Switch::Off
        }
    }
}

/// Capability: VoltageSource (bias supply with current read-back)
///
/// # Contract
/// - `set_voltage()` commands a new output level and returns once the
///   instrument accepted it. It does not wait for settling.
/// - `read_voltage_and_current()` returns one `(volts, amps)` pair.
/// - `in_compliance()` reports the instrument's compliance flag at this
///   instant. A single `true` may be a settling artifact.
/// - `control_source()` enables or disables the output stage.
#[async_trait]
pub trait VoltageSource: Send + Sync {
    /// Identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Command the output voltage.
    async fn set_voltage(&self, volts: f64) -> Result<()>;

    /// Read the present output voltage and measured current.
    async fn read_voltage_and_current(&self) -> Result<(f64, f64)>;

    /// Query the compliance flag once.
    async fn in_compliance(&self) -> Result<bool>;

    /// Poll the compliance flag up to `attempts` times and report whether any
    /// poll was set.
    async fn hit_compliance(&self, attempts: u32) -> Result<bool> {
        for _ in 0..attempts {
            if self.in_compliance().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Set the current measurement range, given as the full-scale current in
    /// amps.
    ///
    /// # Default Implementation
    /// Returns an error indicating manual ranging is not supported.
    async fn set_current_range(&self, amps: f64) -> Result<()> {
        anyhow::bail!(
            "Current range {} A not supported by '{}' (auto-ranging only)",
            amps,
            self.name()
        )
    }

    /// Enable or disable read-back averaging.
    ///
    /// # Default Implementation
    /// Instruments without a filter accept and ignore the request.
    async fn control_average(&self, _state: Switch) -> Result<()> {
        Ok(())
    }

    /// Enable or disable the output stage.
    async fn control_source(&self, state: Switch) -> Result<()>;
}

/// Capability: LcrMeter (capacitance and resistance at a test frequency)
#[async_trait]
pub trait LcrMeter: Send + Sync {
    /// Identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Set the AC test frequency in hertz.
    async fn set_frequency(&self, hz: f64) -> Result<()>;

    /// Read capacitance in farads.
    async fn read_capacitance(&self) -> Result<f64>;

    /// Read resistance in ohms.
    async fn read_resistance(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySource {
        polls: AtomicU32,
        trip_on: u32,
    }

    #[async_trait]
    impl VoltageSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn set_voltage(&self, _volts: f64) -> Result<()> {
            Ok(())
        }
        async fn read_voltage_and_current(&self) -> Result<(f64, f64)> {
            Ok((0.0, 0.0))
        }
        async fn in_compliance(&self) -> Result<bool> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n == self.trip_on)
        }
        async fn control_source(&self, _state: Switch) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn hit_compliance_polls_until_set() -> Result<()> {
        let source = FlakySource {
            polls: AtomicU32::new(0),
            trip_on: 3,
        };
        assert!(source.hit_compliance(3).await?);
        assert_eq!(source.polls.load(Ordering::SeqCst), 3);

        let quiet = FlakySource {
            polls: AtomicU32::new(0),
            trip_on: 10,
        };
        assert!(!quiet.hit_compliance(2).await?);
        Ok(())
    }

    #[tokio::test]
    async fn manual_range_unsupported_by_default() {
        let source = FlakySource {
            polls: AtomicU32::new(0),
            trip_on: 0,
        };
        assert!(source.set_current_range(1e-6).await.is_err());
        assert!(source.control_average(Switch::On).await.is_ok());
    }
}
