//! Simulated instruments for probe-station sweeps
//!
//! This crate provides stand-ins for the bench instruments so sweeps can be
//! rehearsed and tested without hardware. All simulated instruments use
//! async-safe waits (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Simulated Instruments
//!
//! - [`MockSourceMeter`] - Voltage source with current read-back, scripted
//!   compliance, read-back gain and range-dependent saturation
//! - [`MockLcrMeter`] - LCR meter with a depletion-style C(V) curve
//!
//! # Modes
//!
//! - Instant: no latency, for unit tests
//! - Realistic: bench-like command and read latency
//! - Chaos: latency plus random command failures

pub mod common;
mod mock_lcr;
mod mock_smu;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use mock_lcr::{MockLcrMeter, MockLcrMeterConfig};
pub use mock_smu::{MockSourceMeter, MockSourceMeterConfig, OverrangeConfig};
