//! # Probe Station
//!
//! Operator application for IV/CV sensor characterization. The sweep
//! engine lives in the `probe-*` workspace crates; this crate adds:
//!
//! - [`config`]: Figment-backed configuration (defaults, TOML, environment)
//! - [`tracing_init`]: subscriber setup
//! - [`station`]: simulated bench and sink wiring for one sweep run

pub mod config;
pub mod station;
pub mod tracing_init;

pub use config::{ConfigError, StationConfig, SweepOverrides};
pub use station::{SimulatedBench, SweepSession};
