//! Operational modes for simulated instruments.
//!
//! - **Instant**: no command latency, deterministic readings
//! - **Realistic**: instrument-like command latency
//! - **Chaos**: realistic latency plus random command failures

use serde::{Deserialize, Serialize};

/// Operational modes for simulated instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Instrument-like timing - for bench rehearsals
    Realistic,
    /// Random failures - for teardown resilience testing
    Chaos,
}

impl MockMode {
    /// Whether commands should sleep for the configured latency.
    pub fn has_latency(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}
