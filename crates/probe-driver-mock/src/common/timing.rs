//! Command latencies for realistic mode.

use std::time::Duration;

/// Latencies applied by simulated instruments outside instant mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Time for the instrument to accept a set command, in milliseconds.
    pub command_delay_ms: u64,
    /// Time for one read-back (integration plus transfer), in milliseconds.
    pub read_delay_ms: u64,
}

impl TimingConfig {
    /// High-voltage supply on a serial link (Keithley 2410 class).
    pub fn high_voltage_supply() -> Self {
        Self {
            command_delay_ms: 5,
            read_delay_ms: 40,
        }
    }

    /// Source-measure unit or picoammeter on GPIB (Keithley 6487 class).
    pub fn source_measure_unit() -> Self {
        Self {
            command_delay_ms: 3,
            read_delay_ms: 60,
        }
    }

    /// Benchtop LCR meter.
    pub fn lcr_meter() -> Self {
        Self {
            command_delay_ms: 10,
            read_delay_ms: 100,
        }
    }

    /// Delay of a write command.
    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    /// Delay of a query.
    pub fn read_delay(&self) -> Duration {
        Duration::from_millis(self.read_delay_ms)
    }
}
