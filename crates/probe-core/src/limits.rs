//! Shared safety limits and pacing defaults for sweeps.
//!
//! This module centralizes:
//! - Tolerances used to validate instrument read-back and sweep size
//! - Compliance retry limits
//! - Ramp step sizes and settle times for both source classes
//!
//! Every value here is a default; `SweepSpec` and the ramp settings carry
//! the effective numbers for one sweep.

use std::time::Duration;

// =============================================================================
// Validation
// =============================================================================

/// Maximum allowed difference between commanded and read-back voltage (10 mV).
pub const VOLTAGE_TOLERANCE: f64 = 0.01;

/// Most target voltages one sweep may expand to.
pub const MAX_TARGETS: usize = 100_000;

// =============================================================================
// Compliance
// =============================================================================

/// Consecutive compliance hits after which a sweep is aborted.
pub const COMPLIANCE_CHECK_MAX: u32 = 5;

/// Back-off between two compliance checks while the instrument reports a hit.
pub const COMPLIANCE_BACKOFF: Duration = Duration::from_secs(1);

/// Volts of ramp travel between compliance checks on a high-voltage source.
pub const COMPLIANCE_CHECK_INTERVAL: f64 = 2.5;

/// Volts of ramp travel between compliance checks on a low-voltage
/// source-measure unit driven as the measurement side of a dual sweep.
pub const SMU_COMPLIANCE_CHECK_INTERVAL: f64 = 0.5;

/// Number of `hitCompliance` polls per query during ramp-down checks.
pub const HIT_COMPLIANCE_ATTEMPTS: u32 = 3;

// =============================================================================
// Ramping
// =============================================================================

/// Smallest ramp increment magnitude; larger requests are honoured, smaller
/// ones are raised to this.
pub const MIN_RAMP_STEP: f64 = 0.1;

/// Descending step magnitude used when returning a source to 0 V.
pub const RAMP_DOWN_STEP: f64 = 0.5;

/// Distance from 0 V inside which ramp-down switches to [`MIN_RAMP_STEP`].
pub const RAMP_DOWN_FINE_WINDOW: f64 = 1.0;

/// Wait before the first descending step of a ramp-down.
pub const RAMP_DOWN_PRE_WAIT: Duration = Duration::from_secs(5);

/// Settle time after each ramp step on a high-voltage source.
pub const RAMP_SETTLE: Duration = Duration::from_millis(20);

/// Settle time after each ramp step on a source-measure unit.
pub const SMU_RAMP_SETTLE: Duration = Duration::from_millis(200);

/// Wait after changing the LCR test frequency before reading.
pub const LCR_SETTLE: Duration = Duration::from_millis(500);

/// Float slack used when comparing accumulated ramp travel against a
/// check interval.
pub const TRAVEL_EPSILON: f64 = 1e-9;

/// Whether two voltages are equal within [`VOLTAGE_TOLERANCE`].
#[inline]
pub fn within_tolerance(expected: f64, measured: f64) -> bool {
    (expected - measured).abs() <= VOLTAGE_TOLERANCE
}
