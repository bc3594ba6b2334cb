//! Current range escalation.
//!
//! A reading above Imax is ambiguous: the ammeter may simply be pegged on a
//! range that is too low, or the device really draws that much. The
//! controller tracks the present range as a log10-of-amps exponent and the
//! ceiling implied by Imax, `floor(log10(Imax))`. Below the ceiling the
//! reading is treated as a range artifact and the range goes up one decade;
//! at or above it the reading is a genuine overcurrent.

use probe_core::{SweepError, VoltageSource};
use tracing::{info, warn};

/// Range exponent implied by a current limit.
pub fn ceiling_for(imax: f64) -> i32 {
    // Nudge so exact decades such as 1e-6 are not floored one decade low.
    (imax.log10() + 1e-9).floor() as i32
}

/// Tracks and raises the current range of one instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentRangeController {
    range: i32,
    ceiling: i32,
    escalations: u32,
}

impl CurrentRangeController {
    /// Start at 1e`initial_range` A. The ceiling follows from `imax`.
    pub fn new(initial_range: i32, imax: f64) -> Self {
        Self {
            range: initial_range,
            ceiling: ceiling_for(imax),
            escalations: 0,
        }
    }

    /// Present range exponent.
    pub fn range(&self) -> i32 {
        self.range
    }

    /// Highest range exponent allowed.
    pub fn ceiling(&self) -> i32 {
        self.ceiling
    }

    /// Escalations so far.
    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    /// Program the present range into `source`.
    pub async fn apply(&self, source: &dyn VoltageSource) -> Result<(), SweepError> {
        source
            .set_current_range(10f64.powi(self.range))
            .await
            .map_err(|e| SweepError::transport(source.name(), e))?;
        info!(instrument = source.name(), range = self.range, ceiling = self.ceiling, "Current range set");
        Ok(())
    }

    /// Move one decade up in response to `current` exceeding `imax`.
    ///
    /// Returns the new range exponent, or `CurrentRangeCeilingReached` when
    /// the range is already at the ceiling.
    pub async fn escalate(
        &mut self,
        source: &dyn VoltageSource,
        current: f64,
        imax: f64,
    ) -> Result<i32, SweepError> {
        if self.range >= self.ceiling {
            warn!(
                instrument = source.name(),
                current,
                range = self.range,
                "Overcurrent at range ceiling"
            );
            return Err(SweepError::CurrentRangeCeilingReached {
                current,
                imax,
                range: self.range,
                ceiling: self.ceiling,
            });
        }
        let next = self.range + 1;
        source
            .set_current_range(10f64.powi(next))
            .await
            .map_err(|e| SweepError::transport(source.name(), e))?;
        self.range = next;
        self.escalations += 1;
        info!(instrument = source.name(), current, range = next, "Current range escalated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_driver_mock::MockSourceMeter;

    #[test]
    fn ceiling_of_exact_and_inexact_limits() {
        assert_eq!(ceiling_for(1e-6), -6);
        assert_eq!(ceiling_for(5e-5), -5);
        assert_eq!(ceiling_for(1e-3), -3);
        assert_eq!(ceiling_for(2.5e-7), -7);
    }

    #[tokio::test]
    async fn escalates_until_ceiling() {
        let smu = MockSourceMeter::new("am");
        let mut range = CurrentRangeController::new(-8, 1e-6);

        assert_eq!(range.escalate(&smu, 2e-6, 1e-6).await.unwrap(), -7);
        assert_eq!(smu.range_exponent().await, Some(-7));
        assert_eq!(range.escalate(&smu, 2e-6, 1e-6).await.unwrap(), -6);

        let err = range.escalate(&smu, 2e-6, 1e-6).await.unwrap_err();
        assert!(matches!(
            err,
            SweepError::CurrentRangeCeilingReached { range: -6, ceiling: -6, .. }
        ));
        assert_eq!(range.escalations(), 2);
        assert_eq!(smu.range_exponent().await, Some(-6));
    }

    #[tokio::test]
    async fn range_above_ceiling_is_refused() {
        let smu = MockSourceMeter::new("am");
        let mut range = CurrentRangeController::new(-4, 1e-6);
        assert!(range.escalate(&smu, 1e-3, 1e-6).await.is_err());
        assert_eq!(smu.range_exponent().await, None);
    }
}
