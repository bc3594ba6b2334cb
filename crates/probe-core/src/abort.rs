//! Cooperative cancellation for a running sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable operator-cancel flag.
///
/// The engine polls it between discrete steps, never mid-command.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    requested: Arc<AtomicBool>,
}

impl AbortSignal {
    /// Unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Whether `trigger` has been called on any clone.
    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let signal = AbortSignal::new();
        let remote = signal.clone();
        assert!(!signal.is_triggered());
        remote.trigger();
        assert!(signal.is_triggered());
    }
}
