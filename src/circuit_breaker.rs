use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::metrics;

/// Process-wide kill switch consulted by the risk gate.
///
/// While tripped, every intent that is not reduce-only is denied. Clones
/// share state.
#[derive(Clone, Debug, Default)]
pub struct GlobalHalt {
    is_halted: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl GlobalHalt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_halted(&self) -> bool {
        self.is_halted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    pub fn set_halt(&self, active: bool, reason: &str) {
        let prev = self.is_halted.swap(active, Ordering::SeqCst);
        if prev == active {
            return;
        }
        metrics::set_halted(active);
        if active {
            *self.reason.write() = Some(reason.to_string());
            warn!("🚨 TRADING HALT ACTIVATED: {}", reason);
        } else {
            *self.reason.write() = None;
            info!("✅ TRADING HALT LIFTED: {}", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_logic() {
        let breaker = GlobalHalt::new();
        assert!(!breaker.is_halted(), "Should default to false");

        breaker.set_halt(true, "drawdown");
        assert!(breaker.is_halted());
        assert_eq!(breaker.reason().as_deref(), Some("drawdown"));

        breaker.set_halt(false, "manual resume");
        assert!(!breaker.is_halted());
        assert!(breaker.reason().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let breaker = GlobalHalt::new();
        let other = breaker.clone();
        other.set_halt(true, "ops");
        assert!(breaker.is_halted());
    }
}
