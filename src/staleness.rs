use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::model::Symbol;

/// Last-update instants per (exchange, symbol), used to decide whether an
/// aggregated view is still fresh.
#[derive(Debug, Clone, Default)]
pub struct StalenessMonitor {
    last_updates: Arc<RwLock<HashMap<(String, Symbol), Instant>>>,
}

impl StalenessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, exchange: &str, symbol: &Symbol) {
        self.last_updates
            .write()
            .insert((exchange.to_string(), symbol.clone()), Instant::now());
    }

    pub fn age(&self, exchange: &str, symbol: &Symbol) -> Option<Duration> {
        self.last_updates
            .read()
            .get(&(exchange.to_string(), symbol.clone()))
            .map(Instant::elapsed)
    }

    /// No data yet counts as stale.
    pub fn is_stale(&self, exchange: &str, symbol: &Symbol, window: Duration) -> bool {
        self.age(exchange, symbol).is_none_or(|age| age > window)
    }

    /// A symbol is stale only when every exchange reporting it is.
    pub fn symbol_is_stale(&self, symbol: &Symbol, window: Duration) -> bool {
        !self
            .last_updates
            .read()
            .iter()
            .any(|((_, s), at)| s == symbol && at.elapsed() <= window)
    }

    pub fn forget_symbol(&self, symbol: &Symbol) {
        self.last_updates.write().retain(|(_, s), _| s != symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_is_stale() {
        let monitor = StalenessMonitor::new();
        let symbol = Symbol::new("BTCUSDT");
        assert!(monitor.is_stale("binance", &symbol, Duration::from_secs(5)));
        assert!(monitor.symbol_is_stale(&symbol, Duration::from_secs(5)));
    }

    #[test]
    fn test_fresh_then_stale() {
        let monitor = StalenessMonitor::new();
        let symbol = Symbol::new("BTCUSDT");
        monitor.update("binance", &symbol);
        assert!(!monitor.is_stale("binance", &symbol, Duration::from_secs(5)));
        assert!(!monitor.symbol_is_stale(&symbol, Duration::from_secs(5)));

        std::thread::sleep(Duration::from_millis(20));
        assert!(monitor.is_stale("binance", &symbol, Duration::from_millis(10)));
        assert!(monitor.is_stale("bybit", &symbol, Duration::from_secs(5)));
    }

    #[test]
    fn test_forget_symbol() {
        let monitor = StalenessMonitor::new();
        let symbol = Symbol::new("ETHUSDT");
        monitor.update("bybit", &symbol);
        monitor.forget_symbol(&symbol);
        assert!(monitor.age("bybit", &symbol).is_none());
    }
}
