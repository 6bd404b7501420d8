use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::model::Symbol;

/// Static limits applied by the risk gate. Notional values are in quote
/// currency, sizes in base units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Maximum absolute net position per symbol, including open commitments.
    pub max_position_size: Decimal,

    /// Maximum notional of a single order.
    pub max_order_notional: Decimal,

    /// Maximum absolute notional exposure per symbol.
    pub max_exposure_per_symbol: Decimal,

    pub max_leverage: Decimal,

    /// Limit prices further than this from the aggregated mid are denied.
    pub max_price_deviation_bps: u32,

    /// Empty means every symbol is tradable.
    pub allowed_symbols: Vec<Symbol>,

    /// A bot at or above this many consecutive failures may only reduce.
    pub max_bot_failures: u32,

    /// Deny opening orders against a stale aggregated view.
    pub reject_stale_views: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: dec!(10),
            max_order_notional: dec!(100000),
            max_exposure_per_symbol: dec!(250000),
            max_leverage: dec!(5),
            max_price_deviation_bps: 500,
            allowed_symbols: Vec::new(),
            max_bot_failures: 3,
            reject_stale_views: true,
        }
    }
}

impl RiskLimits {
    /// Limits that deny everything, for kill-switch style tests and drills.
    pub fn strict() -> Self {
        Self {
            max_position_size: Decimal::ZERO,
            max_order_notional: Decimal::ZERO,
            max_exposure_per_symbol: Decimal::ZERO,
            max_leverage: Decimal::ZERO,
            max_price_deviation_bps: 0,
            allowed_symbols: Vec::new(),
            max_bot_failures: 0,
            reject_stale_views: true,
        }
    }

    pub fn is_allowed(&self, symbol: &Symbol) -> bool {
        self.allowed_symbols.is_empty() || self.allowed_symbols.contains(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_whitelist_allows_all() {
        let limits = RiskLimits::default();
        assert!(limits.is_allowed(&Symbol::new("DOGEUSDT")));
    }

    #[test]
    fn test_whitelist() {
        let limits = RiskLimits {
            allowed_symbols: vec![Symbol::new("BTC/USDT")],
            ..RiskLimits::default()
        };
        assert!(limits.is_allowed(&Symbol::new("BTCUSDT")));
        assert!(!limits.is_allowed(&Symbol::new("ETHUSDT")));
    }
}
