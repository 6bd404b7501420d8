//! Strategy seam: an opaque function from market data to order intents.
//!
//! Strategies never reach exchanges; the engine owns risk checks and
//! submission.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::engine::bot::BotState;
use crate::market_data::view::AggregatedView;
use crate::model::OrderIntent;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StrategyError {
    /// Raised when required inputs are missing (e.g., no quotes yet).
    #[error("strategy not ready: {0}")]
    NotReady(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unknown strategy '{0}'")]
    Unknown(String),
    #[error("strategy failed: {0}")]
    Other(String),
}

pub type StrategyResult<T> = Result<T, StrategyError>;

pub trait Strategy: Send + Sync {
    /// Identifier used in logs and configuration.
    fn name(&self) -> &str;

    /// Called once per bot execution for each of the bot's symbols.
    fn evaluate(&self, view: &AggregatedView, bot: &BotState) -> StrategyResult<Vec<OrderIntent>>;
}

/// Logs what it sees and never trades.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObserveStrategy;

impl Strategy for ObserveStrategy {
    fn name(&self) -> &str {
        "observe"
    }

    fn evaluate(&self, view: &AggregatedView, bot: &BotState) -> StrategyResult<Vec<OrderIntent>> {
        debug!(
            bot_id = %bot.id,
            symbol = %view.symbol,
            bid = ?view.best_bid.as_ref().map(|q| q.price),
            ask = ?view.best_ask.as_ref().map(|q| q.price),
            stale = view.stale,
            "👀 Observed market"
        );
        Ok(Vec::new())
    }
}

/// Maps configured strategy names to implementations.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ObserveStrategy));
        registry
    }

    /// Registers under `strategy.name()`, replacing any previous entry.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies
            .insert(strategy.name().to_lowercase(), strategy);
    }

    pub fn get(&self, name: &str) -> StrategyResult<Arc<dyn Strategy>> {
        self.strategies
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| StrategyError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::model::Symbol;

    #[test]
    fn test_observe_never_trades() {
        let bot = BotState::from_config(&BotConfig::new("b", "observe", vec![Symbol::new("BTCUSDT")]));
        let view = AggregatedView::empty(Symbol::new("BTCUSDT"));
        assert!(ObserveStrategy.evaluate(&view, &bot).unwrap().is_empty());
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let registry = StrategyRegistry::with_defaults();
        assert!(registry.get("Observe").is_ok());
        assert_eq!(
            registry.get("grid").err(),
            Some(StrategyError::Unknown("grid".into()))
        );
        assert_eq!(registry.names(), vec!["observe".to_string()]);
    }
}
