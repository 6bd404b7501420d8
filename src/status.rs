use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::engine::bot::BotState;
use crate::model::{ConnectionHealth, Symbol};
use crate::risk::SymbolExposure;

/// Operator-facing health, reporting exchanges and bots separately so
/// partial degradation is visible.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub exchanges: BTreeMap<String, ConnectionHealth>,
    pub bots: Vec<BotState>,
    pub aggregated_symbols: Vec<Symbol>,
    pub dropped_views: u64,
    pub open_orders: usize,
    pub exposures: Vec<SymbolExposure>,
    pub generated_at: DateTime<Utc>,
}

impl SystemStatus {
    pub fn disconnected_exchanges(&self) -> Vec<&str> {
        self.exchanges
            .values()
            .filter(|h| !h.connected)
            .map(|h| h.exchange.as_str())
            .collect()
    }

    pub fn paused_bots(&self) -> Vec<&str> {
        self.bots
            .iter()
            .filter(|b| !b.running)
            .map(|b| b.id.as_str())
            .collect()
    }

    /// Every exchange connected and every bot running.
    pub fn is_healthy(&self) -> bool {
        !self.halted && self.disconnected_exchanges().is_empty() && self.paused_bots().is_empty()
    }
}
