use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::BotConfig;
use crate::model::Symbol;
use crate::strategy::Strategy;

/// Running tally of a bot's executions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotPerformance {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    /// Executions cut off by shutdown; not counted as failures.
    pub abandoned: u64,
    pub orders_submitted: u64,
    pub orders_denied: u64,
    pub last_execution_latency_ms: Option<u64>,
}

/// Snapshot of one bot instance, as handed to strategies and status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub id: String,
    pub strategy: String,
    pub symbols: Vec<Symbol>,
    pub exchanges: Vec<String>,
    pub params: serde_json::Value,
    pub running: bool,
    pub paused_reason: Option<String>,
    pub last_execution: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub performance: BotPerformance,
}

impl BotState {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            id: config.id.clone(),
            strategy: config.strategy.clone(),
            symbols: config.symbols.clone(),
            exchanges: config.exchanges.iter().map(|e| e.to_lowercase()).collect(),
            params: config.params.clone(),
            running: config.enabled,
            paused_reason: (!config.enabled).then(|| "disabled in configuration".to_string()),
            last_execution: None,
            consecutive_failures: 0,
            performance: BotPerformance::default(),
        }
    }

    /// Venue for intents that do not name one.
    pub fn default_exchange(&self) -> Option<&str> {
        self.exchanges.first().map(String::as_str)
    }
}

/// Counts from one execution, folded into the performance record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionTally {
    pub submitted: u64,
    pub denied: u64,
}

/// Engine-side bot instance: immutable wiring plus the mutable state behind
/// a short lock.
pub(crate) struct Bot {
    pub(crate) id: String,
    pub(crate) strategy: Arc<dyn Strategy>,
    state: Mutex<BotState>,
    in_flight: AtomicBool,
}

impl Bot {
    pub(crate) fn new(config: &BotConfig, strategy: Arc<dyn Strategy>) -> Self {
        Self {
            id: config.id.clone(),
            strategy,
            state: Mutex::new(BotState::from_config(config)),
            in_flight: AtomicBool::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> BotState {
        self.state.lock().clone()
    }

    pub(crate) fn symbols(&self) -> Vec<Symbol> {
        self.state.lock().symbols.clone()
    }

    pub(crate) fn exchanges(&self) -> Vec<String> {
        self.state.lock().exchanges.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim the bot for one execution. False when it is already queued or
    /// executing.
    pub(crate) fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    pub(crate) fn record_success(&self, latency: Duration, tally: ExecutionTally, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.last_execution = Some(at);
        let perf = &mut state.performance;
        perf.executions += 1;
        perf.successes += 1;
        perf.orders_submitted += tally.submitted;
        perf.orders_denied += tally.denied;
        perf.last_execution_latency_ms = Some(latency.as_millis() as u64);
    }

    /// Returns the consecutive failure count after this one.
    pub(crate) fn record_failure(&self, latency: Duration, tally: ExecutionTally, at: DateTime<Utc>) -> u32 {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_execution = Some(at);
        let perf = &mut state.performance;
        perf.executions += 1;
        perf.failures += 1;
        perf.orders_submitted += tally.submitted;
        perf.orders_denied += tally.denied;
        perf.last_execution_latency_ms = Some(latency.as_millis() as u64);
        state.consecutive_failures
    }

    pub(crate) fn record_abandoned(&self) {
        self.state.lock().performance.abandoned += 1;
    }

    /// Returns false when the bot was already paused.
    pub(crate) fn pause(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if !state.running {
            return false;
        }
        state.running = false;
        state.paused_reason = Some(reason.into());
        true
    }

    /// Clears the failure streak. Returns false when already running.
    pub(crate) fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            return false;
        }
        state.running = true;
        state.paused_reason = None;
        state.consecutive_failures = 0;
        true
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub(crate) fn performance(&self) -> BotPerformance {
        self.state.lock().performance.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ObserveStrategy;

    fn bot() -> Bot {
        let config = BotConfig::new("b1", "observe", vec![Symbol::new("BTCUSDT")]).on_exchanges(&["Binance"]);
        Bot::new(&config, Arc::new(ObserveStrategy))
    }

    #[test]
    fn test_state_from_config() {
        let state = bot().snapshot();
        assert!(state.running);
        assert_eq!(state.default_exchange(), Some("binance"));
        assert_eq!(state.performance, BotPerformance::default());
    }

    #[test]
    fn test_in_flight_claim() {
        let bot = bot();
        assert!(bot.try_begin());
        assert!(!bot.try_begin());
        bot.finish();
        assert!(bot.try_begin());
    }

    #[test]
    fn test_failure_streak_and_reset() {
        let bot = bot();
        let now = Utc::now();
        let tally = ExecutionTally::default();
        assert_eq!(bot.record_failure(Duration::from_millis(5), tally, now), 1);
        assert_eq!(bot.record_failure(Duration::from_millis(5), tally, now), 2);
        bot.record_success(Duration::from_millis(7), ExecutionTally { submitted: 2, denied: 1 }, now);

        let state = bot.snapshot();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.performance.executions, 3);
        assert_eq!(state.performance.failures, 2);
        assert_eq!(state.performance.orders_submitted, 2);
        assert_eq!(state.performance.last_execution_latency_ms, Some(7));
    }

    #[test]
    fn test_pause_resume() {
        let bot = bot();
        bot.record_failure(Duration::ZERO, ExecutionTally::default(), Utc::now());
        assert!(bot.pause("too many failures"));
        assert!(!bot.pause("again"));
        assert!(!bot.is_running());
        assert!(bot.resume());
        assert_eq!(bot.consecutive_failures(), 0);
        assert!(bot.snapshot().paused_reason.is_none());
    }

    #[test]
    fn test_disabled_bot_starts_paused() {
        let mut config = BotConfig::new("b2", "observe", vec![]);
        config.enabled = false;
        let state = BotState::from_config(&config);
        assert!(!state.running);
        assert!(state.paused_reason.is_some());
    }
}
