//! Shared fixtures for the integration tests: an adapter with scripted order
//! replies, scripted strategies and an in-memory event sink.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use nexus_trader::circuit_breaker::GlobalHalt;
use nexus_trader::config::EngineConfig;
use nexus_trader::context::ExecutionContext;
use nexus_trader::engine::{BotState, EngineServices};
use nexus_trader::events::{EngineEvent, EventSink};
use nexus_trader::exchange::adapter::{ExchangeError, ExchangeResult};
use nexus_trader::exchange::{ExchangeAdapter, ExchangeRegistry, MarketStream, PaperAdapter};
use nexus_trader::market_data::{AggregatedView, AggregatorConfig, MarketDataAggregator};
use nexus_trader::model::{
    Balance, Candle, ConnectionHealth, ExchangeOrder, Interval, OrderBookSnapshot, OrderIntent,
    OrderRequest, OrderStatus, PositionRisk, Symbol, TickerSnapshot, TradeEvent, TradingFees,
    UserDataEvent,
};
use nexus_trader::risk::{RiskGate, RiskLimits};
use nexus_trader::strategy::{Strategy, StrategyError, StrategyResult};

/// Scripted reply for one `place_order` call. Once the script runs out the
/// adapter accepts every order.
#[derive(Debug, Clone)]
pub enum Reply {
    Fail(ExchangeError),
    Accept,
    Hang,
}

/// Market data and account calls go to an inner paper venue; orders follow
/// the script.
pub struct ScriptedAdapter {
    paper: PaperAdapter,
    script: Mutex<VecDeque<Reply>>,
    calls: AtomicU32,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stall_subscriptions: AtomicBool,
}

impl ScriptedAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            paper: PaperAdapter::new(name),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            stall_subscriptions: AtomicBool::new(false),
        }
    }

    /// While set, ticker subscriptions never complete.
    pub fn stall_subscriptions(&self, stall: bool) {
        self.stall_subscriptions.store(stall, Ordering::SeqCst);
    }

    pub fn script(&self, replies: Vec<Reply>) {
        self.script.lock().extend(replies);
    }

    /// Every accepted order takes this long to acknowledge.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn paper(&self) -> &PaperAdapter {
        &self.paper
    }

    fn ack(&self, request: &OrderRequest, n: u32) -> ExchangeOrder {
        let now = Utc::now();
        ExchangeOrder {
            exchange: self.paper.name().to_string(),
            order_id: format!("{}-{}", self.paper.name(), n),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: OrderStatus::New,
            quantity: request.quantity,
            price: request.price,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            commission: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl ExchangeAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        self.paper.name()
    }

    async fn connect(&self) -> ExchangeResult<()> {
        self.paper.connect().await
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.paper.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.paper.is_connected()
    }

    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<TickerSnapshot> {
        self.paper.ticker(symbol).await
    }

    async fn order_book(&self, symbol: &Symbol, depth: usize) -> ExchangeResult<OrderBookSnapshot> {
        self.paper.order_book(symbol, depth).await
    }

    async fn recent_trades(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<TradeEvent>> {
        self.paper.recent_trades(symbol, limit).await
    }

    async fn candles(&self, symbol: &Symbol, interval: Interval, limit: usize) -> ExchangeResult<Vec<Candle>> {
        self.paper.candles(symbol, interval, limit).await
    }

    async fn subscribe_ticker(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TickerSnapshot>> {
        if self.stall_subscriptions.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.paper.subscribe_ticker(symbol).await
    }

    async fn subscribe_order_book(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<OrderBookSnapshot>> {
        self.paper.subscribe_order_book(symbol).await
    }

    async fn subscribe_trades(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TradeEvent>> {
        self.paper.subscribe_trades(symbol).await
    }

    async fn subscribe_user_data(&self) -> ExchangeResult<MarketStream<UserDataEvent>> {
        self.paper.subscribe_user_data().await
    }

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let reply = self.script.lock().pop_front().unwrap_or(Reply::Accept);
        match reply {
            Reply::Fail(e) => Err(e),
            Reply::Hang => futures::future::pending().await,
            Reply::Accept => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                let delay = *self.delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(self.ack(&request, n))
            }
        }
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.paper.cancel_order(symbol, order_id).await
    }

    async fn cancel_all_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.paper.cancel_all_orders(symbol).await
    }

    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.paper.get_order(symbol, order_id).await
    }

    async fn open_orders(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.paper.open_orders(symbol).await
    }

    async fn order_history(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.paper.order_history(symbol, limit).await
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        self.paper.balances().await
    }

    async fn trading_fees(&self, symbol: &Symbol) -> ExchangeResult<TradingFees> {
        self.paper.trading_fees(symbol).await
    }

    async fn position_risk(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<PositionRisk>> {
        self.paper.position_risk(symbol).await
    }

    fn health(&self) -> ConnectionHealth {
        self.paper.health()
    }
}

/// Emits the same intents on every evaluation, or only on the first when
/// `once` is set.
pub struct FixedIntents {
    pub name: String,
    pub intents: Vec<OrderIntent>,
    pub once: bool,
    pub evaluations: AtomicU32,
}

impl FixedIntents {
    pub fn new(name: &str, intents: Vec<OrderIntent>) -> Self {
        Self {
            name: name.to_string(),
            intents,
            once: false,
            evaluations: AtomicU32::new(0),
        }
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn evaluations(&self) -> u32 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

impl Strategy for FixedIntents {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, _view: &AggregatedView, _bot: &BotState) -> StrategyResult<Vec<OrderIntent>> {
        let n = self.evaluations.fetch_add(1, Ordering::SeqCst);
        if self.once && n > 0 {
            return Ok(Vec::new());
        }
        Ok(self.intents.clone())
    }
}

/// Fails every evaluation.
pub struct AlwaysFails {
    pub evaluations: AtomicU32,
}

impl AlwaysFails {
    pub fn new() -> Self {
        Self {
            evaluations: AtomicU32::new(0),
        }
    }

    pub fn evaluations(&self) -> u32 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

impl Strategy for AlwaysFails {
    fn name(&self) -> &str {
        "always-fails"
    }

    fn evaluate(&self, _view: &AggregatedView, _bot: &BotState) -> StrategyResult<Vec<OrderIntent>> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Err(StrategyError::Other("model diverged".into()))
    }
}

/// Keeps every emitted event for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Short intervals so scheduling tests finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_bots: 4,
        execution_interval_ms: 20,
        order_timeout_ms: 1_000,
        retry_attempts: 3,
        retry_base_delay_ms: 1,
        performance_update_interval_ms: 60_000,
        health_check_interval_ms: 60_000,
        max_consecutive_failures: 5,
        freshness_window_ms: 5_000,
        subscriber_capacity: 64,
        connect_timeout_ms: 1_000,
    }
}

/// Limits that accept a limit order without any market data.
pub fn permissive_limits() -> RiskLimits {
    RiskLimits {
        reject_stale_views: false,
        ..RiskLimits::default()
    }
}

pub async fn connected_venue(registry: &ExchangeRegistry, name: &str) -> Arc<ScriptedAdapter> {
    let adapter = Arc::new(ScriptedAdapter::new(name));
    adapter.connect().await.expect("connect scripted venue");
    registry.register(name, adapter.clone()).expect("register scripted venue");
    adapter
}

pub fn services(
    registry: Arc<ExchangeRegistry>,
    limits: RiskLimits,
    sink: Arc<RecordingSink>,
) -> EngineServices {
    EngineServices {
        aggregator: Arc::new(MarketDataAggregator::new(
            registry.clone(),
            AggregatorConfig::default(),
        )),
        registry,
        risk: Arc::new(RiskGate::new(limits, GlobalHalt::new())),
        sink,
        context: ExecutionContext::new_system(),
    }
}

pub fn ticker(bid: Decimal, bid_qty: Decimal, ask: Decimal, ask_qty: Decimal) -> TickerSnapshot {
    TickerSnapshot {
        exchange: String::new(),
        symbol: Symbol::new("BTCUSDT"),
        bid_price: bid,
        bid_qty,
        ask_price: ask,
        ask_qty,
        last_price: bid,
        volume_24h: Decimal::ZERO,
        change_24h_pct: Decimal::ZERO,
        timestamp: Utc::now(),
    }
}

/// Poll `check` every few milliseconds until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
