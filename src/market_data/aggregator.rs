//! Per-symbol fan-in of every registered adapter's streams.
//!
//! The first subscriber (or lease) for a symbol starts one task per
//! (exchange, stream kind). Tasks fold updates into the symbol's state and,
//! for tickers, republish the merged view to every subscriber with
//! `try_send`. The last unsubscribe stops and awaits those tasks.
//!
//! Each active symbol also runs a monitor that flags the view stale when
//! every exchange goes quiet, and stops aggregation once the last
//! subscription has been dropped without an explicit unsubscribe.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::exchange::ExchangeRegistry;
use crate::exchange::adapter::ExchangeResult;
use crate::exchange::stream::MarketStream;
use crate::market_data::book_store::BookStore;
use crate::market_data::heartbeat::HeartbeatMonitor;
use crate::market_data::view::AggregatedView;
use crate::metrics;
use crate::model::{OrderBookSnapshot, Symbol, TickerSnapshot, TradeEvent};
use crate::staleness::StalenessMonitor;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregatorError {
    #[error("Market data aggregator is stopped")]
    Stopped,
    #[error("No exchanges registered")]
    NoExchanges,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// A view is stale when no exchange reported the symbol within this window.
    pub freshness_window: Duration,
    pub subscriber_capacity: usize,
    /// Deadline for each adapter `subscribe_*` call.
    pub subscribe_timeout: Duration,
    pub trade_history: usize,
    pub book_depth: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(5),
            subscriber_capacity: 256,
            subscribe_timeout: Duration::from_secs(10),
            trade_history: 500,
            book_depth: 50,
        }
    }
}

impl From<&EngineConfig> for AggregatorConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            freshness_window: cfg.freshness_window(),
            subscriber_capacity: cfg.subscriber_capacity,
            subscribe_timeout: cfg.connect_timeout(),
            ..Self::default()
        }
    }
}

/// Receiving end of a symbol's aggregated views.
///
/// Hand it back to [`MarketDataAggregator::unsubscribe`] when done. Dropping
/// it works too; the symbol's monitor then stops aggregation in the
/// background if nobody else is interested. The channel yields `None` once
/// the aggregator stops.
#[derive(Debug)]
pub struct ViewSubscription {
    id: u64,
    symbol: Symbol,
    rx: mpsc::Receiver<AggregatedView>,
    dropped: Arc<AtomicU64>,
    idle: Arc<Notify>,
}

impl Drop for ViewSubscription {
    fn drop(&mut self) {
        // Close first so the monitor sees the sender as closed when it wakes.
        self.rx.close();
        self.idle.notify_one();
    }
}

impl ViewSubscription {
    pub async fn recv(&mut self) -> Option<AggregatedView> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AggregatedView> {
        self.rx.try_recv().ok()
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Views discarded because this subscriber's channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Keeps a symbol's aggregation running without a view channel; the holder
/// reads through [`MarketDataAggregator::view`].
#[derive(Debug)]
#[must_use = "release the lease to stop aggregation"]
pub struct SymbolLease {
    symbol: Symbol,
}

impl SymbolLease {
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<AggregatedView>,
    dropped: Arc<AtomicU64>,
}

struct SymbolData {
    tickers: BTreeMap<String, TickerSnapshot>,
    books: BookStore,
    trades: VecDeque<TradeEvent>,
    view: AggregatedView,
}

struct SymbolTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

type SymbolTable = DashMap<Symbol, Arc<SymbolState>>;

/// State the stream and monitor tasks need besides the symbol itself.
#[derive(Clone)]
struct Shared {
    staleness: StalenessMonitor,
    freshness_window: Duration,
    trade_history: usize,
    dropped: Arc<AtomicU64>,
    symbols: Arc<SymbolTable>,
    /// Serialises task start/stop across subscribe, unsubscribe and the
    /// monitors.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl Shared {
    fn is_current(&self, state: &Arc<SymbolState>) -> bool {
        self.symbols
            .get(&state.symbol)
            .is_some_and(|e| Arc::ptr_eq(e.value(), state))
    }

    /// Remove the symbol and stop its stream tasks. Callers hold `lifecycle`.
    async fn deactivate(&self, state: &Arc<SymbolState>) {
        if self.is_current(state) {
            self.symbols.remove(&state.symbol);
        }
        let tasks = state.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown.send_replace(true);
            join_all(tasks.handles).await;
        }
        self.staleness.forget_symbol(&state.symbol);
        info!(symbol = %state.symbol, "Aggregation stopped");
    }
}

struct SymbolState {
    symbol: Symbol,
    data: RwLock<SymbolData>,
    subscribers: RwLock<Vec<Subscriber>>,
    leases: AtomicUsize,
    tasks: Mutex<Option<SymbolTasks>>,
    /// Woken when a subscription is dropped or found closed.
    idle: Arc<Notify>,
}

impl SymbolState {
    fn new(symbol: Symbol) -> Self {
        Self {
            data: RwLock::new(SymbolData {
                tickers: BTreeMap::new(),
                books: BookStore::new(symbol.clone()),
                trades: VecDeque::new(),
                view: AggregatedView::empty(symbol.clone()),
            }),
            symbol,
            subscribers: RwLock::new(Vec::new()),
            leases: AtomicUsize::new(0),
            tasks: Mutex::new(None),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Forget subscribers whose receiving end is gone.
    fn prune_closed(&self) {
        self.subscribers.write().retain(|s| !s.tx.is_closed());
    }

    /// Re-evaluate freshness. On the fresh to stale transition the last view
    /// is republished with the flag set; returns true in that case.
    fn check_freshness(&self, shared: &Shared) -> bool {
        let mut data = self.data.write();
        let stale = shared
            .staleness
            .symbol_is_stale(&self.symbol, shared.freshness_window);
        let became_stale = stale && !data.view.stale && !data.tickers.is_empty();
        data.view.stale = stale;
        if became_stale {
            metrics::inc_stale_views();
            warn!(symbol = %self.symbol, window = ?shared.freshness_window, "⚠️ Aggregated view is stale");
            self.publish(data.view.clone(), shared);
        }
        became_stale
    }

    fn interest(&self) -> usize {
        self.subscribers.read().len() + self.leases.load(Ordering::SeqCst)
    }

    fn on_ticker(&self, ticker: TickerSnapshot, shared: &Shared) {
        if ticker.symbol != self.symbol {
            debug!(exchange = %ticker.exchange, got = %ticker.symbol, want = %self.symbol, "Ticker for another symbol, ignoring");
            return;
        }
        shared.staleness.update(&ticker.exchange, &self.symbol);

        // Publishing under the data lock keeps views ordered for subscribers;
        // try_send never waits.
        let mut data = self.data.write();
        data.tickers.insert(ticker.exchange.clone(), ticker);
        let view = AggregatedView::compute(
            self.symbol.clone(),
            data.tickers.clone(),
            data.view.last_trade.clone(),
            false,
        );
        data.view = view.clone();
        self.publish(view, shared);
    }

    fn on_book(&self, book: OrderBookSnapshot, shared: &Shared) {
        if book.symbol != self.symbol {
            return;
        }
        shared.staleness.update(&book.exchange, &self.symbol);
        self.data.write().books.apply(&book);
    }

    fn on_trade(&self, trade: TradeEvent, shared: &Shared) {
        if trade.symbol != self.symbol {
            return;
        }
        shared.staleness.update(&trade.exchange, &self.symbol);
        let mut data = self.data.write();
        if data.trades.len() >= shared.trade_history {
            data.trades.pop_front();
        }
        data.trades.push_back(trade.clone());
        data.view.last_trade = Some(trade);
    }

    fn publish(&self, view: AggregatedView, shared: &Shared) {
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                match sub.tx.try_send(view.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                        shared.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::inc_subscriber_drops();
                    }
                    Err(TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }
        if !closed.is_empty() {
            self.subscribers.write().retain(|s| !closed.contains(&s.id));
            self.idle.notify_one();
        }
        metrics::inc_view_publications();
    }
}

/// Counts a running stream task for `active_task_count`.
struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        metrics::inc_aggregation_tasks();
        Self(counter.clone())
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        metrics::dec_aggregation_tasks();
    }
}

fn spawn_stream<T, F>(
    mut stream: MarketStream<T>,
    mut shutdown: watch::Receiver<bool>,
    guard: TaskGuard,
    mut fold: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        let _guard = guard;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                update = stream.recv() => match update {
                    Some(update) => fold(update),
                    None => break,
                },
            }
        }
    })
}

/// Freshness checks on every `freshness_window` tick, plus cleanup when the
/// last subscription is dropped without `unsubscribe`. Not counted as a
/// stream task.
fn spawn_monitor(state: Arc<SymbolState>, shared: Shared, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let every = shared.freshness_window.max(Duration::from_millis(1));
        let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    state.check_freshness(&shared);
                }
                _ = state.idle.notified() => {
                    let _lifecycle = shared.lifecycle.lock().await;
                    state.prune_closed();
                    if state.interest() == 0 && shared.is_current(&state) {
                        debug!(symbol = %state.symbol, "Last view subscription dropped");
                        shared.deactivate(&state).await;
                        break;
                    }
                }
            }
        }
    });
}

pub struct MarketDataAggregator {
    registry: Arc<ExchangeRegistry>,
    config: AggregatorConfig,
    shared: Shared,
    active_tasks: Arc<AtomicUsize>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    closing: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataAggregator {
    pub fn new(registry: Arc<ExchangeRegistry>, config: AggregatorConfig) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            registry,
            shared: Shared {
                staleness: StalenessMonitor::new(),
                freshness_window: config.freshness_window,
                trade_history: config.trade_history.max(1),
                dropped: Arc::new(AtomicU64::new(0)),
                symbols: Arc::new(DashMap::new()),
                lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            },
            config,
            active_tasks: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            closing,
            heartbeat: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    /// Subscribe to merged views for `symbol`. The current view, if any
    /// exchange has already reported, is delivered first.
    pub async fn subscribe(&self, symbol: &Symbol) -> Result<ViewSubscription, AggregatorError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let state = self.activate(symbol).await?;

        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let current = {
            let data = state.data.read();
            (!data.tickers.is_empty()).then(|| data.view.clone())
        };
        if let Some(view) = current {
            let _ = tx.try_send(view);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        state.subscribers.write().push(Subscriber {
            id,
            tx,
            dropped: dropped.clone(),
        });
        debug!(symbol = %symbol, subscriber = id, "View subscriber added");

        Ok(ViewSubscription {
            id,
            symbol: symbol.clone(),
            rx,
            dropped,
            idle: state.idle.clone(),
        })
    }

    pub async fn unsubscribe(&self, subscription: ViewSubscription) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let Some(state) = self.state(&subscription.symbol) else {
            return;
        };
        state.subscribers.write().retain(|s| s.id != subscription.id);
        debug!(symbol = %subscription.symbol, subscriber = subscription.id, "View subscriber removed");
        if state.interest() == 0 {
            self.deactivate(&state).await;
        }
    }

    /// Keep `symbol` aggregated for on-demand reads via [`Self::view`].
    pub async fn acquire(&self, symbol: &Symbol) -> Result<SymbolLease, AggregatorError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let state = self.activate(symbol).await?;
        state.leases.fetch_add(1, Ordering::SeqCst);
        Ok(SymbolLease {
            symbol: symbol.clone(),
        })
    }

    pub async fn release(&self, lease: SymbolLease) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let Some(state) = self.state(&lease.symbol) else {
            return;
        };
        let _ = state
            .leases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if state.interest() == 0 {
            self.deactivate(&state).await;
        }
    }

    /// Latest merged view with the staleness flag evaluated now.
    pub fn view(&self, symbol: &Symbol) -> Option<AggregatedView> {
        let state = self.state(symbol)?;
        let mut view = state.data.read().view.clone();
        view.stale = self
            .shared
            .staleness
            .symbol_is_stale(symbol, self.config.freshness_window);
        Some(view)
    }

    /// Each exchange's book for `symbol`, not merged across venues.
    pub fn order_books(&self, symbol: &Symbol) -> BTreeMap<String, OrderBookSnapshot> {
        self.state(symbol)
            .map(|s| s.data.read().books.snapshots(self.config.book_depth))
            .unwrap_or_default()
    }

    /// Most recent trades across exchanges, oldest first.
    pub fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Vec<TradeEvent> {
        let Some(state) = self.state(symbol) else {
            return Vec::new();
        };
        let data = state.data.read();
        let skip = data.trades.len().saturating_sub(limit);
        data.trades.iter().skip(skip).cloned().collect()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.shared.symbols.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn subscriber_count(&self, symbol: &Symbol) -> usize {
        self.state(symbol)
            .map(|s| s.subscribers.read().len())
            .unwrap_or(0)
    }

    /// Running (exchange, symbol, stream) tasks.
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Views dropped across all subscribers.
    pub fn dropped_views(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Start the advisory connectivity monitor. Idempotent.
    pub fn start_heartbeat(&self, every: Duration) {
        let mut slot = self.heartbeat.lock();
        if slot.is_some() || self.is_stopped() {
            return;
        }
        let monitor = HeartbeatMonitor::new(self.registry.clone(), every);
        *slot = Some(monitor.spawn(self.closing.subscribe()));
        info!("💓 Heartbeat monitor started ({:?})", every);
    }

    /// Stop every stream task and the heartbeat, and close all subscriber
    /// channels. Later subscribe calls fail with `Stopped`.
    pub async fn stop(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.send_replace(true);
        let heartbeat = self.heartbeat.lock().take();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }

        let states: Vec<Arc<SymbolState>> = self.shared.symbols.iter().map(|e| e.value().clone()).collect();
        for state in states {
            // Dropping the senders signals end-of-stream to subscribers.
            state.subscribers.write().clear();
            self.deactivate(&state).await;
        }
        info!("🛑 Market data aggregator stopped");
    }

    fn state(&self, symbol: &Symbol) -> Option<Arc<SymbolState>> {
        self.shared.symbols.get(symbol).map(|e| e.value().clone())
    }

    async fn activate(&self, symbol: &Symbol) -> Result<Arc<SymbolState>, AggregatorError> {
        if self.is_stopped() {
            return Err(AggregatorError::Stopped);
        }
        if let Some(state) = self.state(symbol) {
            return Ok(state);
        }
        if self.registry.is_empty() {
            return Err(AggregatorError::NoExchanges);
        }

        let state = Arc::new(SymbolState::new(symbol.clone()));
        let tasks = self.start_tasks(&state).await;
        if tasks.handles.is_empty() {
            warn!(symbol = %symbol, "⚠️ No exchange stream available, view will stay empty");
        } else {
            info!(symbol = %symbol, tasks = tasks.handles.len(), "📡 Aggregation started");
        }
        spawn_monitor(state.clone(), self.shared.clone(), tasks.shutdown.subscribe());
        *state.tasks.lock() = Some(tasks);
        self.shared.symbols.insert(symbol.clone(), state.clone());
        Ok(state)
    }

    async fn deactivate(&self, state: &Arc<SymbolState>) {
        self.shared.deactivate(state).await;
    }

    async fn start_tasks(&self, state: &Arc<SymbolState>) -> SymbolTasks {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();
        let symbol = &state.symbol;

        for (name, adapter) in self.registry.all() {
            if let Some(stream) = self
                .open(&name, "ticker", symbol, adapter.subscribe_ticker(symbol))
                .await
            {
                let (st, shared) = (state.clone(), self.shared.clone());
                handles.push(spawn_stream(
                    stream,
                    shutdown.subscribe(),
                    TaskGuard::new(&self.active_tasks),
                    move |t| st.on_ticker(t, &shared),
                ));
            }

            if let Some(stream) = self
                .open(&name, "order_book", symbol, adapter.subscribe_order_book(symbol))
                .await
            {
                let (st, shared) = (state.clone(), self.shared.clone());
                handles.push(spawn_stream(
                    stream,
                    shutdown.subscribe(),
                    TaskGuard::new(&self.active_tasks),
                    move |b| st.on_book(b, &shared),
                ));
            }

            if let Some(stream) = self
                .open(&name, "trades", symbol, adapter.subscribe_trades(symbol))
                .await
            {
                let (st, shared) = (state.clone(), self.shared.clone());
                handles.push(spawn_stream(
                    stream,
                    shutdown.subscribe(),
                    TaskGuard::new(&self.active_tasks),
                    move |t| st.on_trade(t, &shared),
                ));
            }
        }

        SymbolTasks { shutdown, handles }
    }

    /// Await one adapter subscription under the subscribe deadline. Failures
    /// skip that exchange for this symbol.
    async fn open<T>(
        &self,
        exchange: &str,
        kind: &str,
        symbol: &Symbol,
        subscribe: impl Future<Output = ExchangeResult<MarketStream<T>>>,
    ) -> Option<MarketStream<T>> {
        match timeout(self.config.subscribe_timeout, subscribe).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                warn!(exchange = %exchange, symbol = %symbol, kind, "⚠️ Subscribe failed, skipping: {}", e);
                None
            }
            Err(_) => {
                warn!(exchange = %exchange, symbol = %symbol, kind, "⚠️ Subscribe timed out, skipping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeAdapter, PaperAdapter};
    use crate::model::{OrderBookLevel, Side};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn ticker(bid: Decimal, bid_qty: Decimal, ask: Decimal) -> TickerSnapshot {
        TickerSnapshot {
            exchange: String::new(),
            symbol: Symbol::new("BTCUSDT"),
            bid_price: bid,
            bid_qty,
            ask_price: ask,
            ask_qty: dec!(1),
            last_price: bid,
            volume_24h: Decimal::ZERO,
            change_24h_pct: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    async fn venue(registry: &ExchangeRegistry, name: &str) -> Arc<PaperAdapter> {
        let adapter = Arc::new(PaperAdapter::new(name));
        adapter.connect().await.unwrap();
        registry.register(name, adapter.clone()).unwrap();
        adapter
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_subscribers_share_streams() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let b = venue(&registry, "b").await;
        let agg = MarketDataAggregator::new(registry, AggregatorConfig::default());
        let symbol = Symbol::new("BTCUSDT");

        let first = agg.subscribe(&symbol).await.unwrap();
        assert_eq!(agg.active_task_count(), 6);
        let second = agg.subscribe(&symbol).await.unwrap();
        assert_eq!(agg.active_task_count(), 6);
        assert_eq!(a.subscription_count(), 3);
        assert_eq!(b.subscription_count(), 3);
        assert_eq!(agg.subscriber_count(&symbol), 2);

        agg.unsubscribe(first).await;
        assert_eq!(agg.active_task_count(), 6);
        agg.unsubscribe(second).await;
        assert_eq!(agg.active_task_count(), 0);
        assert_eq!(a.subscription_count(), 0);
        assert!(agg.symbols().is_empty());
    }

    #[tokio::test]
    async fn test_ticker_updates_publish_best_of_market() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let b = venue(&registry, "b").await;
        let agg = MarketDataAggregator::new(registry, AggregatorConfig::default());
        let symbol = Symbol::new("BTCUSDT");
        let mut sub = agg.subscribe(&symbol).await.unwrap();

        a.push_ticker(ticker(dec!(100), dec!(1), dec!(102)));
        let view = sub.recv().await.unwrap();
        assert_eq!(view.best_bid.unwrap().exchange, "a");

        b.push_ticker(ticker(dec!(101), dec!(1), dec!(101.5)));
        let view = sub.recv().await.unwrap();
        let bid = view.best_bid.unwrap();
        let ask = view.best_ask.unwrap();
        assert_eq!((bid.exchange.as_str(), bid.price), ("b", dec!(101)));
        assert_eq!((ask.exchange.as_str(), ask.price), ("b", dec!(101.5)));
        assert_eq!(view.tickers.len(), 2);
        assert!(!view.stale);

        // Replacing b's snapshot moves the bid back to a.
        b.push_ticker(ticker(dec!(99), dec!(1), dec!(103)));
        let view = sub.recv().await.unwrap();
        assert_eq!(view.best_bid.unwrap().exchange, "a");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_view() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let agg = MarketDataAggregator::new(registry, AggregatorConfig::default());
        let symbol = Symbol::new("BTCUSDT");
        let lease = agg.acquire(&symbol).await.unwrap();

        a.push_ticker(ticker(dec!(100), dec!(1), dec!(101)));
        eventually(|| agg.view(&symbol).is_some_and(|v| v.best_bid.is_some())).await;

        let mut sub = agg.subscribe(&symbol).await.unwrap();
        assert_eq!(sub.try_recv().unwrap().best_bid.unwrap().price, dec!(100));

        agg.unsubscribe(sub).await;
        assert_eq!(agg.active_task_count(), 3);
        agg.release(lease).await;
        assert_eq!(agg.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_exchange_skipped() {
        let registry = Arc::new(ExchangeRegistry::new());
        let up = venue(&registry, "up").await;
        // Never connected, so every subscribe fails.
        registry
            .register("down", Arc::new(PaperAdapter::new("down")))
            .unwrap();
        let agg = MarketDataAggregator::new(registry, AggregatorConfig::default());
        let symbol = Symbol::new("BTCUSDT");

        let mut sub = agg.subscribe(&symbol).await.unwrap();
        assert_eq!(agg.active_task_count(), 3);
        up.push_ticker(ticker(dec!(100), dec!(1), dec!(101)));
        assert_eq!(sub.recv().await.unwrap().best_bid.unwrap().exchange, "up");
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let config = AggregatorConfig {
            subscriber_capacity: 1,
            ..AggregatorConfig::default()
        };
        let agg = MarketDataAggregator::new(registry, config);
        let symbol = Symbol::new("BTCUSDT");
        let mut slow = agg.subscribe(&symbol).await.unwrap();

        for bid in [dec!(100), dec!(101), dec!(102)] {
            a.push_ticker(ticker(bid, dec!(1), dec!(103)));
        }
        eventually(|| {
            agg.view(&symbol)
                .and_then(|v| v.best_bid)
                .is_some_and(|b| b.price == dec!(102))
        })
        .await;

        assert_eq!(slow.dropped(), 2);
        assert_eq!(agg.dropped_views(), 2);
        assert_eq!(slow.recv().await.unwrap().best_bid.unwrap().price, dec!(100));
    }

    #[tokio::test]
    async fn test_books_and_trades_accessors() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let agg = MarketDataAggregator::new(registry, AggregatorConfig::default());
        let symbol = Symbol::new("BTCUSDT");
        let _lease = agg.acquire(&symbol).await.unwrap();

        a.push_order_book(OrderBookSnapshot {
            exchange: String::new(),
            symbol: symbol.clone(),
            bids: vec![OrderBookLevel { price: dec!(100), quantity: dec!(2) }],
            asks: vec![OrderBookLevel { price: dec!(101), quantity: dec!(1) }],
            sequence: 7,
            is_snapshot: true,
            timestamp: Utc::now(),
        });
        a.push_trade(TradeEvent {
            id: "t1".into(),
            exchange: String::new(),
            symbol: symbol.clone(),
            price: dec!(100.5),
            quantity: dec!(0.1),
            side: Side::Buy,
            timestamp: Utc::now(),
        });

        eventually(|| !agg.order_books(&symbol).is_empty() && !agg.recent_trades(&symbol, 10).is_empty()).await;
        assert_eq!(agg.order_books(&symbol)["a"].sequence, 7);
        assert_eq!(agg.recent_trades(&symbol, 10)[0].id, "t1");
        eventually(|| agg.view(&symbol).is_some_and(|v| v.last_trade.is_some())).await;
    }

    #[tokio::test]
    async fn test_view_goes_stale() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let config = AggregatorConfig {
            freshness_window: Duration::from_millis(30),
            ..AggregatorConfig::default()
        };
        let agg = MarketDataAggregator::new(registry, config);
        let symbol = Symbol::new("BTCUSDT");
        let mut sub = agg.subscribe(&symbol).await.unwrap();

        a.push_ticker(ticker(dec!(100), dec!(1), dec!(101)));
        sub.recv().await.unwrap();
        assert!(!agg.view(&symbol).unwrap().stale);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(agg.view(&symbol).unwrap().stale);
    }

    #[tokio::test]
    async fn test_subscriber_told_when_view_goes_stale() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let config = AggregatorConfig {
            freshness_window: Duration::from_millis(30),
            ..AggregatorConfig::default()
        };
        let agg = MarketDataAggregator::new(registry, config);
        let symbol = Symbol::new("BTCUSDT");
        let mut sub = agg.subscribe(&symbol).await.unwrap();

        a.push_ticker(ticker(dec!(100), dec!(1), dec!(101)));
        assert!(!sub.recv().await.unwrap().stale);

        let flagged = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("stale view pushed")
            .unwrap();
        assert!(flagged.stale);
        assert_eq!(flagged.best_bid.unwrap().price, dec!(100));

        a.push_ticker(ticker(dec!(100.5), dec!(1), dec!(101)));
        let fresh = sub.recv().await.unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.best_bid.unwrap().price, dec!(100.5));
    }

    #[tokio::test]
    async fn test_stale_transition_counted_once() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let config = AggregatorConfig {
            freshness_window: Duration::from_secs(60),
            ..AggregatorConfig::default()
        };
        let agg = MarketDataAggregator::new(registry, config);
        let symbol = Symbol::new("BTCUSDT");
        let mut sub = agg.subscribe(&symbol).await.unwrap();
        a.push_ticker(ticker(dec!(100), dec!(1), dec!(101)));
        sub.recv().await.unwrap();

        let state = agg.state(&symbol).unwrap();
        let quiet = Shared {
            freshness_window: Duration::ZERO,
            ..agg.shared.clone()
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(state.check_freshness(&quiet));
        assert!(!state.check_freshness(&quiet));
        assert!(agg.view(&symbol).is_some());
        assert!(agg.view(&symbol).is_some());
        assert!(!state.check_freshness(&quiet));
        assert!(sub.try_recv().unwrap().stale);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_streams() {
        let registry = Arc::new(ExchangeRegistry::new());
        let a = venue(&registry, "a").await;
        let agg = MarketDataAggregator::new(registry, AggregatorConfig::default());
        let symbol = Symbol::new("BTCUSDT");

        let sub = agg.subscribe(&symbol).await.unwrap();
        let kept = agg.subscribe(&symbol).await.unwrap();
        drop(sub);
        a.push_ticker(ticker(dec!(100), dec!(1), dec!(101)));
        eventually(|| agg.subscriber_count(&symbol) == 1).await;
        assert_eq!(agg.active_task_count(), 3);

        drop(kept);
        eventually(|| agg.active_task_count() == 0).await;
        assert!(agg.symbols().is_empty());
        eventually(|| a.subscription_count() == 0).await;
    }

    #[tokio::test]
    async fn test_stop_closes_subscribers() {
        let registry = Arc::new(ExchangeRegistry::new());
        venue(&registry, "a").await;
        let agg = MarketDataAggregator::new(registry, AggregatorConfig::default());
        let symbol = Symbol::new("BTCUSDT");
        let mut sub = agg.subscribe(&symbol).await.unwrap();
        agg.start_heartbeat(Duration::from_millis(10));

        agg.stop().await;
        assert_eq!(agg.active_task_count(), 0);
        assert!(sub.recv().await.is_none());
        assert_eq!(
            agg.subscribe(&symbol).await.err(),
            Some(AggregatorError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_empty_registry_rejected() {
        let agg = MarketDataAggregator::new(Arc::new(ExchangeRegistry::new()), AggregatorConfig::default());
        assert_eq!(
            agg.subscribe(&Symbol::new("BTCUSDT")).await.err(),
            Some(AggregatorError::NoExchanges)
        );
    }
}
