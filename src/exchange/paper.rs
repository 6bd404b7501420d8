//! In-process simulated venue.
//!
//! Market data is pushed in by the host (`push_ticker`, `push_order_book`,
//! `push_trade`). Market orders fill at the touch immediately; limit and
//! trigger orders rest until a later ticker crosses them.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::exchange::adapter::{ExchangeAdapter, ExchangeError, ExchangeResult, PermanentKind};
use crate::exchange::stats::ConnectionStats;
use crate::exchange::stream::{DEFAULT_STREAM_CAPACITY, MarketStream, StreamSender, stream_channel};
use crate::model::{
    AdvancedOrder, Balance, Candle, ConnectionHealth, ExchangeOrder, Interval, OrderBookSnapshot,
    OrderRequest, OrderStatus, OrderType, PositionRisk, Side, Symbol, TickerSnapshot, TradeEvent,
    TradingFees, UserDataEvent,
};

const TRADE_HISTORY: usize = 500;
const QUOTE_ASSETS: [&str; 4] = ["USDT", "USDC", "USD", "BTC"];

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub stream_capacity: usize,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            maker_fee: dec!(0.0002),
            taker_fee: dec!(0.0005),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

#[derive(Default)]
struct VenueState {
    tickers: HashMap<Symbol, TickerSnapshot>,
    books: HashMap<Symbol, OrderBookSnapshot>,
    trades: HashMap<Symbol, VecDeque<TradeEvent>>,
    orders: HashMap<String, ExchangeOrder>,
    /// Resting trigger shapes keyed by order id.
    triggers: HashMap<String, AdvancedOrder>,
    balances: HashMap<String, Balance>,
    next_order_id: u64,
}

#[derive(Default)]
struct Subscribers {
    tickers: HashMap<Symbol, Vec<StreamSender<TickerSnapshot>>>,
    books: HashMap<Symbol, Vec<StreamSender<OrderBookSnapshot>>>,
    trades: HashMap<Symbol, Vec<StreamSender<TradeEvent>>>,
    user: Vec<StreamSender<UserDataEvent>>,
}

pub struct PaperAdapter {
    name: String,
    config: PaperConfig,
    stats: ConnectionStats,
    state: Mutex<VenueState>,
    subscribers: Mutex<Subscribers>,
}

impl PaperAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, PaperConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: PaperConfig) -> Self {
        Self {
            name: name.into().to_lowercase(),
            config,
            stats: ConnectionStats::new(),
            state: Mutex::new(VenueState::default()),
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    pub fn set_balance(&self, asset: &str, free: Decimal) {
        self.state.lock().balances.insert(
            asset.to_string(),
            Balance {
                asset: asset.to_string(),
                free,
                locked: Decimal::ZERO,
            },
        );
    }

    /// Publish a ticker to subscribers and match resting orders against it.
    pub fn push_ticker(&self, mut ticker: TickerSnapshot) {
        ticker.exchange = self.name.clone();
        self.stats.record_message(0);

        let fills = {
            let mut state = self.state.lock();
            state.tickers.insert(ticker.symbol.clone(), ticker.clone());
            self.match_resting(&mut state, &ticker)
        };

        {
            let mut subs = self.subscribers.lock();
            if let Some(list) = subs.tickers.get_mut(&ticker.symbol) {
                list.retain(|s| s.publish(ticker.clone()));
            }
        }

        for order in fills {
            self.emit_user(UserDataEvent::Order(order));
        }
    }

    pub fn push_order_book(&self, mut book: OrderBookSnapshot) {
        book.exchange = self.name.clone();
        self.stats.record_message(0);
        self.state
            .lock()
            .books
            .insert(book.symbol.clone(), book.clone());
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.books.get_mut(&book.symbol) {
            list.retain(|s| s.publish(book.clone()));
        }
    }

    pub fn push_trade(&self, mut trade: TradeEvent) {
        trade.exchange = self.name.clone();
        self.stats.record_message(0);
        {
            let mut state = self.state.lock();
            let history = state.trades.entry(trade.symbol.clone()).or_default();
            if history.len() == TRADE_HISTORY {
                history.pop_front();
            }
            history.push_back(trade.clone());
        }
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.trades.get_mut(&trade.symbol) {
            list.retain(|s| s.publish(trade.clone()));
        }
    }

    /// Number of live stream subscriptions across all kinds.
    pub fn subscription_count(&self) -> usize {
        let mut subs = self.subscribers.lock();
        for list in subs.tickers.values_mut() {
            list.retain(|s| !s.is_closed());
        }
        for list in subs.books.values_mut() {
            list.retain(|s| !s.is_closed());
        }
        for list in subs.trades.values_mut() {
            list.retain(|s| !s.is_closed());
        }
        subs.user.retain(|s| !s.is_closed());
        subs.tickers.values().map(Vec::len).sum::<usize>()
            + subs.books.values().map(Vec::len).sum::<usize>()
            + subs.trades.values().map(Vec::len).sum::<usize>()
            + subs.user.len()
    }

    fn emit_user(&self, event: UserDataEvent) {
        self.subscribers.lock().user.retain(|s| s.publish(event.clone()));
    }

    fn ensure_connected(&self) -> ExchangeResult<()> {
        if self.stats.is_connected() {
            Ok(())
        } else {
            Err(ExchangeError::Connection(format!("{} is not connected", self.name)))
        }
    }

    fn fill(&self, state: &mut VenueState, order: &mut ExchangeOrder, price: Decimal, fee_rate: Decimal) {
        let qty = order.quantity - order.filled_quantity;
        let notional = qty * price;
        let fee = notional * fee_rate;

        order.filled_quantity = order.quantity;
        order.avg_fill_price = Some(price);
        order.commission += fee;
        order.status = OrderStatus::Filled;
        order.updated_at = Utc::now();

        if let Some((base, quote)) = split_symbol(&order.symbol) {
            let (base_delta, quote_delta) = match order.side {
                Side::Buy => (qty, -(notional + fee)),
                Side::Sell => (-qty, notional - fee),
            };
            for (asset, delta) in [(base, base_delta), (quote, quote_delta)] {
                let entry = state.balances.entry(asset.clone()).or_insert(Balance {
                    asset,
                    free: Decimal::ZERO,
                    locked: Decimal::ZERO,
                });
                entry.free += delta;
            }
        }
    }

    fn match_resting(&self, state: &mut VenueState, ticker: &TickerSnapshot) -> Vec<ExchangeOrder> {
        let candidates: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.symbol == ticker.symbol && !o.status.is_terminal())
            .map(|o| o.order_id.clone())
            .collect();

        let mut filled = Vec::new();
        for id in candidates {
            let Some(mut order) = state.orders.remove(&id) else {
                continue;
            };
            let fill_price = match state.triggers.get(&id) {
                Some(AdvancedOrder::StopLoss { trigger_price, limit_price })
                | Some(AdvancedOrder::TakeProfit { trigger_price, limit_price }) => {
                    let is_stop = matches!(state.triggers.get(&id), Some(AdvancedOrder::StopLoss { .. }));
                    // Stops trigger on adverse moves, take-profits on favourable ones.
                    let triggered = match (order.side, is_stop) {
                        (Side::Sell, true) | (Side::Buy, false) => ticker.last_price <= *trigger_price,
                        (Side::Buy, true) | (Side::Sell, false) => ticker.last_price >= *trigger_price,
                    };
                    triggered.then(|| limit_price.unwrap_or(*trigger_price))
                }
                _ => crossing_price(&order, ticker),
            };

            if let Some(price) = fill_price {
                let fee = self.config.maker_fee;
                self.fill(state, &mut order, price, fee);
                state.triggers.remove(&id);
                debug!(exchange = %self.name, order_id = %id, %price, "Paper resting order filled");
                filled.push(order.clone());
            }
            state.orders.insert(id, order);
        }
        filled
    }
}

fn crossing_price(order: &ExchangeOrder, ticker: &TickerSnapshot) -> Option<Decimal> {
    let limit = order.price?;
    match order.side {
        Side::Buy if !ticker.ask_price.is_zero() && ticker.ask_price <= limit => Some(ticker.ask_price),
        Side::Sell if !ticker.bid_price.is_zero() && ticker.bid_price >= limit => Some(ticker.bid_price),
        _ => None,
    }
}

fn split_symbol(symbol: &Symbol) -> Option<(String, String)> {
    let raw = symbol.as_str();
    QUOTE_ASSETS.iter().find_map(|quote| {
        raw.strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base.to_string(), quote.to_string()))
    })
}

#[async_trait]
impl ExchangeAdapter for PaperAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> ExchangeResult<()> {
        if !self.stats.is_connected() {
            self.stats.set_connected(true);
            info!("🔌 Paper venue {} connected", self.name);
        }
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        if self.stats.is_connected() {
            self.stats.set_connected(false);
            // Dropping the senders closes every open stream.
            *self.subscribers.lock() = Subscribers::default();
            info!("Paper venue {} disconnected", self.name);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stats.is_connected()
    }

    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<TickerSnapshot> {
        self.ensure_connected()?;
        self.state.lock().tickers.get(symbol).cloned().ok_or_else(|| {
            ExchangeError::permanent(PermanentKind::InvalidSymbol, format!("no market for {}", symbol))
        })
    }

    async fn order_book(&self, symbol: &Symbol, depth: usize) -> ExchangeResult<OrderBookSnapshot> {
        self.ensure_connected()?;
        let mut book = self.state.lock().books.get(symbol).cloned().ok_or_else(|| {
            ExchangeError::permanent(PermanentKind::InvalidSymbol, format!("no book for {}", symbol))
        })?;
        book.truncate(depth);
        Ok(book)
    }

    async fn recent_trades(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<TradeEvent>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        let trades = state
            .trades
            .get(symbol)
            .map(|h| h.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default();
        Ok(trades)
    }

    async fn candles(
        &self,
        _symbol: &Symbol,
        _interval: Interval,
        _limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        Err(ExchangeError::unsupported("paper venue does not build candles"))
    }

    async fn subscribe_ticker(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TickerSnapshot>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.config.stream_capacity);
        self.subscribers
            .lock()
            .tickers
            .entry(symbol.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_order_book(
        &self,
        symbol: &Symbol,
    ) -> ExchangeResult<MarketStream<OrderBookSnapshot>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.config.stream_capacity);
        self.subscribers
            .lock()
            .books
            .entry(symbol.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_trades(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TradeEvent>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.config.stream_capacity);
        self.subscribers
            .lock()
            .trades
            .entry(symbol.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_user_data(&self) -> ExchangeResult<MarketStream<UserDataEvent>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.config.stream_capacity);
        self.subscribers.lock().user.push(tx);
        Ok(rx)
    }

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        let started = Instant::now();

        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::permanent(
                PermanentKind::InvalidOrder,
                format!("quantity must be positive, got {}", request.quantity),
            ));
        }
        if matches!(request.advanced, Some(AdvancedOrder::Twap { .. })) {
            return Err(ExchangeError::unsupported("paper venue has no native TWAP"));
        }

        let order = {
            let mut state = self.state.lock();
            let ticker = state.tickers.get(&request.symbol).cloned().ok_or_else(|| {
                ExchangeError::permanent(
                    PermanentKind::InvalidSymbol,
                    format!("no market for {}", request.symbol),
                )
            })?;

            state.next_order_id += 1;
            let now = Utc::now();
            let mut order = ExchangeOrder {
                exchange: self.name.clone(),
                order_id: format!("{}-{}", self.name, state.next_order_id),
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
            };

            match (&request.advanced, request.order_type) {
                (Some(trigger @ AdvancedOrder::StopLoss { .. }), _)
                | (Some(trigger @ AdvancedOrder::TakeProfit { .. }), _) => {
                    state.triggers.insert(order.order_id.clone(), trigger.clone());
                }
                (_, OrderType::Market) => {
                    let touch = match request.side {
                        Side::Buy => ticker.ask_price,
                        Side::Sell => ticker.bid_price,
                    };
                    if touch.is_zero() {
                        order.status = OrderStatus::Rejected;
                    } else {
                        let fee = self.config.taker_fee;
                        self.fill(&mut state, &mut order, touch, fee);
                    }
                }
                _ => {
                    if let Some(price) = crossing_price(&order, &ticker) {
                        let fee = self.config.taker_fee;
                        self.fill(&mut state, &mut order, price, fee);
                    }
                }
            }

            state.orders.insert(order.order_id.clone(), order.clone());
            order
        };

        self.stats.record_latency(started.elapsed());
        self.emit_user(UserDataEvent::Order(order.clone()));
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        let order = {
            let mut state = self.state.lock();
            let order = state
                .orders
                .get_mut(order_id)
                .filter(|o| &o.symbol == symbol)
                .ok_or_else(|| {
                    ExchangeError::permanent(PermanentKind::OrderNotFound, order_id.to_string())
                })?;
            if order.status.is_terminal() {
                return Err(ExchangeError::permanent(
                    PermanentKind::Rejected,
                    format!("order {} already {}", order_id, order.status),
                ));
            }
            order.status = OrderStatus::Canceled;
            order.updated_at = Utc::now();
            let snapshot = order.clone();
            state.triggers.remove(order_id);
            snapshot
        };
        self.emit_user(UserDataEvent::Order(order.clone()));
        Ok(order)
    }

    async fn cancel_all_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        let ids: Vec<String> = self
            .open_orders(Some(symbol))
            .await?
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        let mut canceled = Vec::with_capacity(ids.len());
        for id in ids {
            canceled.push(self.cancel_order(symbol, &id).await?);
        }
        Ok(canceled)
    }

    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        self.state
            .lock()
            .orders
            .get(order_id)
            .filter(|o| &o.symbol == symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::permanent(PermanentKind::OrderNotFound, order_id.to_string()))
    }

    async fn open_orders(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.is_none_or(|s| &o.symbol == s))
            .cloned()
            .collect())
    }

    async fn order_history(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        let mut orders: Vec<ExchangeOrder> = state
            .orders
            .values()
            .filter(|o| &o.symbol == symbol)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit);
        Ok(orders)
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        self.ensure_connected()?;
        Ok(self.state.lock().balances.values().cloned().collect())
    }

    async fn trading_fees(&self, symbol: &Symbol) -> ExchangeResult<TradingFees> {
        Ok(TradingFees {
            symbol: symbol.clone(),
            maker_rate: self.config.maker_fee,
            taker_rate: self.config.taker_fee,
        })
    }

    async fn position_risk(&self, _symbol: Option<&Symbol>) -> ExchangeResult<Vec<PositionRisk>> {
        Ok(Vec::new())
    }

    fn health(&self) -> ConnectionHealth {
        self.stats.snapshot(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(bid: Decimal, ask: Decimal) -> TickerSnapshot {
        TickerSnapshot {
            exchange: String::new(),
            symbol: Symbol::new("BTCUSDT"),
            bid_price: bid,
            bid_qty: dec!(1),
            ask_price: ask,
            ask_qty: dec!(1),
            last_price: (bid + ask) / Decimal::TWO,
            volume_24h: Decimal::ZERO,
            change_24h_pct: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    fn request(side: Side, order_type: OrderType, price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            client_order_id: "c-1".into(),
            symbol: Symbol::new("BTCUSDT"),
            side,
            order_type,
            quantity: dec!(0.5),
            price,
            stop_price: None,
            time_in_force: Default::default(),
            reduce_only: false,
            advanced: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_touch() {
        let venue = PaperAdapter::new("paper");
        venue.connect().await.unwrap();
        venue.set_balance("USDT", dec!(10000));
        venue.push_ticker(ticker(dec!(100), dec!(101)));

        let order = venue
            .place_order(request(Side::Buy, OrderType::Market, None))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(101)));

        let balances = venue.balances().await.unwrap();
        let btc = balances.iter().find(|b| b.asset == "BTC").unwrap();
        assert_eq!(btc.free, dec!(0.5));
    }

    #[tokio::test]
    async fn test_resting_limit_fills_when_crossed() {
        let venue = PaperAdapter::new("paper");
        venue.connect().await.unwrap();
        venue.push_ticker(ticker(dec!(100), dec!(101)));
        let mut user = venue.subscribe_user_data().await.unwrap();

        let order = venue
            .place_order(request(Side::Buy, OrderType::Limit, Some(dec!(99))))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert!(matches!(user.recv().await, Some(UserDataEvent::Order(o)) if o.status == OrderStatus::New));

        venue.push_ticker(ticker(dec!(98), dec!(98.5)));
        match user.recv().await {
            Some(UserDataEvent::Order(o)) => {
                assert_eq!(o.status, OrderStatus::Filled);
                assert_eq!(o.avg_fill_price, Some(dec!(98.5)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let venue = PaperAdapter::new("paper");
        let err = venue.ticker(&Symbol::new("BTCUSDT")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_permanent() {
        let venue = PaperAdapter::new("paper");
        venue.connect().await.unwrap();
        let err = venue
            .place_order(request(Side::Buy, OrderType::Market, None))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_closing_one_stream_keeps_others() {
        let venue = PaperAdapter::new("paper");
        venue.connect().await.unwrap();
        let symbol = Symbol::new("BTCUSDT");
        let first = venue.subscribe_ticker(&symbol).await.unwrap();
        let mut second = venue.subscribe_ticker(&symbol).await.unwrap();
        drop(first);

        venue.push_ticker(ticker(dec!(100), dec!(101)));
        let got = second.recv().await.unwrap();
        assert_eq!(got.exchange, "paper");
        assert_eq!(venue.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let venue = PaperAdapter::new("Paper");
        venue.connect().await.unwrap();
        venue.connect().await.unwrap();
        assert!(venue.is_connected());
        venue.disconnect().await.unwrap();
        venue.disconnect().await.unwrap();
        assert!(!venue.is_connected());
        assert_eq!(venue.name(), "paper");
    }
}
