use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange-agnostic instrument identifier, e.g. `BTCUSDT`.
///
/// Normalised on construction so that `btc/usdt`, `BTC-USDT` and `BTC_USDT`
/// all resolve to the same aggregation key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let clean: String = raw
            .as_ref()
            .trim()
            .chars()
            .filter(|c| !matches!(c, '/' | '-' | '_' | ' '))
            .collect();
        Self(clean.to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol::new(value)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "STOP_LOSS")]
    StopLoss,
    #[serde(rename = "STOP_LOSS_LIMIT")]
    StopLossLimit,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    #[serde(rename = "TAKE_PROFIT_LIMIT")]
    TakeProfitLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    #[default]
    #[serde(rename = "GTC")]
    GoodTillCancel,
    #[serde(rename = "IOC")]
    ImmediateOrCancel,
    #[serde(rename = "FOK")]
    FillOrKill,
    #[serde(rename = "POST_ONLY")]
    PostOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
        }
    }

    pub fn minutes(&self) -> u32 {
        match self {
            Interval::OneMinute => 1,
            Interval::FiveMinutes => 5,
            Interval::FifteenMinutes => 15,
            Interval::OneHour => 60,
            Interval::FourHours => 240,
            Interval::OneDay => 1440,
        }
    }
}

// --- Market data ---

/// Best bid/ask and 24h statistics for one (exchange, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub exchange: String,
    pub symbol: Symbol,
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
    pub last_price: Decimal,
    pub volume_24h: Decimal,
    pub change_24h_pct: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl TickerSnapshot {
    pub fn mid_price(&self) -> Option<Decimal> {
        if self.bid_price.is_zero() || self.ask_price.is_zero() {
            return None;
        }
        Some((self.bid_price + self.ask_price) / Decimal::TWO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Bids are kept descending and asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: String,
    pub symbol: Symbol,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub sequence: u64,
    /// False for incremental depth updates.
    pub is_snapshot: bool,
    pub timestamp: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.bids.truncate(depth);
        self.asks.truncate(depth);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub id: String,
    pub exchange: String,
    pub symbol: Symbol,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Aggressor side.
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

// --- Orders ---

/// Specialised request shapes that adapters translate into native parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvancedOrder {
    StopLoss {
        trigger_price: Decimal,
        limit_price: Option<Decimal>,
    },
    TakeProfit {
        trigger_price: Decimal,
        limit_price: Option<Decimal>,
    },
    Iceberg {
        visible_quantity: Decimal,
    },
    Twap {
        duration_secs: u64,
        slices: u32,
    },
}

/// Order requested by a strategy, not yet risk-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Assigned by the engine when left empty.
    #[serde(default)]
    pub client_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    /// Explicit venue; otherwise the bot's first configured exchange is used.
    pub exchange: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    pub leverage: Option<Decimal>,
    pub advanced: Option<AdvancedOrder>,
}

impl OrderIntent {
    pub fn market(symbol: impl Into<Symbol>, side: Side, quantity: Decimal) -> Self {
        Self {
            client_id: String::new(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::ImmediateOrCancel,
            exchange: None,
            reduce_only: false,
            leverage: None,
            advanced: None,
        }
    }

    pub fn limit(symbol: impl Into<Symbol>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(price),
            time_in_force: TimeInForce::GoodTillCancel,
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn on_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_advanced(mut self, advanced: AdvancedOrder) -> Self {
        self.advanced = Some(advanced);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Fully specified order handed to an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub advanced: Option<AdvancedOrder>,
}

impl OrderRequest {
    /// Builds the request for an intent, using `quantity` (which may have been
    /// shrunk by the risk gate) instead of the intent's own quantity.
    pub fn from_intent(intent: &OrderIntent, quantity: Decimal) -> Self {
        Self {
            client_order_id: intent.client_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            quantity,
            price: intent.limit_price,
            stop_price: intent.stop_price,
            time_in_force: intent.time_in_force,
            reduce_only: intent.reduce_only,
            advanced: intent.advanced.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Rejected,
    Expired,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Order state as reported by an exchange, either in a REST response or a
/// user-data stream update. `filled_quantity` is cumulative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub exchange: String,
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub commission: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Account ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingFees {
    pub symbol: Symbol,
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRisk {
    pub exchange: String,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub unrealized_pnl: Decimal,
}

/// Events delivered on an adapter's private stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserDataEvent {
    Order(ExchangeOrder),
    Balance(Balance),
}

// --- Health ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub exchange: String,
    pub connected: bool,
    pub reconnect_count: u64,
    pub last_error: Option<String>,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_dropped: u64,
    pub latency: LatencyPercentiles,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_normalization() {
        assert_eq!(Symbol::new("btc/usdt"), Symbol::new("BTCUSDT"));
        assert_eq!(Symbol::new("BTC-USDT").as_str(), "BTCUSDT");
        assert_eq!(Symbol::new(" eth_usdt ").as_str(), "ETHUSDT");
    }

    #[test]
    fn test_symbol_serde_normalizes() {
        let symbol: Symbol = serde_json::from_str("\"sol/usdt\"").unwrap();
        assert_eq!(symbol.as_str(), "SOLUSDT");
        assert_eq!(serde_json::to_string(&symbol).unwrap(), "\"SOLUSDT\"");
    }

    #[test]
    fn test_limit_intent_builder() {
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(0.5), dec!(42000))
            .on_exchange("binance")
            .with_client_id("abc");
        assert_eq!(intent.order_type, OrderType::Limit);
        assert_eq!(intent.limit_price, Some(dec!(42000)));
        assert_eq!(intent.exchange.as_deref(), Some("binance"));

        let req = OrderRequest::from_intent(&intent, dec!(0.25));
        assert_eq!(req.quantity, dec!(0.25));
        assert_eq!(req.client_order_id, "abc");
        assert_eq!(req.price, Some(dec!(42000)));
    }

    #[test]
    fn test_ticker_mid_price() {
        let ticker = TickerSnapshot {
            exchange: "binance".into(),
            symbol: Symbol::new("BTCUSDT"),
            bid_price: dec!(100),
            bid_qty: dec!(1),
            ask_price: dec!(102),
            ask_qty: dec!(1),
            last_price: dec!(101),
            volume_24h: Decimal::ZERO,
            change_24h_pct: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        assert_eq!(ticker.mid_price(), Some(dec!(101)));
    }
}
