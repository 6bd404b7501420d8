use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer};

use crate::exchange::adapter::{ExchangeError, ExchangeResult};
use crate::exchange::utc_from_millis;
use crate::model::{
    Balance, Candle, ExchangeOrder, Interval, OrderBookLevel, OrderBookSnapshot, OrderStatus,
    OrderType, PositionRisk, Side, Symbol, TickerSnapshot, TradeEvent,
};

/// Bybit encodes numbers as strings and uses `""` for "not set".
fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse::<Decimal>().map(Some).map_err(serde::de::Error::custom),
    }
}

fn millis_str(raw: &str) -> i64 {
    raw.parse().unwrap_or_default()
}

pub fn parse_side(raw: &str) -> ExchangeResult<Side> {
    match raw {
        "Buy" => Ok(Side::Buy),
        "Sell" => Ok(Side::Sell),
        other => Err(ExchangeError::Parse(format!("unknown side '{}'", other))),
    }
}

pub fn side_param(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

pub fn parse_status(raw: &str) -> ExchangeResult<OrderStatus> {
    match raw {
        "New" | "Created" | "Untriggered" | "Triggered" | "Active" => Ok(OrderStatus::New),
        "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
        "Filled" => Ok(OrderStatus::Filled),
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Ok(OrderStatus::Canceled),
        "Rejected" => Ok(OrderStatus::Rejected),
        other => Err(ExchangeError::Parse(format!("unknown order status '{}'", other))),
    }
}

pub fn interval_param(interval: Interval) -> &'static str {
    match interval {
        Interval::OneMinute => "1",
        Interval::FiveMinutes => "5",
        Interval::FifteenMinutes => "15",
        Interval::OneHour => "60",
        Interval::FourHours => "240",
        Interval::OneDay => "D",
    }
}

fn levels(raw: &[[Decimal; 2]]) -> Vec<OrderBookLevel> {
    raw.iter()
        .map(|[price, quantity]| OrderBookLevel {
            price: *price,
            quantity: *quantity,
        })
        .collect()
}

// --- REST ---

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg")]
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListResult<T> {
    pub list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub time_second: String,
}

/// REST ticker and WS `tickers.*` payloads; every field may be absent in a delta.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerFields {
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub last_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub bid1_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub bid1_size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub ask1_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub ask1_size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub volume24h: Option<Decimal>,
    /// Fraction, not percent.
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price24h_pcnt: Option<Decimal>,
}

/// Merged ticker state for one symbol; deltas overwrite only what they carry.
#[derive(Debug, Clone, Default)]
pub struct TickerState {
    pub last_price: Decimal,
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
    pub volume_24h: Decimal,
    pub change_24h_pct: Decimal,
}

impl TickerState {
    pub fn apply(&mut self, fields: &TickerFields) {
        let set = |slot: &mut Decimal, value: Option<Decimal>| {
            if let Some(v) = value {
                *slot = v;
            }
        };
        set(&mut self.last_price, fields.last_price);
        set(&mut self.bid_price, fields.bid1_price);
        set(&mut self.bid_qty, fields.bid1_size);
        set(&mut self.ask_price, fields.ask1_price);
        set(&mut self.ask_qty, fields.ask1_size);
        set(&mut self.volume_24h, fields.volume24h);
        set(&mut self.change_24h_pct, fields.price24h_pcnt.map(|p| p * dec!(100)));
    }

    /// Spot tickers carry no touch; it comes from the level-1 book instead.
    pub fn apply_top_of_book(&mut self, book: &BookData) {
        if let Some([price, qty]) = book.b.first() {
            self.bid_price = *price;
            self.bid_qty = *qty;
        }
        if let Some([price, qty]) = book.a.first() {
            self.ask_price = *price;
            self.ask_qty = *qty;
        }
    }

    pub fn to_model(&self, exchange: &str, symbol: Symbol, ts: i64) -> TickerSnapshot {
        TickerSnapshot {
            exchange: exchange.to_string(),
            symbol,
            bid_price: self.bid_price,
            bid_qty: self.bid_qty,
            ask_price: self.ask_price,
            ask_qty: self.ask_qty,
            last_price: self.last_price,
            volume_24h: self.volume_24h,
            change_24h_pct: self.change_24h_pct,
            timestamp: utc_from_millis(ts),
        }
    }
}

/// REST orderbook result and WS `orderbook.*` data.
#[derive(Debug, Deserialize)]
pub struct BookData {
    pub s: String,
    #[serde(default)]
    pub b: Vec<[Decimal; 2]>,
    #[serde(default)]
    pub a: Vec<[Decimal; 2]>,
    #[serde(default)]
    pub u: u64,
    #[serde(default)]
    pub ts: Option<i64>,
}

impl BookData {
    pub fn to_model(&self, exchange: &str, is_snapshot: bool, ts: i64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: exchange.to_string(),
            symbol: Symbol::new(&self.s),
            bids: levels(&self.b),
            asks: levels(&self.a),
            sequence: self.u,
            is_snapshot,
            timestamp: utc_from_millis(self.ts.unwrap_or(ts)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTrade {
    pub exec_id: String,
    pub symbol: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: String,
    pub time: String,
}

impl RestTrade {
    pub fn to_model(&self, exchange: &str) -> ExchangeResult<TradeEvent> {
        Ok(TradeEvent {
            id: self.exec_id.clone(),
            exchange: exchange.to_string(),
            symbol: Symbol::new(&self.symbol),
            price: self.price,
            quantity: self.size,
            side: parse_side(&self.side)?,
            timestamp: utc_from_millis(millis_str(&self.time)),
        })
    }
}

/// `publicTrade.*` entries.
#[derive(Debug, Deserialize)]
pub struct WsTrade {
    #[serde(rename = "T")]
    pub time: i64,
    pub s: String,
    #[serde(rename = "S")]
    pub side: String,
    pub v: Decimal,
    pub p: Decimal,
    pub i: String,
}

impl WsTrade {
    pub fn to_model(&self, exchange: &str) -> ExchangeResult<TradeEvent> {
        Ok(TradeEvent {
            id: self.i.clone(),
            exchange: exchange.to_string(),
            symbol: Symbol::new(&self.s),
            price: self.p,
            quantity: self.v,
            side: parse_side(&self.side)?,
            timestamp: utc_from_millis(self.time),
        })
    }
}

/// Kline rows are `[start, open, high, low, close, volume, turnover]`, newest first.
pub fn parse_kline(row: &[String], symbol: &Symbol, interval: Interval) -> ExchangeResult<Candle> {
    let decimal_at = |idx: usize| -> ExchangeResult<Decimal> {
        row.get(idx)
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| ExchangeError::Parse(format!("kline field {} missing", idx)))
    };
    let start = row
        .first()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ExchangeError::Parse("kline start missing".into()))?;
    Ok(Candle {
        symbol: symbol.clone(),
        interval,
        open_time: utc_from_millis(start),
        open: decimal_at(1)?,
        high: decimal_at(2)?,
        low: decimal_at(3)?,
        close: decimal_at(4)?,
        volume: decimal_at(5)?,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

/// Order as returned by `/v5/order/realtime`, `/v5/order/history` and the
/// private `order` topic.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    #[serde(default)]
    pub stop_order_type: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price: Option<Decimal>,
    pub qty: Decimal,
    pub order_status: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub cum_exec_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub cum_exec_fee: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub trigger_price: Option<Decimal>,
    pub created_time: String,
    pub updated_time: String,
}

impl OrderItem {
    fn order_type(&self) -> OrderType {
        let limit = self.order_type == "Limit";
        let triggered = self.trigger_price.is_some_and(|p| !p.is_zero());
        match (triggered, self.stop_order_type.contains("TakeProfit"), limit) {
            (false, _, true) => OrderType::Limit,
            (false, _, false) => OrderType::Market,
            (true, true, true) => OrderType::TakeProfitLimit,
            (true, true, false) => OrderType::TakeProfit,
            (true, false, true) => OrderType::StopLossLimit,
            (true, false, false) => OrderType::StopLoss,
        }
    }

    pub fn to_model(&self, exchange: &str) -> ExchangeResult<ExchangeOrder> {
        Ok(ExchangeOrder {
            exchange: exchange.to_string(),
            order_id: self.order_id.clone(),
            client_order_id: self.order_link_id.clone(),
            symbol: Symbol::new(&self.symbol),
            side: parse_side(&self.side)?,
            order_type: self.order_type(),
            status: parse_status(&self.order_status)?,
            quantity: self.qty,
            price: self.price.filter(|p| !p.is_zero()),
            filled_quantity: self.cum_exec_qty.unwrap_or_default(),
            avg_fill_price: self.avg_price.filter(|p| !p.is_zero()),
            commission: self.cum_exec_fee.unwrap_or_default(),
            created_at: utc_from_millis(millis_str(&self.created_time)),
            updated_at: utc_from_millis(millis_str(&self.updated_time)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WalletAccount {
    pub coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCoin {
    pub coin: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub wallet_balance: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub locked: Option<Decimal>,
}

impl WalletCoin {
    pub fn to_model(&self) -> Balance {
        let total = self.wallet_balance.unwrap_or_default();
        let locked = self.locked.unwrap_or_default();
        Balance {
            asset: self.coin.clone(),
            free: total - locked,
            locked,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRate {
    pub symbol: String,
    pub taker_fee_rate: Decimal,
    pub maker_fee_rate: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionItem {
    pub symbol: String,
    pub side: String,
    pub size: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub mark_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub leverage: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub liq_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub unrealised_pnl: Option<Decimal>,
}

impl PositionItem {
    /// Flat positions come back with side `""`; those yield `None`.
    pub fn to_model(&self, exchange: &str) -> Option<PositionRisk> {
        if self.size.is_zero() {
            return None;
        }
        let side = parse_side(&self.side).ok()?;
        Some(PositionRisk {
            exchange: exchange.to_string(),
            symbol: Symbol::new(&self.symbol),
            side,
            size: self.size,
            entry_price: self.avg_price.unwrap_or_default(),
            mark_price: self.mark_price.unwrap_or_default(),
            leverage: self.leverage.unwrap_or(Decimal::ONE),
            liquidation_price: self.liq_price.filter(|p| !p.is_zero()),
            unrealized_pnl: self.unrealised_pnl.unwrap_or_default(),
        })
    }
}

// --- WebSocket ---

/// Public and private topic pushes.
#[derive(Debug, Deserialize)]
pub struct TopicFrame {
    pub topic: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub ts: i64,
    pub data: serde_json::Value,
}

impl TopicFrame {
    pub fn is_snapshot(&self) -> bool {
        self.kind != "delta"
    }
}

/// Replies to `op` requests (subscribe, auth, ping).
#[derive(Debug, Deserialize)]
pub struct OpReply {
    pub op: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: Option<String>,
}
