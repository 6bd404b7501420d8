use rust_decimal::Decimal;
use serde::Deserialize;

use crate::exchange::adapter::{ExchangeError, ExchangeResult};
use crate::exchange::utc_from_millis;
use crate::model::{
    Balance, Candle, ExchangeOrder, Interval, OrderBookLevel, OrderBookSnapshot, OrderStatus,
    OrderType, Side, Symbol, TickerSnapshot, TradeEvent,
};

pub fn parse_side(raw: &str) -> ExchangeResult<Side> {
    match raw {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(ExchangeError::Parse(format!("unknown side '{}'", other))),
    }
}

pub fn parse_status(raw: &str) -> ExchangeResult<OrderStatus> {
    match raw {
        "NEW" => Ok(OrderStatus::New),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "PENDING_CANCEL" => Ok(OrderStatus::PendingCancel),
        "CANCELED" => Ok(OrderStatus::Canceled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatus::Expired),
        other => Err(ExchangeError::Parse(format!("unknown order status '{}'", other))),
    }
}

pub fn parse_order_type(raw: &str) -> ExchangeResult<OrderType> {
    match raw {
        "MARKET" => Ok(OrderType::Market),
        "LIMIT" | "LIMIT_MAKER" => Ok(OrderType::Limit),
        "STOP_LOSS" => Ok(OrderType::StopLoss),
        "STOP_LOSS_LIMIT" => Ok(OrderType::StopLossLimit),
        "TAKE_PROFIT" => Ok(OrderType::TakeProfit),
        "TAKE_PROFIT_LIMIT" => Ok(OrderType::TakeProfitLimit),
        other => Err(ExchangeError::Parse(format!("unknown order type '{}'", other))),
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
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTicker {
    pub symbol: String,
    pub price_change_percent: Decimal,
    pub last_price: Decimal,
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl RestTicker {
    pub fn to_model(&self, exchange: &str) -> TickerSnapshot {
        TickerSnapshot {
            exchange: exchange.to_string(),
            symbol: Symbol::new(&self.symbol),
            bid_price: self.bid_price,
            bid_qty: self.bid_qty,
            ask_price: self.ask_price,
            ask_qty: self.ask_qty,
            last_price: self.last_price,
            volume_24h: self.volume,
            change_24h_pct: self.price_change_percent,
            timestamp: utc_from_millis(self.close_time),
        }
    }
}

/// REST depth and the `depth20` partial-book stream share this shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Depth {
    pub last_update_id: u64,
    pub bids: Vec<[Decimal; 2]>,
    pub asks: Vec<[Decimal; 2]>,
}

impl Depth {
    pub fn to_model(&self, exchange: &str, symbol: Symbol) -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: exchange.to_string(),
            symbol,
            bids: levels(&self.bids),
            asks: levels(&self.asks),
            sequence: self.last_update_id,
            is_snapshot: true,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTrade {
    pub id: u64,
    pub price: Decimal,
    pub qty: Decimal,
    pub time: i64,
    pub is_buyer_maker: bool,
}

impl RestTrade {
    pub fn to_model(&self, exchange: &str, symbol: &Symbol) -> TradeEvent {
        TradeEvent {
            id: self.id.to_string(),
            exchange: exchange.to_string(),
            symbol: symbol.clone(),
            price: self.price,
            quantity: self.qty,
            side: aggressor(self.is_buyer_maker),
            timestamp: utc_from_millis(self.time),
        }
    }
}

/// A maker buyer means the seller crossed the spread.
fn aggressor(is_buyer_maker: bool) -> Side {
    if is_buyer_maker { Side::Sell } else { Side::Buy }
}

/// Klines arrive as heterogeneous arrays:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
pub fn parse_kline(row: &[serde_json::Value], symbol: &Symbol, interval: Interval) -> ExchangeResult<Candle> {
    let decimal_at = |idx: usize| -> ExchangeResult<Decimal> {
        row.get(idx)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| ExchangeError::Parse(format!("kline field {} missing", idx)))
    };
    let open_time = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ExchangeError::Parse("kline open time missing".into()))?;

    Ok(Candle {
        symbol: symbol.clone(),
        interval,
        open_time: utc_from_millis(open_time),
        open: decimal_at(1)?,
        high: decimal_at(2)?,
        low: decimal_at(3)?,
        close: decimal_at(4)?,
        volume: decimal_at(5)?,
    })
}

#[derive(Debug, Deserialize)]
pub struct RestFill {
    pub commission: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestOrder {
    pub symbol: String,
    pub order_id: u64,
    pub client_order_id: String,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub time: Option<i64>,
    pub update_time: Option<i64>,
    pub transact_time: Option<i64>,
    #[serde(default)]
    pub fills: Vec<RestFill>,
}

impl RestOrder {
    pub fn to_model(&self, exchange: &str) -> ExchangeResult<ExchangeOrder> {
        let created = self.time.or(self.transact_time).unwrap_or_default();
        let updated = self.update_time.or(self.transact_time).unwrap_or(created);
        let avg_fill_price = if self.executed_qty.is_zero() {
            None
        } else {
            Some(self.cummulative_quote_qty / self.executed_qty)
        };

        Ok(ExchangeOrder {
            exchange: exchange.to_string(),
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id.clone(),
            symbol: Symbol::new(&self.symbol),
            side: parse_side(&self.side)?,
            order_type: parse_order_type(&self.order_type)?,
            status: parse_status(&self.status)?,
            quantity: self.orig_qty,
            price: (!self.price.is_zero()).then_some(self.price),
            filled_quantity: self.executed_qty,
            avg_fill_price,
            commission: self.fills.iter().map(|f| f.commission).sum(),
            created_at: utc_from_millis(created),
            updated_at: utc_from_millis(updated),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RestBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    pub balances: Vec<RestBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeFee {
    pub symbol: String,
    pub maker_commission: Decimal,
    pub taker_commission: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

// --- WebSocket ---

/// Envelope of the combined `/stream` endpoint.
#[derive(Debug, Deserialize)]
pub struct CombinedFrame {
    pub stream: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct WsTicker {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "P")]
    pub change_pct: Decimal,
    #[serde(rename = "c")]
    pub last_price: Decimal,
    #[serde(rename = "b")]
    pub bid_price: Decimal,
    #[serde(rename = "B")]
    pub bid_qty: Decimal,
    #[serde(rename = "a")]
    pub ask_price: Decimal,
    #[serde(rename = "A")]
    pub ask_qty: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
}

impl WsTicker {
    pub fn to_model(&self, exchange: &str) -> TickerSnapshot {
        TickerSnapshot {
            exchange: exchange.to_string(),
            symbol: Symbol::new(&self.symbol),
            bid_price: self.bid_price,
            bid_qty: self.bid_qty,
            ask_price: self.ask_price,
            ask_qty: self.ask_qty,
            last_price: self.last_price,
            volume_24h: self.volume,
            change_24h_pct: self.change_pct,
            timestamp: utc_from_millis(self.event_time),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsTrade {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl WsTrade {
    pub fn to_model(&self, exchange: &str) -> TradeEvent {
        TradeEvent {
            id: self.trade_id.to_string(),
            exchange: exchange.to_string(),
            symbol: Symbol::new(&self.symbol),
            price: self.price,
            quantity: self.quantity,
            side: aggressor(self.is_buyer_maker),
            timestamp: utc_from_millis(self.trade_time),
        }
    }
}

/// Raw user-data stream payloads, tagged by `e`.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum UserFrame {
    #[serde(rename = "executionReport")]
    ExecutionReport(ExecutionReport),
    #[serde(rename = "outboundAccountPosition")]
    AccountPosition(AccountPosition),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    /// Original client id; set on cancel reports.
    #[serde(rename = "C", default)]
    pub orig_client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "i")]
    pub order_id: u64,
    #[serde(rename = "z")]
    pub cumulative_filled: Decimal,
    #[serde(rename = "Z")]
    pub cumulative_quote: Decimal,
    #[serde(rename = "n")]
    pub commission: Decimal,
    #[serde(rename = "O")]
    pub created_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
}

impl ExecutionReport {
    pub fn to_model(&self, exchange: &str) -> ExchangeResult<ExchangeOrder> {
        let client_order_id = if self.orig_client_order_id.is_empty() {
            self.client_order_id.clone()
        } else {
            self.orig_client_order_id.clone()
        };
        let avg_fill_price = if self.cumulative_filled.is_zero() {
            None
        } else {
            Some(self.cumulative_quote / self.cumulative_filled)
        };
        Ok(ExchangeOrder {
            exchange: exchange.to_string(),
            order_id: self.order_id.to_string(),
            client_order_id,
            symbol: Symbol::new(&self.symbol),
            side: parse_side(&self.side)?,
            order_type: parse_order_type(&self.order_type)?,
            status: parse_status(&self.status)?,
            quantity: self.quantity,
            price: (!self.price.is_zero()).then_some(self.price),
            filled_quantity: self.cumulative_filled,
            avg_fill_price,
            commission: self.commission,
            created_at: utc_from_millis(self.created_time),
            updated_at: utc_from_millis(self.transaction_time),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountPosition {
    #[serde(rename = "B")]
    pub balances: Vec<WsBalance>,
}

#[derive(Debug, Deserialize)]
pub struct WsBalance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "f")]
    pub free: Decimal,
    #[serde(rename = "l")]
    pub locked: Decimal,
}

impl From<&WsBalance> for Balance {
    fn from(b: &WsBalance) -> Self {
        Balance {
            asset: b.asset.clone(),
            free: b.free,
            locked: b.locked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ws_ticker_parse() {
        let raw = r#"{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","p":"10","P":"1.25",
            "c":"42000.10","Q":"0.1","b":"42000.00","B":"1.5","a":"42000.20","A":"0.7",
            "o":"41000","h":"42500","l":"40900","v":"1234.5","q":"5000000"}"#;
        let ticker: WsTicker = serde_json::from_str(raw).unwrap();
        let model = ticker.to_model("binance");
        assert_eq!(model.symbol.as_str(), "BTCUSDT");
        assert_eq!(model.bid_price, dec!(42000.00));
        assert_eq!(model.ask_qty, dec!(0.7));
        assert_eq!(model.change_24h_pct, dec!(1.25));
    }

    #[test]
    fn test_execution_report_uses_original_client_id_on_cancel() {
        let raw = r#"{"e":"executionReport","E":1,"s":"ETHUSDT","c":"cancel-1","C":"nx-42",
            "S":"SELL","o":"LIMIT","q":"2","p":"2000","X":"CANCELED","i":99,"z":"0.5",
            "Z":"1000","n":"0","O":10,"T":20}"#;
        match serde_json::from_str::<UserFrame>(raw).unwrap() {
            UserFrame::ExecutionReport(report) => {
                let order = report.to_model("binance").unwrap();
                assert_eq!(order.client_order_id, "nx-42");
                assert_eq!(order.status, OrderStatus::Canceled);
                assert_eq!(order.avg_fill_price, Some(dec!(2000)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_user_frame_is_ignored() {
        let frame: UserFrame = serde_json::from_str(r#"{"e":"listStatus","E":1}"#).unwrap();
        assert!(matches!(frame, UserFrame::Other));
    }

    #[test]
    fn test_rest_order_average_price() {
        let raw = r#"{"symbol":"BTCUSDT","orderId":7,"clientOrderId":"nx-1","price":"0.00000000",
            "origQty":"0.5","executedQty":"0.5","cummulativeQuoteQty":"21000","status":"FILLED",
            "type":"MARKET","side":"BUY","transactTime":1700000000000,
            "fills":[{"price":"42000","qty":"0.5","commission":"0.0005","commissionAsset":"BTC"}]}"#;
        let order: RestOrder = serde_json::from_str(raw).unwrap();
        let model = order.to_model("binance").unwrap();
        assert_eq!(model.avg_fill_price, Some(dec!(42000)));
        assert_eq!(model.price, None);
        assert_eq!(model.commission, dec!(0.0005));
    }

    #[test]
    fn test_kline_row() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000,"1.0","2.0","0.5","1.5","100",1700000059999,"150",10,"50","75","0"]"#,
        )
        .unwrap();
        let candle = parse_kline(&row, &Symbol::new("BTCUSDT"), Interval::OneMinute).unwrap();
        assert_eq!(candle.high, dec!(2.0));
        assert_eq!(candle.volume, dec!(100));
    }
}
