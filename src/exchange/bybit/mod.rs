//! Bybit v5 adapter (unified account). One instance serves one product
//! category, `linear` by default.

pub mod message;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::exchange::adapter::{
    ExchangeAdapter, ExchangeError, ExchangeResult, PermanentKind, TransientKind,
};
use crate::exchange::sign_hmac_sha256;
use crate::exchange::stats::ConnectionStats;
use crate::exchange::stream::{DEFAULT_STREAM_CAPACITY, MarketStream, stream_channel};
use crate::exchange::ws::{SocketConfig, SocketHandler, SocketSession, TopicRoutes};
use crate::model::{
    AdvancedOrder, Balance, Candle, ConnectionHealth, ExchangeOrder, Interval, OrderBookSnapshot,
    OrderRequest, OrderStatus, OrderType, PositionRisk, Side, Symbol, TickerSnapshot, TimeInForce,
    TradeEvent, TradingFees, UserDataEvent,
};
use crate::rate_limiter::TokenBucket;

use message::{
    BookData, Envelope, FeeRate, ListResult, OpReply, OrderAck, OrderItem, PositionItem,
    RestTrade, ServerTime, TickerFields, TickerState, TopicFrame, WalletAccount, WsTrade,
};

const REST_URL: &str = "https://api.bybit.com";
const REST_TESTNET_URL: &str = "https://api-testnet.bybit.com";
const WS_URL: &str = "wss://stream.bybit.com/v5";
const WS_TESTNET_URL: &str = "wss://stream-testnet.bybit.com/v5";

const PING_INTERVAL: Duration = Duration::from_secs(20);
const USER_TOPIC: &str = "user";

struct Credentials {
    api_key: String,
    secret: String,
}

pub struct BybitAdapter {
    name: String,
    category: String,
    credentials: Option<Arc<Credentials>>,
    rest_url: String,
    ws_url: String,
    recv_window_ms: u64,
    stream_capacity: usize,
    client: Client,
    limiter: TokenBucket,
    stats: Arc<ConnectionStats>,
    market: Arc<PublicHandler>,
    public_socket: Mutex<Option<Arc<SocketSession>>>,
    user_routes: Arc<TopicRoutes<UserDataEvent>>,
    private_socket: Mutex<Option<Arc<SocketSession>>>,
}

impl BybitAdapter {
    pub fn new(name: &str, config: &ExchangeConfig) -> Self {
        let name = name.to_lowercase();
        let credentials = match (config.api_key_for(&name), config.api_secret_for(&name)) {
            (Some(api_key), Some(secret)) => Some(Arc::new(Credentials { api_key, secret })),
            _ => {
                info!("🔓 {} has no API credentials; private endpoints disabled", name);
                None
            }
        };
        let category = config
            .category
            .clone()
            .unwrap_or_else(|| "linear".to_string())
            .to_lowercase();

        let (default_rest, default_ws) = if config.testnet {
            (REST_TESTNET_URL, WS_TESTNET_URL)
        } else {
            (REST_URL, WS_URL)
        };

        // v5 allows 10-20 req/s per endpoint group for most accounts.
        let rate = config.rate_limit.unwrap_or(10) as f64;
        let burst = config.burst.unwrap_or(20) as usize;
        let stats = Arc::new(ConnectionStats::new());

        Self {
            market: Arc::new(PublicHandler::new(&name, category == "spot", stats.clone())),
            name,
            category,
            credentials,
            rest_url: config.rest_url.clone().unwrap_or_else(|| default_rest.to_string()),
            ws_url: config.ws_url.clone().unwrap_or_else(|| default_ws.to_string()),
            recv_window_ms: config.recv_window_ms.unwrap_or(5_000),
            stream_capacity: config.stream_capacity.unwrap_or(DEFAULT_STREAM_CAPACITY),
            client: Client::new(),
            limiter: TokenBucket::new(burst, rate),
            stats,
            public_socket: Mutex::new(None),
            user_routes: Arc::new(TopicRoutes::default()),
            private_socket: Mutex::new(None),
        }
    }

    fn credentials(&self) -> ExchangeResult<Arc<Credentials>> {
        self.credentials.clone().ok_or_else(|| {
            ExchangeError::Configuration(format!("{} API key/secret not configured", self.name))
        })
    }

    fn ensure_connected(&self) -> ExchangeResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ExchangeError::Connection(format!("{} is not connected", self.name)))
        }
    }

    /// Sends a request and unwraps the `{retCode, retMsg, result}` envelope.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        signed: bool,
    ) -> ExchangeResult<T> {
        self.limiter.acquire(1).await;

        let query_string = serde_urlencoded::to_string(query)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let url = if query_string.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, query_string)
        };

        let mut request = self.client.request(method, &url);
        let body_string = body.map(Value::to_string).unwrap_or_default();
        if signed {
            let creds = self.credentials()?;
            let timestamp = Utc::now().timestamp_millis().to_string();
            let payload = if body.is_some() { &body_string } else { &query_string };
            let sign_input = format!(
                "{}{}{}{}",
                timestamp, creds.api_key, self.recv_window_ms, payload
            );
            request = request
                .header("X-BAPI-API-KEY", &creds.api_key)
                .header("X-BAPI-TIMESTAMP", timestamp)
                .header("X-BAPI-SIGN", sign_hmac_sha256(&creds.secret, &sign_input)?)
                .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string());
        }
        if body.is_some() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_string);
        }

        let started = Instant::now();
        let response = request.send().await.inspect_err(|e| {
            self.stats.record_error(e.to_string());
        })?;
        self.stats.record_latency(started.elapsed());

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let err = ExchangeError::from_http_status(status.as_u16(), &text);
            self.stats.record_error(err.to_string());
            return Err(err);
        }

        // Errors carry `result: {}`, so the code is checked before typing the result.
        let envelope: Envelope = serde_json::from_str(&text)?;
        if envelope.ret_code != 0 {
            let err = classify_ret_code(envelope.ret_code, &envelope.ret_msg);
            self.stats.record_error(err.to_string());
            return Err(err);
        }
        Ok(serde_json::from_value(envelope.result)?)
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ExchangeResult<T> {
        self.request(Method::GET, path, query, None, false).await
    }

    async fn signed_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ExchangeResult<T> {
        self.request(Method::GET, path, query, None, true).await
    }

    async fn signed_post<T: DeserializeOwned>(&self, path: &str, body: Value) -> ExchangeResult<T> {
        self.request(Method::POST, path, &[], Some(&body), true).await
    }

    fn base_query(&self, symbol: &Symbol) -> Vec<(&'static str, String)> {
        vec![
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
        ]
    }

    /// Open-order and position queries need either a symbol or a settle coin
    /// outside spot.
    fn scope_query(&self, symbol: Option<&Symbol>) -> Vec<(&'static str, String)> {
        let mut query = vec![("category", self.category.clone())];
        match symbol {
            Some(s) => query.push(("symbol", s.to_string())),
            None if self.category != "spot" => query.push(("settleCoin", "USDT".to_string())),
            None => {}
        }
        query
    }

    fn route_public(&self, route: &str, first: bool) {
        if !first {
            return;
        }
        let mut guard = self.public_socket.lock();
        match guard.as_ref() {
            Some(socket) => socket.send(subscribe_frame("subscribe", &self.market.upstream(route))),
            // A fresh session subscribes every routed topic on connect.
            None => {
                *guard = Some(Arc::new(SocketSession::spawn(
                    SocketConfig {
                        name: self.name.clone(),
                        url: format!("{}/public/{}", self.ws_url, self.category),
                        heartbeat: PING_INTERVAL,
                    },
                    self.market.clone(),
                    self.stats.clone(),
                )));
            }
        }
    }

    fn ensure_private_socket(&self) -> ExchangeResult<()> {
        let credentials = self.credentials()?;
        let mut guard = self.private_socket.lock();
        if guard.is_none() {
            let handler = Arc::new(PrivateHandler {
                exchange: self.name.clone(),
                credentials,
                routes: self.user_routes.clone(),
            });
            *guard = Some(Arc::new(SocketSession::spawn(
                SocketConfig {
                    name: format!("{}-private", self.name),
                    url: format!("{}/private", self.ws_url),
                    heartbeat: PING_INTERVAL,
                },
                handler,
                self.stats.clone(),
            )));
            info!("👤 {} private stream started", self.name);
        }
        Ok(())
    }

    pub(crate) fn order_body(&self, request: &OrderRequest) -> ExchangeResult<Value> {
        let mut body = Map::new();
        body.insert("category".into(), json!(self.category));
        body.insert("symbol".into(), json!(request.symbol.as_str()));
        body.insert("side".into(), json!(message::side_param(request.side)));
        body.insert("qty".into(), json!(request.quantity.normalize().to_string()));
        if !request.client_order_id.is_empty() {
            body.insert("orderLinkId".into(), json!(request.client_order_id));
        }
        if request.reduce_only && self.category != "spot" {
            body.insert("reduceOnly".into(), json!(true));
        }

        let limit_order = |body: &mut Map<String, Value>, price: Decimal| {
            body.insert("orderType".into(), json!("Limit"));
            body.insert("price".into(), json!(price.normalize().to_string()));
            body.insert("timeInForce".into(), json!(tif_param(request.time_in_force)));
        };

        let (trigger, limit, take_profit) = match &request.advanced {
            Some(AdvancedOrder::StopLoss {
                trigger_price,
                limit_price,
            }) => (Some(*trigger_price), *limit_price, false),
            Some(AdvancedOrder::TakeProfit {
                trigger_price,
                limit_price,
            }) => (Some(*trigger_price), *limit_price, true),
            Some(AdvancedOrder::Iceberg { .. }) | Some(AdvancedOrder::Twap { .. }) => {
                return Err(ExchangeError::unsupported(
                    "iceberg and TWAP orders are not supported on Bybit",
                ));
            }
            None => match request.order_type {
                OrderType::Market => (None, None, false),
                OrderType::Limit => (None, Some(require_price(request)?), false),
                OrderType::StopLoss | OrderType::TakeProfit => {
                    (Some(require_stop(request)?), None, request.order_type == OrderType::TakeProfit)
                }
                OrderType::StopLossLimit | OrderType::TakeProfitLimit => (
                    Some(require_stop(request)?),
                    Some(require_price(request)?),
                    request.order_type == OrderType::TakeProfitLimit,
                ),
            },
        };

        match limit {
            Some(price) => limit_order(&mut body, price),
            None => {
                body.insert("orderType".into(), json!("Market"));
            }
        }

        if let Some(trigger_price) = trigger {
            // 1 = fire when price rises to the trigger, 2 = when it falls.
            let rising = match (request.side, take_profit) {
                (Side::Sell, false) | (Side::Buy, true) => 2,
                (Side::Buy, false) | (Side::Sell, true) => 1,
            };
            body.insert("triggerPrice".into(), json!(trigger_price.normalize().to_string()));
            body.insert("triggerDirection".into(), json!(rising));
            if self.category == "spot" {
                body.insert("orderFilter".into(), json!("StopOrder"));
            }
        }
        Ok(Value::Object(body))
    }

    async fn find_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        let mut query = self.base_query(symbol);
        query.push(order_ref(order_id));
        let result: ListResult<OrderItem> = self.signed_get("/v5/order/realtime", &query).await?;
        match result.list.first() {
            Some(item) => item.to_model(&self.name),
            None => {
                let mut query = self.base_query(symbol);
                query.push(order_ref(order_id));
                let history: ListResult<OrderItem> =
                    self.signed_get("/v5/order/history", &query).await?;
                history
                    .list
                    .first()
                    .ok_or_else(|| {
                        ExchangeError::permanent(PermanentKind::OrderNotFound, order_id.to_string())
                    })?
                    .to_model(&self.name)
            }
        }
    }
}

fn tif_param(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GoodTillCancel => "GTC",
        TimeInForce::ImmediateOrCancel => "IOC",
        TimeInForce::FillOrKill => "FOK",
        TimeInForce::PostOnly => "PostOnly",
    }
}

fn require_price(request: &OrderRequest) -> ExchangeResult<Decimal> {
    request.price.ok_or_else(|| {
        ExchangeError::permanent(PermanentKind::InvalidOrder, "limit order without price")
    })
}

fn require_stop(request: &OrderRequest) -> ExchangeResult<Decimal> {
    request.stop_price.ok_or_else(|| {
        ExchangeError::permanent(PermanentKind::InvalidOrder, "trigger order without stop price")
    })
}

/// Client ids assigned by the engine carry a prefix; venue ids are bare.
fn order_ref(order_id: &str) -> (&'static str, String) {
    if order_id.contains('-') && !looks_like_uuid(order_id) {
        ("orderLinkId", order_id.to_string())
    } else {
        ("orderId", order_id.to_string())
    }
}

/// Bybit derivatives order ids are UUIDs (8-4-4-4-12 hex).
fn looks_like_uuid(raw: &str) -> bool {
    let parts: Vec<&str> = raw.split('-').collect();
    parts.len() == 5
        && parts
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(p, len)| p.len() == len && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn classify_ret_code(code: i64, msg: &str) -> ExchangeError {
    let text = format!("{} (retCode {})", msg, code);
    match code {
        10006 | 10018 => ExchangeError::transient(TransientKind::RateLimited, text),
        10002 => ExchangeError::transient(TransientKind::Timeout, text),
        10016 | 10019 => ExchangeError::transient(TransientKind::Unavailable, text),
        10003 | 10004 | 10005 | 10007 | 10010 => {
            ExchangeError::permanent(PermanentKind::Authentication, text)
        }
        10001 => ExchangeError::permanent(PermanentKind::InvalidOrder, text),
        110001 | 170213 => ExchangeError::permanent(PermanentKind::OrderNotFound, text),
        110004 | 110007 | 110012 | 170131 => {
            ExchangeError::permanent(PermanentKind::InsufficientBalance, text)
        }
        110003 | 110017 | 170136 | 170137 => ExchangeError::permanent(PermanentKind::InvalidOrder, text),
        _ if msg.to_lowercase().contains("symbol") => {
            ExchangeError::permanent(PermanentKind::InvalidSymbol, text)
        }
        _ => ExchangeError::permanent(PermanentKind::Rejected, text),
    }
}

fn subscribe_frame(op: &str, topics: &[String]) -> String {
    json!({ "op": op, "args": topics }).to_string()
}

fn route_symbol(route: &str) -> &str {
    route.rsplit('.').next().unwrap_or_default()
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> ExchangeResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let time: ServerTime = self.public("/v5/market/time", &[]).await?;
        self.stats.set_connected(true);
        info!(
            "✅ {} REST reachable at {} (server time {}, category {})",
            self.name, self.rest_url, time.time_second, self.category
        );
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.stats.set_connected(false);
        let public = self.public_socket.lock().take();
        if let Some(socket) = public {
            socket.shutdown().await;
        }
        let private = self.private_socket.lock().take();
        if let Some(socket) = private {
            socket.shutdown().await;
        }
        self.market.clear();
        self.user_routes.clear();
        info!("🔌 {} disconnected", self.name);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stats.is_connected()
    }

    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<TickerSnapshot> {
        self.ensure_connected()?;
        let result: ListResult<TickerFields> =
            self.public("/v5/market/tickers", &self.base_query(symbol)).await?;
        let fields = result.list.first().ok_or_else(|| {
            ExchangeError::permanent(PermanentKind::InvalidSymbol, symbol.to_string())
        })?;
        let mut state = TickerState::default();
        state.apply(fields);
        Ok(state.to_model(&self.name, symbol.clone(), Utc::now().timestamp_millis()))
    }

    async fn order_book(&self, symbol: &Symbol, depth: usize) -> ExchangeResult<OrderBookSnapshot> {
        self.ensure_connected()?;
        let cap = if self.category == "spot" { 200 } else { 500 };
        let mut query = self.base_query(symbol);
        query.push(("limit", depth.clamp(1, cap).to_string()));
        let data: BookData = self.public("/v5/market/orderbook", &query).await?;
        let mut book = data.to_model(&self.name, true, Utc::now().timestamp_millis());
        book.truncate(depth);
        Ok(book)
    }

    async fn recent_trades(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<TradeEvent>> {
        self.ensure_connected()?;
        let mut query = self.base_query(symbol);
        query.push(("limit", limit.clamp(1, 1000).to_string()));
        let result: ListResult<RestTrade> = self.public("/v5/market/recent-trade", &query).await?;
        result.list.iter().map(|t| t.to_model(&self.name)).collect()
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.ensure_connected()?;
        let mut query = self.base_query(symbol);
        query.push(("interval", message::interval_param(interval).to_string()));
        query.push(("limit", limit.clamp(1, 1000).to_string()));
        let result: ListResult<Vec<String>> = self.public("/v5/market/kline", &query).await?;
        let mut candles = result
            .list
            .iter()
            .map(|row| message::parse_kline(row, symbol, interval))
            .collect::<ExchangeResult<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn subscribe_ticker(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TickerSnapshot>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        let route = format!("tickers.{}", symbol);
        let first = self.market.tickers.add(&route, tx);
        self.route_public(&route, first);
        Ok(rx)
    }

    async fn subscribe_order_book(
        &self,
        symbol: &Symbol,
    ) -> ExchangeResult<MarketStream<OrderBookSnapshot>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        let route = format!("orderbook.50.{}", symbol);
        let first = self.market.books.add(&route, tx);
        self.route_public(&route, first);
        Ok(rx)
    }

    async fn subscribe_trades(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TradeEvent>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        let route = format!("publicTrade.{}", symbol);
        let first = self.market.trades.add(&route, tx);
        self.route_public(&route, first);
        Ok(rx)
    }

    async fn subscribe_user_data(&self) -> ExchangeResult<MarketStream<UserDataEvent>> {
        self.ensure_connected()?;
        self.credentials()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        self.user_routes.add(USER_TOPIC, tx);
        self.ensure_private_socket()?;
        Ok(rx)
    }

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        let body = self.order_body(&request)?;
        let ack: OrderAck = self.signed_post("/v5/order/create", body).await?;
        info!(
            "📤 {} accepted {} {:?} {} {} (order {})",
            self.name, request.client_order_id, request.side, request.quantity, request.symbol, ack.order_id
        );

        // Creation only acknowledges; fills arrive on the private stream.
        let now = Utc::now();
        Ok(ExchangeOrder {
            exchange: self.name.clone(),
            order_id: ack.order_id,
            client_order_id: if ack.order_link_id.is_empty() {
                request.client_order_id
            } else {
                ack.order_link_id
            },
            symbol: request.symbol,
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
        })
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        let (key, value) = order_ref(order_id);
        let body = json!({
            "category": self.category,
            "symbol": symbol.as_str(),
            key: value,
        });
        let _: OrderAck = self.signed_post("/v5/order/cancel", body).await?;

        let mut order = self.find_order(symbol, order_id).await?;
        if !matches!(
            order.status,
            OrderStatus::Canceled | OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Expired
        ) {
            order.status = OrderStatus::PendingCancel;
        }
        Ok(order)
    }

    async fn cancel_all_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let open = self.open_orders(Some(symbol)).await?;
        if open.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "category": self.category, "symbol": symbol.as_str() });
        let result: ListResult<OrderAck> = self.signed_post("/v5/order/cancel-all", body).await?;
        let canceled: HashSet<String> = result.list.into_iter().map(|a| a.order_id).collect();

        Ok(open
            .into_iter()
            .filter(|o| canceled.contains(&o.order_id))
            .map(|mut o| {
                o.status = OrderStatus::Canceled;
                o.updated_at = Utc::now();
                o
            })
            .collect())
    }

    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        self.find_order(symbol, order_id).await
    }

    async fn open_orders(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let mut query = self.scope_query(symbol);
        query.push(("openOnly", "0".to_string()));
        let result: ListResult<OrderItem> = self.signed_get("/v5/order/realtime", &query).await?;
        result.list.iter().map(|o| o.to_model(&self.name)).collect()
    }

    async fn order_history(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let mut query = self.base_query(symbol);
        query.push(("limit", limit.clamp(1, 50).to_string()));
        let result: ListResult<OrderItem> = self.signed_get("/v5/order/history", &query).await?;
        result.list.iter().map(|o| o.to_model(&self.name)).collect()
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        self.ensure_connected()?;
        let result: ListResult<WalletAccount> = self
            .signed_get("/v5/account/wallet-balance", &[("accountType", "UNIFIED".to_string())])
            .await?;
        Ok(result
            .list
            .iter()
            .flat_map(|account| account.coin.iter().map(|c| c.to_model()))
            .filter(|b| !b.total().is_zero())
            .collect())
    }

    async fn trading_fees(&self, symbol: &Symbol) -> ExchangeResult<TradingFees> {
        self.ensure_connected()?;
        let result: ListResult<FeeRate> = self
            .signed_get("/v5/account/fee-rate", &self.base_query(symbol))
            .await?;
        let fee = result
            .list
            .into_iter()
            .find(|f| Symbol::new(&f.symbol) == *symbol)
            .ok_or_else(|| {
                ExchangeError::permanent(PermanentKind::InvalidSymbol, symbol.to_string())
            })?;
        Ok(TradingFees {
            symbol: symbol.clone(),
            maker_rate: fee.maker_fee_rate,
            taker_rate: fee.taker_fee_rate,
        })
    }

    async fn position_risk(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<PositionRisk>> {
        self.ensure_connected()?;
        if self.category == "spot" {
            return Ok(Vec::new());
        }
        let result: ListResult<PositionItem> = self
            .signed_get("/v5/position/list", &self.scope_query(symbol))
            .await?;
        Ok(result
            .list
            .iter()
            .filter_map(|p| p.to_model(&self.name))
            .collect())
    }

    fn health(&self) -> ConnectionHealth {
        self.stats.snapshot(&self.name)
    }
}

/// Routes public topic pushes. Spot has no touch in `tickers.*`, so a spot
/// ticker route also listens to `orderbook.1.*`.
struct PublicHandler {
    exchange: String,
    spot: bool,
    stats: Arc<ConnectionStats>,
    tickers: TopicRoutes<TickerSnapshot>,
    books: TopicRoutes<OrderBookSnapshot>,
    trades: TopicRoutes<TradeEvent>,
    ticker_state: Mutex<HashMap<String, TickerState>>,
}

impl PublicHandler {
    fn new(exchange: &str, spot: bool, stats: Arc<ConnectionStats>) -> Self {
        Self {
            exchange: exchange.to_string(),
            spot,
            stats,
            tickers: TopicRoutes::default(),
            books: TopicRoutes::default(),
            trades: TopicRoutes::default(),
            ticker_state: Mutex::new(HashMap::new()),
        }
    }

    /// Upstream topics backing a route.
    fn upstream(&self, route: &str) -> Vec<String> {
        let mut topics = vec![route.to_string()];
        if self.spot && route.starts_with("tickers.") {
            topics.push(format!("orderbook.1.{}", route_symbol(route)));
        }
        topics
    }

    fn clear(&self) {
        self.tickers.clear();
        self.books.clear();
        self.trades.clear();
        self.ticker_state.lock().clear();
    }

    fn publish_ticker(&self, symbol: &str, ts: i64, update: impl FnOnce(&mut TickerState)) -> bool {
        let snapshot = {
            let mut states = self.ticker_state.lock();
            let state = states.entry(symbol.to_string()).or_default();
            update(state);
            state.to_model(&self.exchange, Symbol::new(symbol), ts)
        };
        self.tickers.publish(&format!("tickers.{}", symbol), snapshot)
    }

    /// Returns the route that lost its last subscriber, if any.
    fn dispatch(&self, frame: TopicFrame) -> ExchangeResult<Option<String>> {
        let topic = frame.topic.as_str();
        let symbol = route_symbol(topic).to_string();

        if topic.starts_with("tickers.") {
            let snapshot = frame.is_snapshot();
            let fields: TickerFields = serde_json::from_value(frame.data)?;
            if snapshot {
                self.ticker_state.lock().remove(&symbol);
            }
            let lag = Utc::now().timestamp_millis() - frame.ts;
            if lag >= 0 {
                self.stats.record_latency(Duration::from_millis(lag as u64));
            }
            let live = self.publish_ticker(&symbol, frame.ts, |s| s.apply(&fields));
            return Ok((!live).then(|| format!("tickers.{}", symbol)));
        }
        if topic.starts_with("orderbook.1.") && self.spot {
            let book: BookData = serde_json::from_value(frame.data)?;
            let live = self.publish_ticker(&symbol, frame.ts, |s| s.apply_top_of_book(&book));
            return Ok((!live).then(|| format!("tickers.{}", symbol)));
        }
        if topic.starts_with("orderbook.") {
            let is_snapshot = frame.is_snapshot();
            let book: BookData = serde_json::from_value(frame.data)?;
            let snapshot = book.to_model(&self.exchange, is_snapshot, frame.ts);
            let live = self.books.publish(topic, snapshot);
            return Ok((!live).then(|| topic.to_string()));
        }
        if topic.starts_with("publicTrade.") {
            let trades: Vec<WsTrade> = serde_json::from_value(frame.data)?;
            let mut live = true;
            for trade in &trades {
                live = self.trades.publish(topic, trade.to_model(&self.exchange)?);
                if !live {
                    break;
                }
            }
            return Ok((!live).then(|| topic.to_string()));
        }
        debug!("Ignoring unrouted topic {}", topic);
        Ok(None)
    }
}

impl SocketHandler for PublicHandler {
    fn on_connect(&self) -> Vec<String> {
        let mut topics = Vec::new();
        for route in self
            .tickers
            .topics()
            .into_iter()
            .chain(self.books.topics())
            .chain(self.trades.topics())
        {
            topics.extend(self.upstream(&route));
        }
        if topics.is_empty() {
            return Vec::new();
        }
        // Spot accepts at most 10 args per request.
        topics
            .chunks(10)
            .map(|chunk| subscribe_frame("subscribe", chunk))
            .collect()
    }

    fn on_text(&self, text: &str) -> Vec<String> {
        if let Ok(frame) = serde_json::from_str::<TopicFrame>(text) {
            let topic = frame.topic.clone();
            return match self.dispatch(frame) {
                Ok(None) => Vec::new(),
                Ok(Some(route)) => {
                    debug!("No subscribers left for {}; unsubscribing", route);
                    vec![subscribe_frame("unsubscribe", &self.upstream(&route))]
                }
                Err(e) => {
                    warn!("⚠️ {} failed to parse {}: {}", self.exchange, topic, e);
                    self.stats.record_error(e.to_string());
                    Vec::new()
                }
            };
        }
        match serde_json::from_str::<OpReply>(text) {
            Ok(reply) if reply.success == Some(false) => warn!(
                "⚠️ {} rejected '{}': {}",
                self.exchange,
                reply.op,
                reply.ret_msg.unwrap_or_default()
            ),
            _ => {}
        }
        Vec::new()
    }

    fn ping(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }
}

struct PrivateHandler {
    exchange: String,
    credentials: Arc<Credentials>,
    routes: Arc<TopicRoutes<UserDataEvent>>,
}

impl SocketHandler for PrivateHandler {
    fn on_connect(&self) -> Vec<String> {
        let expires = Utc::now().timestamp_millis() + 10_000;
        let signature = match sign_hmac_sha256(
            &self.credentials.secret,
            &format!("GET/realtime{}", expires),
        ) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("⚠️ {} cannot sign private auth: {}", self.exchange, e);
                return Vec::new();
            }
        };
        vec![
            json!({ "op": "auth", "args": [self.credentials.api_key, expires, signature] })
                .to_string(),
            subscribe_frame("subscribe", &["order".to_string(), "wallet".to_string()]),
        ]
    }

    fn on_text(&self, text: &str) -> Vec<String> {
        if let Ok(frame) = serde_json::from_str::<TopicFrame>(text) {
            match frame.topic.as_str() {
                "order" => match serde_json::from_value::<Vec<OrderItem>>(frame.data) {
                    Ok(items) => {
                        for item in items {
                            match item.to_model(&self.exchange) {
                                Ok(order) => {
                                    self.routes.publish(USER_TOPIC, UserDataEvent::Order(order));
                                }
                                Err(e) => warn!("⚠️ {} order update rejected: {}", self.exchange, e),
                            }
                        }
                    }
                    Err(e) => warn!("⚠️ {} unreadable order update: {}", self.exchange, e),
                },
                "wallet" => match serde_json::from_value::<Vec<WalletAccount>>(frame.data) {
                    Ok(accounts) => {
                        for coin in accounts.iter().flat_map(|a| a.coin.iter()) {
                            self.routes
                                .publish(USER_TOPIC, UserDataEvent::Balance(coin.to_model()));
                        }
                    }
                    Err(e) => warn!("⚠️ {} unreadable wallet update: {}", self.exchange, e),
                },
                other => debug!("Ignoring private topic {}", other),
            }
            return Vec::new();
        }
        if let Ok(reply) = serde_json::from_str::<OpReply>(text) {
            match (reply.op.as_str(), reply.success) {
                ("auth", Some(true)) => info!("🔐 {} private stream authenticated", self.exchange),
                (op, Some(false)) => warn!(
                    "⚠️ {} private '{}' failed: {}",
                    self.exchange,
                    op,
                    reply.ret_msg.unwrap_or_default()
                ),
                _ => {}
            }
        }
        Vec::new()
    }

    fn ping(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }
}
