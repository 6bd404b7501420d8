//! Binance spot adapter: signed REST (`/api/v3`) plus combined-stream and
//! listen-key WebSockets.

pub mod message;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::exchange::adapter::{
    ExchangeAdapter, ExchangeError, ExchangeResult, PermanentKind, TransientKind,
};
use crate::exchange::stats::ConnectionStats;
use crate::exchange::stream::{DEFAULT_STREAM_CAPACITY, MarketStream, stream_channel};
use crate::exchange::ws::{SocketConfig, SocketHandler, SocketSession, TopicRoutes};
use crate::exchange::sign_hmac_sha256;
use crate::model::{
    AdvancedOrder, Balance, Candle, ConnectionHealth, ExchangeOrder, Interval, OrderBookSnapshot,
    OrderRequest, OrderType, PositionRisk, Side, Symbol, TickerSnapshot, TimeInForce, TradeEvent,
    TradingFees, UserDataEvent,
};
use crate::rate_limiter::TokenBucket;

use message::{
    AccountInfo, ApiError, CombinedFrame, Depth, ListenKey, RestOrder, RestTicker, RestTrade,
    TradeFee, UserFrame, WsTicker, WsTrade,
};

const REST_URL: &str = "https://api.binance.com";
const REST_TESTNET_URL: &str = "https://testnet.binance.vision";
const WS_URL: &str = "wss://stream.binance.com:9443";
const WS_TESTNET_URL: &str = "wss://testnet.binance.vision";

const TICKER_SUFFIX: &str = "@ticker";
const DEPTH_SUFFIX: &str = "@depth20@100ms";
const TRADE_SUFFIX: &str = "@trade";

const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);
const SOCKET_HEARTBEAT: Duration = Duration::from_secs(30);

struct Credentials {
    api_key: String,
    secret: String,
}

struct UserSession {
    socket: Arc<SocketSession>,
    keepalive: JoinHandle<()>,
}

pub struct BinanceAdapter {
    name: String,
    credentials: Option<Credentials>,
    rest_url: String,
    ws_url: String,
    recv_window_ms: u64,
    stream_capacity: usize,
    client: Client,
    limiter: TokenBucket,
    stats: Arc<ConnectionStats>,
    market: Arc<MarketHandler>,
    market_socket: Mutex<Option<Arc<SocketSession>>>,
    user_routes: Arc<TopicRoutes<UserDataEvent>>,
    user_session: Mutex<Option<UserSession>>,
}

impl BinanceAdapter {
    pub fn new(name: &str, config: &ExchangeConfig) -> Self {
        let name = name.to_lowercase();
        let credentials = match (config.api_key_for(&name), config.api_secret_for(&name)) {
            (Some(api_key), Some(secret)) => Some(Credentials { api_key, secret }),
            _ => {
                info!("🔓 {} has no API credentials; private endpoints disabled", name);
                None
            }
        };

        let (default_rest, default_ws) = if config.testnet {
            (REST_TESTNET_URL, WS_TESTNET_URL)
        } else {
            (REST_URL, WS_URL)
        };
        let rest_url = config.rest_url.clone().unwrap_or_else(|| default_rest.to_string());
        let ws_url = config.ws_url.clone().unwrap_or_else(|| default_ws.to_string());

        // Spot weight budget is 6000/min; 20 req/s with a burst of 50 stays well inside it.
        let rate = config.rate_limit.unwrap_or(20) as f64;
        let burst = config.burst.unwrap_or(50) as usize;
        let stats = Arc::new(ConnectionStats::new());

        Self {
            market: Arc::new(MarketHandler::new(&name, stats.clone())),
            name,
            credentials,
            rest_url,
            ws_url,
            recv_window_ms: config.recv_window_ms.unwrap_or(5_000),
            stream_capacity: config.stream_capacity.unwrap_or(DEFAULT_STREAM_CAPACITY),
            client: Client::new(),
            limiter: TokenBucket::new(burst, rate),
            stats,
            market_socket: Mutex::new(None),
            user_routes: Arc::new(TopicRoutes::default()),
            user_session: Mutex::new(None),
        }
    }

    fn credentials(&self) -> ExchangeResult<&Credentials> {
        self.credentials.as_ref().ok_or_else(|| {
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

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        api_key: Option<&str>,
    ) -> ExchangeResult<T> {
        self.limiter.acquire(1).await;

        let mut request = self.client.request(method, &url);
        if let Some(key) = api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let started = Instant::now();
        let response = request.send().await.inspect_err(|e| {
            self.stats.record_error(e.to_string());
        })?;
        self.stats.record_latency(started.elapsed());

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let err = classify_error(status.as_u16(), &body);
            self.stats.record_error(err.to_string());
            return Err(err);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let query = serde_urlencoded::to_string(params)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let url = if query.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, query)
        };
        self.execute(Method::GET, url, None).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        let creds = self.credentials()?;
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let signature = sign_hmac_sha256(&creds.secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.rest_url, path, query, signature);
        self.execute(method, url, Some(&creds.api_key)).await
    }

    fn ensure_market_socket(&self) -> bool {
        let mut guard = self.market_socket.lock();
        if guard.is_some() {
            return false;
        }
        let config = SocketConfig {
            name: self.name.clone(),
            url: format!("{}/stream", self.ws_url),
            heartbeat: SOCKET_HEARTBEAT,
        };
        *guard = Some(Arc::new(SocketSession::spawn(
            config,
            self.market.clone(),
            self.stats.clone(),
        )));
        true
    }

    /// Register a market-data subscriber and subscribe upstream when it is
    /// the first one for the stream.
    fn route_topic(&self, topic: String, first: bool) {
        if !first {
            return;
        }
        let spawned = self.ensure_market_socket();
        // A fresh session subscribes every routed topic on connect.
        if !spawned {
            let socket = self.market_socket.lock().clone();
            if let Some(socket) = socket {
                socket.send(self.market.subscribe_frame(&[topic]));
            }
        }
    }

    async fn start_user_stream(&self) -> ExchangeResult<()> {
        if self.user_session.lock().is_some() {
            return Ok(());
        }
        let creds = self.credentials()?;
        let url = format!("{}/api/v3/userDataStream", self.rest_url);
        let key: ListenKey = self
            .execute(Method::POST, url.clone(), Some(&creds.api_key))
            .await?;

        let handler = Arc::new(UserHandler {
            exchange: self.name.clone(),
            routes: self.user_routes.clone(),
        });
        let socket = Arc::new(SocketSession::spawn(
            SocketConfig {
                name: format!("{}-user", self.name),
                url: format!("{}/ws/{}", self.ws_url, key.listen_key),
                heartbeat: SOCKET_HEARTBEAT,
            },
            handler,
            self.stats.clone(),
        ));

        let client = self.client.clone();
        let api_key = creds.api_key.clone();
        let keepalive_url = format!("{}?listenKey={}", url, key.listen_key);
        let keepalive = tokio::spawn(async move {
            let mut ticker = interval(LISTEN_KEY_KEEPALIVE);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match client
                    .put(&keepalive_url)
                    .header("X-MBX-APIKEY", &api_key)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => debug!("Listen key refreshed"),
                    Ok(resp) => warn!("⚠️ Listen key keepalive rejected: {}", resp.status()),
                    Err(e) => warn!("⚠️ Listen key keepalive failed: {}", e),
                }
            }
        });

        let raced = {
            let mut guard = self.user_session.lock();
            if guard.is_some() {
                Some(keepalive)
            } else {
                *guard = Some(UserSession {
                    socket: socket.clone(),
                    keepalive,
                });
                None
            }
        };
        // Lost a race with a concurrent subscriber; keep theirs.
        if let Some(keepalive) = raced {
            keepalive.abort();
            socket.shutdown().await;
            return Ok(());
        }
        info!("👤 {} user data stream started", self.name);
        Ok(())
    }
}

/// Binance reports failures as `{"code": -XXXX, "msg": "..."}`.
fn classify_error(status: u16, body: &str) -> ExchangeError {
    let Ok(api) = serde_json::from_str::<ApiError>(body) else {
        return ExchangeError::from_http_status(status, body);
    };
    let msg = format!("{} ({})", api.msg, api.code);
    match api.code {
        -1003 | -1015 => ExchangeError::transient(TransientKind::RateLimited, msg),
        -1001 | -1006 | -1007 | -1021 => ExchangeError::transient(TransientKind::Timeout, msg),
        -1121 => ExchangeError::permanent(PermanentKind::InvalidSymbol, msg),
        -2010 if api.msg.to_lowercase().contains("insufficient") => {
            ExchangeError::permanent(PermanentKind::InsufficientBalance, msg)
        }
        -2010 => ExchangeError::permanent(PermanentKind::Rejected, msg),
        -2011 | -2013 => ExchangeError::permanent(PermanentKind::OrderNotFound, msg),
        -2014 | -2015 | -1022 => ExchangeError::permanent(PermanentKind::Authentication, msg),
        -1013 | -1100 | -1102 | -1106 | -1111 | -1116 | -1117 => {
            ExchangeError::permanent(PermanentKind::InvalidOrder, msg)
        }
        _ => ExchangeError::from_http_status(status, &msg),
    }
}

fn side_param(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn tif_param(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::ImmediateOrCancel => "IOC",
        TimeInForce::FillOrKill => "FOK",
        TimeInForce::GoodTillCancel | TimeInForce::PostOnly => "GTC",
    }
}

fn require_price(request: &OrderRequest) -> ExchangeResult<Decimal> {
    request.price.ok_or_else(|| {
        ExchangeError::permanent(PermanentKind::InvalidOrder, "limit order without price")
    })
}

fn push_trigger(
    params: &mut Vec<(&'static str, String)>,
    request: &OrderRequest,
    kind: &str,
    trigger_price: Decimal,
    limit: Option<Decimal>,
) {
    params.push(("stopPrice", trigger_price.normalize().to_string()));
    match limit {
        Some(price) => {
            params.push(("type", format!("{}_LIMIT", kind)));
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", tif_param(request.time_in_force).to_string()));
        }
        None => params.push(("type", kind.to_string())),
    }
}

/// Translate a request into `POST /api/v3/order` parameters. Advanced shapes
/// map onto native order types where Binance has one.
pub(crate) fn order_params(request: &OrderRequest) -> ExchangeResult<Vec<(&'static str, String)>> {
    let mut params = vec![
        ("symbol", request.symbol.to_string()),
        ("side", side_param(request.side).to_string()),
        ("quantity", request.quantity.normalize().to_string()),
        ("newOrderRespType", "FULL".to_string()),
    ];
    if !request.client_order_id.is_empty() {
        params.push(("newClientOrderId", request.client_order_id.clone()));
    }

    match &request.advanced {
        Some(AdvancedOrder::StopLoss {
            trigger_price,
            limit_price,
        }) => push_trigger(&mut params, request, "STOP_LOSS", *trigger_price, *limit_price),
        Some(AdvancedOrder::TakeProfit {
            trigger_price,
            limit_price,
        }) => push_trigger(&mut params, request, "TAKE_PROFIT", *trigger_price, *limit_price),
        Some(AdvancedOrder::Iceberg { visible_quantity }) => {
            let price = require_price(request)?;
            params.push(("type", "LIMIT".to_string()));
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            params.push(("icebergQty", visible_quantity.normalize().to_string()));
        }
        Some(AdvancedOrder::Twap { .. }) => {
            return Err(ExchangeError::unsupported("TWAP orders are not supported on Binance spot"));
        }
        None => match request.order_type {
            OrderType::Market => params.push(("type", "MARKET".to_string())),
            OrderType::Limit => {
                let price = require_price(request)?;
                params.push(("price", price.normalize().to_string()));
                if request.time_in_force == TimeInForce::PostOnly {
                    params.push(("type", "LIMIT_MAKER".to_string()));
                } else {
                    params.push(("type", "LIMIT".to_string()));
                    params.push(("timeInForce", tif_param(request.time_in_force).to_string()));
                }
            }
            OrderType::StopLoss | OrderType::TakeProfit | OrderType::StopLossLimit | OrderType::TakeProfitLimit => {
                let stop = request.stop_price.ok_or_else(|| {
                    ExchangeError::permanent(PermanentKind::InvalidOrder, "trigger order without stop price")
                })?;
                let kind = match request.order_type {
                    OrderType::StopLoss | OrderType::StopLossLimit => "STOP_LOSS",
                    _ => "TAKE_PROFIT",
                };
                let limit = match request.order_type {
                    OrderType::StopLossLimit | OrderType::TakeProfitLimit => Some(require_price(request)?),
                    _ => None,
                };
                push_trigger(&mut params, request, kind, stop, limit);
            }
        },
    }
    Ok(params)
}

/// Numeric ids go out as `orderId`, anything else as the client id.
fn order_ref(order_id: &str) -> (&'static str, String) {
    if order_id.parse::<u64>().is_ok() {
        ("orderId", order_id.to_string())
    } else {
        ("origClientOrderId", order_id.to_string())
    }
}

fn stream_name(symbol: &Symbol, suffix: &str) -> String {
    format!("{}{}", symbol.as_str().to_lowercase(), suffix)
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> ExchangeResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _: serde_json::Value = self.public("/api/v3/ping", &[]).await?;
        self.stats.set_connected(true);
        info!("✅ {} REST reachable at {}", self.name, self.rest_url);
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.stats.set_connected(false);

        let market = self.market_socket.lock().take();
        if let Some(socket) = market {
            socket.shutdown().await;
        }
        let user = self.user_session.lock().take();
        if let Some(session) = user {
            session.keepalive.abort();
            session.socket.shutdown().await;
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
        let raw: RestTicker = self
            .public("/api/v3/ticker/24hr", &[("symbol", symbol.to_string())])
            .await?;
        Ok(raw.to_model(&self.name))
    }

    async fn order_book(&self, symbol: &Symbol, depth: usize) -> ExchangeResult<OrderBookSnapshot> {
        self.ensure_connected()?;
        let raw: Depth = self
            .public(
                "/api/v3/depth",
                &[("symbol", symbol.to_string()), ("limit", depth.clamp(1, 5000).to_string())],
            )
            .await?;
        let mut book = raw.to_model(&self.name, symbol.clone());
        book.truncate(depth);
        Ok(book)
    }

    async fn recent_trades(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<TradeEvent>> {
        self.ensure_connected()?;
        let raw: Vec<RestTrade> = self
            .public(
                "/api/v3/trades",
                &[("symbol", symbol.to_string()), ("limit", limit.clamp(1, 1000).to_string())],
            )
            .await?;
        Ok(raw.iter().map(|t| t.to_model(&self.name, symbol)).collect())
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.ensure_connected()?;
        let rows: Vec<Vec<serde_json::Value>> = self
            .public(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.as_str().to_string()),
                    ("limit", limit.clamp(1, 1000).to_string()),
                ],
            )
            .await?;
        rows.iter()
            .map(|row| message::parse_kline(row, symbol, interval))
            .collect()
    }

    async fn subscribe_ticker(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TickerSnapshot>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        let topic = stream_name(symbol, TICKER_SUFFIX);
        let first = self.market.tickers.add(&topic, tx);
        self.route_topic(topic, first);
        Ok(rx)
    }

    async fn subscribe_order_book(
        &self,
        symbol: &Symbol,
    ) -> ExchangeResult<MarketStream<OrderBookSnapshot>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        let topic = stream_name(symbol, DEPTH_SUFFIX);
        let first = self.market.books.add(&topic, tx);
        self.route_topic(topic, first);
        Ok(rx)
    }

    async fn subscribe_trades(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TradeEvent>> {
        self.ensure_connected()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        let topic = stream_name(symbol, TRADE_SUFFIX);
        let first = self.market.trades.add(&topic, tx);
        self.route_topic(topic, first);
        Ok(rx)
    }

    async fn subscribe_user_data(&self) -> ExchangeResult<MarketStream<UserDataEvent>> {
        self.ensure_connected()?;
        self.credentials()?;
        let (tx, rx) = stream_channel(self.stream_capacity);
        self.user_routes.add(USER_TOPIC, tx);
        self.start_user_stream().await?;
        Ok(rx)
    }

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        let params = order_params(&request)?;
        let raw: RestOrder = self.signed(Method::POST, "/api/v3/order", params).await?;
        let order = raw.to_model(&self.name)?;
        info!(
            "📤 {} accepted {} {:?} {} {} -> {}",
            self.name, order.client_order_id, order.side, order.quantity, order.symbol, order.status
        );
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        let params = vec![("symbol", symbol.to_string()), order_ref(order_id)];
        let raw: RestOrder = self.signed(Method::DELETE, "/api/v3/order", params).await?;
        raw.to_model(&self.name)
    }

    async fn cancel_all_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let params = vec![("symbol", symbol.to_string())];
        let raw: Vec<serde_json::Value> =
            match self.signed(Method::DELETE, "/api/v3/openOrders", params).await {
                Ok(raw) => raw,
                // Nothing open is reported as "unknown order".
                Err(ExchangeError::Permanent {
                    kind: PermanentKind::OrderNotFound,
                    ..
                }) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
        // OCO lists come back as separate entries without an orderId.
        raw.into_iter()
            .filter(|v| v.get("orderId").is_some())
            .map(|v| serde_json::from_value::<RestOrder>(v)?.to_model(&self.name))
            .collect()
    }

    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.ensure_connected()?;
        let params = vec![("symbol", symbol.to_string()), order_ref(order_id)];
        let raw: RestOrder = self.signed(Method::GET, "/api/v3/order", params).await?;
        raw.to_model(&self.name)
    }

    async fn open_orders(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let params = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let raw: Vec<RestOrder> = self.signed(Method::GET, "/api/v3/openOrders", params).await?;
        raw.iter().map(|o| o.to_model(&self.name)).collect()
    }

    async fn order_history(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.ensure_connected()?;
        let params = vec![
            ("symbol", symbol.to_string()),
            ("limit", limit.clamp(1, 1000).to_string()),
        ];
        let raw: Vec<RestOrder> = self.signed(Method::GET, "/api/v3/allOrders", params).await?;
        raw.iter().map(|o| o.to_model(&self.name)).collect()
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        self.ensure_connected()?;
        let account: AccountInfo = self.signed(Method::GET, "/api/v3/account", Vec::new()).await?;
        Ok(account
            .balances
            .into_iter()
            .filter(|b| !(b.free + b.locked).is_zero())
            .map(|b| Balance {
                asset: b.asset,
                free: b.free,
                locked: b.locked,
            })
            .collect())
    }

    async fn trading_fees(&self, symbol: &Symbol) -> ExchangeResult<TradingFees> {
        self.ensure_connected()?;
        let fees: Vec<TradeFee> = self
            .signed(
                Method::GET,
                "/sapi/v1/asset/tradeFee",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        let fee = fees
            .into_iter()
            .find(|f| Symbol::new(&f.symbol) == *symbol)
            .ok_or_else(|| {
                ExchangeError::permanent(PermanentKind::InvalidSymbol, symbol.to_string())
            })?;
        Ok(TradingFees {
            symbol: symbol.clone(),
            maker_rate: fee.maker_commission,
            taker_rate: fee.taker_commission,
        })
    }

    async fn position_risk(&self, _symbol: Option<&Symbol>) -> ExchangeResult<Vec<PositionRisk>> {
        Ok(Vec::new())
    }

    fn health(&self) -> ConnectionHealth {
        self.stats.snapshot(&self.name)
    }
}

/// Routes combined-stream frames to subscribers and unsubscribes streams
/// nobody listens to anymore.
struct MarketHandler {
    exchange: String,
    stats: Arc<ConnectionStats>,
    tickers: TopicRoutes<TickerSnapshot>,
    books: TopicRoutes<OrderBookSnapshot>,
    trades: TopicRoutes<TradeEvent>,
    request_id: AtomicU64,
}

impl MarketHandler {
    fn new(exchange: &str, stats: Arc<ConnectionStats>) -> Self {
        Self {
            exchange: exchange.to_string(),
            stats,
            tickers: TopicRoutes::default(),
            books: TopicRoutes::default(),
            trades: TopicRoutes::default(),
            request_id: AtomicU64::new(1),
        }
    }

    fn frame(&self, method: &str, topics: &[String]) -> String {
        json!({
            "method": method,
            "params": topics,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        })
        .to_string()
    }

    fn subscribe_frame(&self, topics: &[String]) -> String {
        self.frame("SUBSCRIBE", topics)
    }

    fn clear(&self) {
        self.tickers.clear();
        self.books.clear();
        self.trades.clear();
    }

    /// Returns false when the stream has no subscribers left.
    fn dispatch(&self, frame: CombinedFrame) -> ExchangeResult<bool> {
        let stream = frame.stream.as_str();
        if stream.ends_with(TICKER_SUFFIX) {
            let ticker: WsTicker = serde_json::from_value(frame.data)?;
            let snapshot = ticker.to_model(&self.exchange);
            self.observe_latency(snapshot.timestamp.timestamp_millis());
            Ok(self.tickers.publish(stream, snapshot))
        } else if stream.ends_with(DEPTH_SUFFIX) {
            let depth: Depth = serde_json::from_value(frame.data)?;
            let symbol = Symbol::new(stream.split('@').next().unwrap_or_default());
            Ok(self.books.publish(stream, depth.to_model(&self.exchange, symbol)))
        } else if stream.ends_with(TRADE_SUFFIX) {
            let trade: WsTrade = serde_json::from_value(frame.data)?;
            Ok(self.trades.publish(stream, trade.to_model(&self.exchange)))
        } else {
            debug!("Ignoring unrouted stream {}", stream);
            Ok(true)
        }
    }

    fn observe_latency(&self, event_ms: i64) {
        let lag = Utc::now().timestamp_millis() - event_ms;
        if lag >= 0 {
            self.stats.record_latency(Duration::from_millis(lag as u64));
        }
    }
}

impl SocketHandler for MarketHandler {
    fn on_connect(&self) -> Vec<String> {
        let mut topics = self.tickers.topics();
        topics.extend(self.books.topics());
        topics.extend(self.trades.topics());
        if topics.is_empty() {
            return Vec::new();
        }
        vec![self.subscribe_frame(&topics)]
    }

    fn on_text(&self, text: &str) -> Vec<String> {
        // Subscription acks look like {"result":null,"id":1}.
        let Ok(frame) = serde_json::from_str::<CombinedFrame>(text) else {
            return Vec::new();
        };
        let stream = frame.stream.clone();
        match self.dispatch(frame) {
            Ok(true) => Vec::new(),
            Ok(false) => {
                debug!("No subscribers left for {}; unsubscribing", stream);
                vec![self.frame("UNSUBSCRIBE", &[stream])]
            }
            Err(e) => {
                warn!("⚠️ {} failed to parse {}: {}", self.exchange, stream, e);
                self.stats.record_error(e.to_string());
                Vec::new()
            }
        }
    }
}

const USER_TOPIC: &str = "user";

struct UserHandler {
    exchange: String,
    routes: Arc<TopicRoutes<UserDataEvent>>,
}

impl SocketHandler for UserHandler {
    fn on_connect(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_text(&self, text: &str) -> Vec<String> {
        match serde_json::from_str::<UserFrame>(text) {
            Ok(UserFrame::ExecutionReport(report)) => match report.to_model(&self.exchange) {
                Ok(order) => {
                    self.routes.publish(USER_TOPIC, UserDataEvent::Order(order));
                }
                Err(e) => warn!("⚠️ {} execution report rejected: {}", self.exchange, e),
            },
            Ok(UserFrame::AccountPosition(position)) => {
                for balance in &position.balances {
                    self.routes
                        .publish(USER_TOPIC, UserDataEvent::Balance(balance.into()));
                }
            }
            Ok(UserFrame::Other) => {}
            Err(e) => warn!("⚠️ {} unreadable user frame: {}", self.exchange, e),
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderIntent;
    use rust_decimal_macros::dec;

    fn param<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_limit_params() {
        let intent = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(0.5), dec!(42000.50))
            .with_client_id("nx-1");
        let params = order_params(&OrderRequest::from_intent(&intent, dec!(0.5))).unwrap();
        assert_eq!(param(&params, "type"), Some("LIMIT"));
        assert_eq!(param(&params, "price"), Some("42000.5"));
        assert_eq!(param(&params, "timeInForce"), Some("GTC"));
        assert_eq!(param(&params, "newClientOrderId"), Some("nx-1"));
    }

    #[test]
    fn test_post_only_becomes_limit_maker() {
        let mut intent = OrderIntent::limit("BTCUSDT", Side::Sell, dec!(1), dec!(100));
        intent.time_in_force = TimeInForce::PostOnly;
        let params = order_params(&OrderRequest::from_intent(&intent, dec!(1))).unwrap();
        assert_eq!(param(&params, "type"), Some("LIMIT_MAKER"));
        assert_eq!(param(&params, "timeInForce"), None);
    }

    #[test]
    fn test_advanced_mappings() {
        let stop = OrderIntent::market("ETHUSDT", Side::Sell, dec!(2)).with_advanced(
            AdvancedOrder::StopLoss {
                trigger_price: dec!(1900),
                limit_price: Some(dec!(1890)),
            },
        );
        let params = order_params(&OrderRequest::from_intent(&stop, dec!(2))).unwrap();
        assert_eq!(param(&params, "type"), Some("STOP_LOSS_LIMIT"));
        assert_eq!(param(&params, "stopPrice"), Some("1900"));
        assert_eq!(param(&params, "price"), Some("1890"));

        let iceberg = OrderIntent::limit("ETHUSDT", Side::Buy, dec!(10), dec!(2000))
            .with_advanced(AdvancedOrder::Iceberg {
                visible_quantity: dec!(1),
            });
        let params = order_params(&OrderRequest::from_intent(&iceberg, dec!(10))).unwrap();
        assert_eq!(param(&params, "icebergQty"), Some("1"));

        let twap = OrderIntent::market("ETHUSDT", Side::Buy, dec!(1)).with_advanced(
            AdvancedOrder::Twap {
                duration_secs: 60,
                slices: 6,
            },
        );
        let err = order_params(&OrderRequest::from_intent(&twap, dec!(1))).unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Permanent {
                kind: PermanentKind::Unsupported,
                ..
            }
        ));
    }

    #[test]
    fn test_error_code_classification() {
        let rate = classify_error(429, r#"{"code":-1003,"msg":"Too many requests"}"#);
        assert!(rate.is_retryable());

        let funds = classify_error(
            400,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        );
        assert!(matches!(
            funds,
            ExchangeError::Permanent {
                kind: PermanentKind::InsufficientBalance,
                ..
            }
        ));

        let unknown = classify_error(502, "<html>bad gateway</html>");
        assert!(unknown.is_retryable());
    }

    #[test]
    fn test_order_ref_picks_id_kind() {
        assert_eq!(order_ref("12345").0, "orderId");
        assert_eq!(order_ref("nx-00000001").0, "origClientOrderId");
    }

    #[tokio::test]
    async fn test_market_handler_routes_and_unsubscribes() {
        let handler = MarketHandler::new("binance", Arc::new(ConnectionStats::new()));
        let (tx, mut rx) = stream_channel(8);
        assert!(handler.trades.add("btcusdt@trade", tx));
        assert_eq!(handler.on_connect().len(), 1);

        let frame = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1,"s":"BTCUSDT",
            "t":5,"p":"42000","q":"0.1","T":1700000000000,"m":true,"M":true}}"#;
        assert!(handler.on_text(frame).is_empty());
        let trade = rx.recv().await.unwrap();
        assert_eq!(trade.side, Side::Sell);

        drop(rx);
        let replies = handler.on_text(frame);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("UNSUBSCRIBE"));
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let adapter = BinanceAdapter::new("binance", &ExchangeConfig::default());
        assert!(matches!(
            adapter.ticker(&Symbol::new("BTCUSDT")).await,
            Err(ExchangeError::Connection(_))
        ));
        assert!(matches!(
            adapter.balances().await,
            Err(ExchangeError::Connection(_))
        ));
    }
}
