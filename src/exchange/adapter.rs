use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::exchange::stream::MarketStream;
use crate::model::{
    Balance, Candle, ConnectionHealth, ExchangeOrder, Interval, OrderBookSnapshot, OrderRequest,
    PositionRisk, Symbol, TickerSnapshot, TradeEvent, TradingFees, UserDataEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransientKind {
    RateLimited,
    Timeout,
    Network,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PermanentKind {
    InvalidSymbol,
    InvalidOrder,
    InsufficientBalance,
    OrderNotFound,
    Unsupported,
    Authentication,
    Rejected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Transient error ({kind:?}): {message}")]
    Transient { kind: TransientKind, message: String },
    #[error("Permanent error ({kind:?}): {message}")]
    Permanent { kind: PermanentKind, message: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::transient(TransientKind::Network, err.to_string())
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::Unsupported, what)
    }

    /// Connection and transient failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Transient { .. })
    }

    /// Maps a non-success HTTP status to the taxonomy. Venue-specific error
    /// codes are resolved by each adapter before falling back to this.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            429 | 418 => Self::transient(TransientKind::RateLimited, body),
            408 | 504 => Self::transient(TransientKind::Timeout, body),
            500..=599 => Self::transient(TransientKind::Unavailable, body),
            401 | 403 => Self::permanent(PermanentKind::Authentication, body),
            404 => Self::permanent(PermanentKind::OrderNotFound, body),
            _ => Self::permanent(PermanentKind::Rejected, format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transient(TransientKind::Timeout, err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::network(err)
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Uniform capability set every exchange integration provides.
///
/// Implementations own their REST/WebSocket details, signing and rate
/// limiting. All methods must be safe to call concurrently.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable lowercase identifier (e.g. "binance"), used as the registry key
    /// and in aggregated views.
    fn name(&self) -> &str;

    // --- Connection lifecycle (idempotent) ---

    async fn connect(&self) -> ExchangeResult<()>;

    async fn disconnect(&self) -> ExchangeResult<()>;

    fn is_connected(&self) -> bool;

    // --- Market data reads ---

    async fn ticker(&self, symbol: &Symbol) -> ExchangeResult<TickerSnapshot>;

    async fn order_book(&self, symbol: &Symbol, depth: usize) -> ExchangeResult<OrderBookSnapshot>;

    async fn recent_trades(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<TradeEvent>>;

    async fn candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    // --- Streaming ---

    async fn subscribe_ticker(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TickerSnapshot>>;

    async fn subscribe_order_book(
        &self,
        symbol: &Symbol,
    ) -> ExchangeResult<MarketStream<OrderBookSnapshot>>;

    async fn subscribe_trades(&self, symbol: &Symbol) -> ExchangeResult<MarketStream<TradeEvent>>;

    async fn subscribe_user_data(&self) -> ExchangeResult<MarketStream<UserDataEvent>>;

    // --- Orders ---

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<ExchangeOrder>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder>;

    /// Returns the orders that were canceled.
    async fn cancel_all_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>>;

    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<ExchangeOrder>;

    async fn open_orders(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<ExchangeOrder>>;

    async fn order_history(&self, symbol: &Symbol, limit: usize) -> ExchangeResult<Vec<ExchangeOrder>>;

    // --- Account ---

    async fn balances(&self) -> ExchangeResult<Vec<Balance>>;

    async fn trading_fees(&self, symbol: &Symbol) -> ExchangeResult<TradingFees>;

    /// Margin/derivatives venues only; spot adapters return an empty list.
    async fn position_risk(&self, symbol: Option<&Symbol>) -> ExchangeResult<Vec<PositionRisk>>;

    // --- Self-reported metrics ---

    fn health(&self) -> ConnectionHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert!(ExchangeError::from_http_status(429, "slow down").is_retryable());
        assert!(ExchangeError::from_http_status(503, "maintenance").is_retryable());
        assert!(!ExchangeError::from_http_status(400, "bad qty").is_retryable());
        assert!(matches!(
            ExchangeError::from_http_status(401, "bad key"),
            ExchangeError::Permanent {
                kind: PermanentKind::Authentication,
                ..
            }
        ));
    }

    #[test]
    fn test_retryable_taxonomy() {
        assert!(ExchangeError::Connection("refused".into()).is_retryable());
        assert!(ExchangeError::transient(TransientKind::Timeout, "t").is_retryable());
        assert!(!ExchangeError::permanent(PermanentKind::InvalidSymbol, "x").is_retryable());
        assert!(!ExchangeError::Parse("junk".into()).is_retryable());
    }
}
