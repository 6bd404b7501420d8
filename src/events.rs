//! Structured engine events for persistence and monitoring collaborators.
//!
//! Emission never blocks and never fails the caller; sinks that cannot keep
//! up drop events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::engine::bot::BotPerformance;
use crate::model::{ConnectionHealth, OrderStatus, Symbol};
use crate::risk::RiskDecision;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderTransition {
        bot_id: String,
        client_order_id: String,
        exchange: String,
        symbol: Symbol,
        from: Option<OrderStatus>,
        to: OrderStatus,
        filled_quantity: Decimal,
        timestamp: DateTime<Utc>,
    },
    RiskDecision {
        bot_id: String,
        client_order_id: String,
        symbol: Symbol,
        requested: Decimal,
        decision: RiskDecision,
        timestamp: DateTime<Utc>,
    },
    ConnectionHealth(ConnectionHealth),
    BotPaused {
        bot_id: String,
        consecutive_failures: u32,
        reason: String,
    },
    BotResumed {
        bot_id: String,
    },
    BotPerformance {
        bot_id: String,
        performance: BotPerformance,
    },
    ExecutionFailed {
        bot_id: String,
        error: String,
    },
    ExecutionAbandoned {
        bot_id: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::OrderTransition {
                bot_id,
                client_order_id,
                from,
                to,
                filled_quantity,
                ..
            } => info!(
                bot_id = %bot_id,
                client_order_id = %client_order_id,
                from = ?from,
                to = %to,
                filled = %filled_quantity,
                "📦 Order transition"
            ),
            EngineEvent::RiskDecision {
                bot_id,
                client_order_id,
                decision,
                ..
            } => info!(
                bot_id = %bot_id,
                client_order_id = %client_order_id,
                decision = %decision,
                "🛡️ Risk decision"
            ),
            EngineEvent::ConnectionHealth(health) => info!(
                exchange = %health.exchange,
                connected = health.connected,
                reconnects = health.reconnect_count,
                dropped = health.messages_dropped,
                p99_ms = health.latency.p99_ms,
                "💓 Connection health"
            ),
            EngineEvent::BotPaused {
                bot_id,
                consecutive_failures,
                reason,
            } => warn!(
                bot_id = %bot_id,
                failures = consecutive_failures,
                "⏸️ Bot paused: {}",
                reason
            ),
            EngineEvent::BotResumed { bot_id } => info!(bot_id = %bot_id, "▶️ Bot resumed"),
            EngineEvent::BotPerformance {
                bot_id,
                performance,
            } => info!(
                bot_id = %bot_id,
                executions = performance.executions,
                failures = performance.failures,
                submitted = performance.orders_submitted,
                denied = performance.orders_denied,
                "📈 Bot performance"
            ),
            EngineEvent::ExecutionFailed { bot_id, error } => {
                warn!(bot_id = %bot_id, "⚠️ Execution failed: {}", error)
            }
            EngineEvent::ExecutionAbandoned { bot_id } => {
                warn!(bot_id = %bot_id, "🛑 Execution abandoned at shutdown")
            }
        }
    }
}

/// Forwards events to a bounded channel, dropping when the consumer lags.
pub struct ChannelSink {
    tx: mpsc::Sender<EngineEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards_and_drops() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.emit(EngineEvent::BotResumed { bot_id: "a".into() });
        sink.emit(EngineEvent::BotResumed { bot_id: "b".into() });
        assert_eq!(sink.dropped(), 1);
        match rx.recv().await {
            Some(EngineEvent::BotResumed { bot_id }) => assert_eq!(bot_id, "a"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_value(EngineEvent::ExecutionAbandoned {
            bot_id: "grid".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "execution_abandoned");
        assert_eq!(json["bot_id"], "grid");
    }
}
