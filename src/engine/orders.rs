use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::TimeProvider;
use crate::events::{EngineEvent, EventSink};
use crate::exchange::adapter::ExchangeError;
use crate::model::{ExchangeOrder, OrderStatus};
use crate::order_fsm::{AppliedUpdate, OrderRecord};
use crate::risk::RiskGate;

#[derive(Default)]
struct Book {
    /// Keyed by client order id.
    orders: HashMap<String, OrderRecord>,
    /// (exchange, exchange order id) -> client order id.
    by_exchange_id: HashMap<(String, String), String>,
}

/// Engine-side order records. Folds adapter reports through the order FSM
/// and keeps the risk gate's reservations in step with fills and terminal
/// states.
pub struct OrderTracker {
    book: Mutex<Book>,
    risk: Arc<RiskGate>,
    sink: Arc<dyn EventSink>,
    time: Arc<dyn TimeProvider>,
}

impl OrderTracker {
    pub fn new(risk: Arc<RiskGate>, sink: Arc<dyn EventSink>, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            risk,
            sink,
            time,
        }
    }

    /// Track an order the exchange accepted and fold in its acknowledgement.
    pub fn record_submitted(&self, record: OrderRecord, ack: &ExchangeOrder) {
        let client_id = record.client_order_id().to_string();
        info!(
            bot_id = %record.bot_id,
            client_order_id = %client_id,
            exchange = %record.exchange,
            order_id = %ack.order_id,
            "📤 Order accepted"
        );
        self.emit_transition(&record, None, OrderStatus::New);
        {
            let mut book = self.book.lock();
            if !ack.order_id.is_empty() {
                book.by_exchange_id
                    .insert((record.exchange.clone(), ack.order_id.clone()), client_id.clone());
            }
            book.orders.insert(client_id, record);
        }
        self.apply_update(ack);
    }

    /// Track a submission that never reached a live order. The record ends
    /// Rejected and its risk reservation is released.
    pub fn record_failed(&self, mut record: OrderRecord, error: &ExchangeError) {
        let client_id = record.client_order_id().to_string();
        warn!(
            bot_id = %record.bot_id,
            client_order_id = %client_id,
            exchange = %record.exchange,
            "❌ Order submission failed: {}",
            error
        );
        self.emit_transition(&record, None, OrderStatus::New);
        if record.transition(OrderStatus::Rejected, self.time.now()).is_ok() {
            self.emit_transition(&record, Some(OrderStatus::New), OrderStatus::Rejected);
        }
        self.book.lock().orders.insert(client_id.clone(), record);
        self.risk.release(&client_id);
    }

    /// Fold an adapter status report into the matching record. Returns `None`
    /// for unknown orders, duplicates and illegal transitions.
    pub fn apply_update(&self, update: &ExchangeOrder) -> Option<AppliedUpdate> {
        let (applied, record) = {
            let mut book = self.book.lock();
            let client_id = if book.orders.contains_key(&update.client_order_id) {
                update.client_order_id.clone()
            } else {
                book.by_exchange_id
                    .get(&(update.exchange.clone(), update.order_id.clone()))
                    .cloned()?
            };
            let record = book.orders.get_mut(&client_id)?;
            let applied = match record.apply_exchange_update(update) {
                Ok(Some(applied)) => applied,
                Ok(None) => return None,
                Err(e) => {
                    debug!(client_order_id = %client_id, "Ignoring order update: {}", e);
                    return None;
                }
            };
            let record = record.clone();
            if let Some(order_id) = &record.order_id {
                book.by_exchange_id
                    .insert((record.exchange.clone(), order_id.clone()), client_id);
            }
            (applied, record)
        };

        let client_id = record.client_order_id();
        if !applied.fill_delta.is_zero() {
            self.risk
                .on_fill(client_id, &record.intent.symbol, record.intent.side, applied.fill_delta);
        }
        if record.is_terminal() {
            self.risk.release(client_id);
        }
        if applied.from != applied.to || applied.to == OrderStatus::PartiallyFilled {
            self.emit_transition(&record, Some(applied.from), applied.to);
        }
        Some(applied)
    }

    pub fn get(&self, client_order_id: &str) -> Option<OrderRecord> {
        self.book.lock().orders.get(client_order_id).cloned()
    }

    /// All records, oldest first.
    pub fn all(&self) -> Vec<OrderRecord> {
        let mut orders: Vec<OrderRecord> = self.book.lock().orders.values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    pub fn open_count(&self) -> usize {
        self.book
            .lock()
            .orders
            .values()
            .filter(|o| !o.is_terminal())
            .count()
    }

    fn emit_transition(&self, record: &OrderRecord, from: Option<OrderStatus>, to: OrderStatus) {
        self.sink.emit(EngineEvent::OrderTransition {
            bot_id: record.bot_id.clone(),
            client_order_id: record.client_order_id().to_string(),
            exchange: record.exchange.clone(),
            symbol: record.intent.symbol.clone(),
            from,
            to,
            filled_quantity: record.filled_quantity,
            timestamp: record.updated_at,
        });
    }
}
