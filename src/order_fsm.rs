/// Order Lifecycle FSM
///
/// Every submitted order is tracked as an `OrderRecord` whose status only moves
/// along the edges below. Updates come from adapter responses and user-data
/// streams; illegal transitions are logged and rejected.
///
/// ```text
///   New → PartiallyFilled → Filled
///    │          │
///    │          ├→ PendingCancel → Canceled
///    │          ├→ Canceled
///    │          └→ Expired
///    ├→ Filled
///    ├→ PendingCancel → Canceled
///    ├→ Canceled
///    ├→ Rejected
///    └→ Expired
///
///   Terminal states: Filled, Canceled, Rejected, Expired
/// ```
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::model::{ExchangeOrder, OrderIntent, OrderStatus};

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    pub fn valid_transitions(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            New => &[PartiallyFilled, Filled, PendingCancel, Canceled, Rejected, Expired],
            PartiallyFilled => &[PartiallyFilled, Filled, PendingCancel, Canceled, Expired],
            // A fill can race a cancel request.
            PendingCancel => &[Canceled, PartiallyFilled, Filled],
            Filled | Canceled | Rejected | Expired => &[],
        }
    }

    pub fn can_transition_to(&self, next: &OrderStatus) -> bool {
        self.valid_transitions().contains(next)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FsmError {
    #[error("illegal transition for {client_order_id}: {from} -> {to}")]
    IllegalTransition {
        client_order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("update for {received} does not belong to order {expected}")]
    Mismatch { expected: String, received: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub filled_quantity: Decimal,
}

/// Engine-side record of one submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub intent: OrderIntent,
    /// Quantity actually requested from the exchange (after any risk resize).
    pub requested_quantity: Decimal,
    pub exchange: String,
    pub bot_id: String,
    pub order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub commission: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Submit → acknowledgement round trip.
    pub latency_ms: Option<i64>,
    pub transitions: Vec<StatusTransition>,
}

/// What changed when an exchange update was folded into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub from: OrderStatus,
    pub to: OrderStatus,
    /// Quantity newly filled by this update.
    pub fill_delta: Decimal,
    pub fill_price: Option<Decimal>,
}

impl OrderRecord {
    pub fn new(
        intent: OrderIntent,
        requested_quantity: Decimal,
        exchange: impl Into<String>,
        bot_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            intent,
            requested_quantity,
            exchange: exchange.into(),
            bot_id: bot_id.into(),
            order_id: None,
            status: OrderStatus::New,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            commission: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            latency_ms: None,
            transitions: Vec::new(),
        }
    }

    pub fn client_order_id(&self) -> &str {
        &self.intent.client_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remaining_quantity(&self) -> Decimal {
        (self.requested_quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    /// Attempt a plain status transition without fill information.
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<(), FsmError> {
        if self.status == next && next != OrderStatus::PartiallyFilled {
            return Ok(());
        }
        if !self.status.can_transition_to(&next) {
            let err = FsmError::IllegalTransition {
                client_order_id: self.intent.client_id.clone(),
                from: self.status,
                to: next,
            };
            error!("{}", err);
            return Err(err);
        }

        debug!(
            client_order_id = %self.intent.client_id,
            symbol = %self.intent.symbol,
            from = %self.status,
            to = %next,
            "Order transition"
        );

        self.transitions.push(StatusTransition {
            from: self.status,
            to: next,
            timestamp: now,
            filled_quantity: self.filled_quantity,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Fold an exchange report into the record.
    ///
    /// Cumulative fills never decrease and are clamped to the requested
    /// quantity. Returns `Ok(None)` when the report carries nothing new.
    pub fn apply_exchange_update(
        &mut self,
        update: &ExchangeOrder,
    ) -> Result<Option<AppliedUpdate>, FsmError> {
        if update.client_order_id != self.intent.client_id
            && self.order_id.as_deref() != Some(update.order_id.as_str())
        {
            return Err(FsmError::Mismatch {
                expected: self.intent.client_id.clone(),
                received: update.client_order_id.clone(),
            });
        }

        if self.order_id.is_none() && !update.order_id.is_empty() {
            self.order_id = Some(update.order_id.clone());
        }

        let mut reported = update.filled_quantity;
        if reported > self.requested_quantity {
            warn!(
                client_order_id = %self.intent.client_id,
                reported = %reported,
                requested = %self.requested_quantity,
                "Exchange reported overfill, clamping"
            );
            reported = self.requested_quantity;
        }
        let fill_delta = (reported - self.filled_quantity).max(Decimal::ZERO);

        // Fully filled quantity implies Filled regardless of what the venue says.
        let mut next = update.status;
        if reported == self.requested_quantity && !reported.is_zero() {
            next = OrderStatus::Filled;
        } else if next == OrderStatus::New && !reported.is_zero() {
            next = OrderStatus::PartiallyFilled;
        }

        if next == self.status && fill_delta.is_zero() {
            return Ok(None);
        }

        let from = self.status;
        if next != self.status || next == OrderStatus::PartiallyFilled {
            self.transition(next, update.updated_at)?;
        }

        if !fill_delta.is_zero() {
            self.filled_quantity = reported;
            if update.avg_fill_price.is_some() {
                self.avg_fill_price = update.avg_fill_price;
            }
        }
        self.commission = self.commission.max(update.commission);
        self.updated_at = update.updated_at;

        Ok(Some(AppliedUpdate {
            from,
            to: self.status,
            fill_delta,
            fill_price: update.avg_fill_price.or(update.price),
        }))
    }
}
