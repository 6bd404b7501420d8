pub mod exposure;
pub mod gate;
pub mod limits;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::Symbol;

pub use exposure::{ExposureBook, SymbolExposure};
pub use gate::{RiskContext, RiskGate};
pub use limits::RiskLimits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskRejectionReason {
    Halted(String),
    InvalidQuantity(Decimal),
    DuplicateClientId(String),
    SymbolNotAllowed(Symbol),
    StaleMarketData(Symbol),
    NoReferencePrice(Symbol),
    PriceDeviation {
        price: Decimal,
        reference: Decimal,
        deviation_bps: Decimal,
        limit_bps: u32,
    },
    BotFailures {
        failures: u32,
        limit: u32,
    },
    LeverageExceeded {
        requested: Decimal,
        limit: Decimal,
    },
    PositionLimit {
        symbol: Symbol,
        projected: Decimal,
        limit: Decimal,
    },
    OrderNotionalLimit {
        notional: Decimal,
        limit: Decimal,
    },
    ExposureLimit {
        symbol: Symbol,
        projected_notional: Decimal,
        limit: Decimal,
    },
    ReduceOnlyViolation(Symbol),
    ReduceOnlyClamped {
        symbol: Symbol,
        reducible: Decimal,
    },
}

impl fmt::Display for RiskRejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halted(reason) => write!(f, "Trading halted: {}", reason),
            Self::InvalidQuantity(q) => write!(f, "Invalid quantity {} (<= 0)", q),
            Self::DuplicateClientId(id) => write!(f, "Client order id '{}' already reserved", id),
            Self::SymbolNotAllowed(s) => write!(f, "Symbol '{}' not in whitelist", s),
            Self::StaleMarketData(s) => write!(f, "Market data for {} is stale", s),
            Self::NoReferencePrice(s) => write!(f, "No reference price for {}", s),
            Self::PriceDeviation {
                price,
                reference,
                deviation_bps,
                limit_bps,
            } => write!(
                f,
                "Price {} deviates {:.1} bps from reference {} (limit {} bps)",
                price, deviation_bps, reference, limit_bps
            ),
            Self::BotFailures { failures, limit } => write!(
                f,
                "Bot has {} consecutive failures (limit {}), reduce-only",
                failures, limit
            ),
            Self::LeverageExceeded { requested, limit } => {
                write!(f, "Leverage {:.2}x exceeds limit {:.2}x", requested, limit)
            }
            Self::PositionLimit {
                symbol,
                projected,
                limit,
            } => write!(
                f,
                "Position cap for {}: projected {} > limit {}",
                symbol, projected, limit
            ),
            Self::OrderNotionalLimit { notional, limit } => write!(
                f,
                "Order notional {:.2} exceeds limit {:.2}",
                notional, limit
            ),
            Self::ExposureLimit {
                symbol,
                projected_notional,
                limit,
            } => write!(
                f,
                "Exposure cap for {}: projected {:.2} > limit {:.2}",
                symbol, projected_notional, limit
            ),
            Self::ReduceOnlyViolation(s) => {
                write!(f, "Reduce-only order for {} would not reduce the position", s)
            }
            Self::ReduceOnlyClamped { symbol, reducible } => write!(
                f,
                "Reduce-only order for {} clamped to open position {}",
                symbol, reducible
            ),
        }
    }
}

/// Outcome of evaluating one intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskDecision {
    Allow,
    Deny(RiskRejectionReason),
    Resize {
        quantity: Decimal,
        reason: RiskRejectionReason,
    },
}

impl RiskDecision {
    /// Quantity to submit, or `None` when denied.
    pub fn approved_quantity(&self, requested: Decimal) -> Option<Decimal> {
        match self {
            Self::Allow => Some(requested),
            Self::Resize { quantity, .. } => Some(*quantity),
            Self::Deny(_) => None,
        }
    }

    pub fn verdict(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny(_) => "deny",
            Self::Resize { .. } => "resize",
        }
    }
}

impl fmt::Display for RiskDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("ALLOW"),
            Self::Deny(reason) => write!(f, "DENY ({})", reason),
            Self::Resize { quantity, reason } => write!(f, "RESIZE to {} ({})", quantity, reason),
        }
    }
}
