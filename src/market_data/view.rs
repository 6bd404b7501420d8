use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::{Side, Symbol, TickerSnapshot, TradeEvent};

/// Best price on one side of the merged market and the venue quoting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestQuote {
    pub price: Decimal,
    pub quantity: Decimal,
    pub exchange: String,
}

/// Best-of-market view for one symbol, recomputed from the latest ticker
/// of every exchange reporting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedView {
    pub symbol: Symbol,
    pub best_bid: Option<BestQuote>,
    pub best_ask: Option<BestQuote>,
    /// Latest raw ticker per exchange.
    pub tickers: BTreeMap<String, TickerSnapshot>,
    pub last_trade: Option<TradeEvent>,
    pub computed_at: DateTime<Utc>,
    /// True when no exchange has reported within the freshness window.
    pub stale: bool,
}

impl AggregatedView {
    pub fn empty(symbol: Symbol) -> Self {
        Self {
            symbol,
            best_bid: None,
            best_ask: None,
            tickers: BTreeMap::new(),
            last_trade: None,
            computed_at: Utc::now(),
            stale: true,
        }
    }

    pub fn compute(
        symbol: Symbol,
        tickers: BTreeMap<String, TickerSnapshot>,
        last_trade: Option<TradeEvent>,
        stale: bool,
    ) -> Self {
        Self {
            best_bid: best_bid(tickers.values()),
            best_ask: best_ask(tickers.values()),
            symbol,
            tickers,
            last_trade,
            computed_at: Utc::now(),
            stale,
        }
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (&self.best_bid, &self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (&self.best_bid, &self.best_ask) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Price an aggressive order on `side` would trade at: the best ask for
    /// buys, the best bid for sells, falling back to the mid.
    pub fn touch_price(&self, side: Side) -> Option<Decimal> {
        let touch = match side {
            Side::Buy => self.best_ask.as_ref(),
            Side::Sell => self.best_bid.as_ref(),
        };
        touch.map(|q| q.price).or_else(|| self.mid_price())
    }
}

/// Ordering used to rank quotes on one side: better price first, then larger
/// quantity, then the lexicographically smaller exchange name.
fn rank(a: &BestQuote, b: &BestQuote, price_order: Ordering) -> Ordering {
    price_order
        .then_with(|| a.quantity.cmp(&b.quantity))
        .then_with(|| b.exchange.cmp(&a.exchange))
}

pub fn best_bid<'a>(tickers: impl IntoIterator<Item = &'a TickerSnapshot>) -> Option<BestQuote> {
    tickers
        .into_iter()
        .filter(|t| t.bid_price > Decimal::ZERO)
        .map(|t| BestQuote {
            price: t.bid_price,
            quantity: t.bid_qty,
            exchange: t.exchange.clone(),
        })
        .max_by(|a, b| rank(a, b, a.price.cmp(&b.price)))
}

pub fn best_ask<'a>(tickers: impl IntoIterator<Item = &'a TickerSnapshot>) -> Option<BestQuote> {
    tickers
        .into_iter()
        .filter(|t| t.ask_price > Decimal::ZERO)
        .map(|t| BestQuote {
            price: t.ask_price,
            quantity: t.ask_qty,
            exchange: t.exchange.clone(),
        })
        .max_by(|a, b| rank(a, b, b.price.cmp(&a.price)))
}
