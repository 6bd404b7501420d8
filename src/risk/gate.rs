use parking_lot::Mutex;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};

use crate::circuit_breaker::GlobalHalt;
use crate::market_data::view::AggregatedView;
use crate::metrics;
use crate::model::{OrderIntent, Side, Symbol};
use crate::risk::exposure::{Commitment, ExposureBook, SymbolExposure};
use crate::risk::limits::RiskLimits;
use crate::risk::{RiskDecision, RiskRejectionReason};

const QUANTITY_DP: u32 = 8;

/// Per-intent inputs besides the intent itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskContext<'a> {
    pub bot_failures: u32,
    pub view: Option<&'a AggregatedView>,
}

/// Synchronous pre-trade policy.
///
/// Every call to [`RiskGate::evaluate`] computes a fresh decision. Allowed and
/// resized intents reserve their quantity under the same lock that computed
/// the decision, so concurrent bots cannot jointly overshoot a limit.
pub struct RiskGate {
    limits: RiskLimits,
    halt: GlobalHalt,
    book: Mutex<ExposureBook>,
}

impl RiskGate {
    pub fn new(limits: RiskLimits, halt: GlobalHalt) -> Self {
        info!("🛡️ RiskGate initialised with limits: {:?}", limits);
        Self {
            limits,
            halt,
            book: Mutex::new(ExposureBook::new()),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn halt(&self) -> &GlobalHalt {
        &self.halt
    }

    /// Decide on `intent`. The intent's `client_id` keys the reservation and
    /// must already be assigned.
    pub fn evaluate(&self, intent: &OrderIntent, ctx: RiskContext<'_>) -> RiskDecision {
        let decision = self.decide(intent, &ctx);
        metrics::inc_risk_decision(decision.verdict());

        match &decision {
            RiskDecision::Allow => debug!(
                client_id = %intent.client_id,
                symbol = %intent.symbol,
                quantity = %intent.quantity,
                "Risk allow"
            ),
            RiskDecision::Resize { quantity, reason } => info!(
                client_id = %intent.client_id,
                symbol = %intent.symbol,
                requested = %intent.quantity,
                approved = %quantity,
                "✂️ Risk resize: {}",
                reason
            ),
            RiskDecision::Deny(reason) => warn!(
                client_id = %intent.client_id,
                symbol = %intent.symbol,
                "⛔ Risk deny: {}",
                reason
            ),
        }
        decision
    }

    fn decide(&self, intent: &OrderIntent, ctx: &RiskContext<'_>) -> RiskDecision {
        use RiskRejectionReason as R;
        let limits = &self.limits;
        let symbol = &intent.symbol;

        if intent.quantity <= Decimal::ZERO {
            return RiskDecision::Deny(R::InvalidQuantity(intent.quantity));
        }
        if self.halt.is_halted() && !intent.reduce_only {
            let reason = self.halt.reason().unwrap_or_else(|| "kill switch".into());
            return RiskDecision::Deny(R::Halted(reason));
        }
        if !limits.is_allowed(symbol) {
            return RiskDecision::Deny(R::SymbolNotAllowed(symbol.clone()));
        }
        if let Some(view) = ctx.view {
            if view.stale && limits.reject_stale_views && !intent.reduce_only {
                return RiskDecision::Deny(R::StaleMarketData(symbol.clone()));
            }
        }

        let touch = ctx.view.and_then(|v| v.touch_price(intent.side));
        let price = match intent.limit_price.or(touch) {
            Some(p) if p > Decimal::ZERO => p,
            _ => return RiskDecision::Deny(R::NoReferencePrice(symbol.clone())),
        };

        if let (Some(limit_price), Some(mid)) = (intent.limit_price, ctx.view.and_then(|v| v.mid_price())) {
            let deviation_bps = ((limit_price - mid).abs() / mid) * Decimal::from(10_000);
            if deviation_bps > Decimal::from(limits.max_price_deviation_bps) {
                return RiskDecision::Deny(R::PriceDeviation {
                    price: limit_price,
                    reference: mid,
                    deviation_bps,
                    limit_bps: limits.max_price_deviation_bps,
                });
            }
        }

        if !intent.reduce_only && ctx.bot_failures >= limits.max_bot_failures {
            return RiskDecision::Deny(R::BotFailures {
                failures: ctx.bot_failures,
                limit: limits.max_bot_failures,
            });
        }

        if let Some(leverage) = intent.leverage {
            if leverage > limits.max_leverage {
                return RiskDecision::Deny(R::LeverageExceeded {
                    requested: leverage,
                    limit: limits.max_leverage,
                });
            }
        }

        let mut book = self.book.lock();
        if !intent.client_id.is_empty() && book.has_commitment(&intent.client_id) {
            return RiskDecision::Deny(R::DuplicateClientId(intent.client_id.clone()));
        }

        let exposure = book.exposure(symbol);
        let (allowed, binding) = if intent.reduce_only {
            match self.reduce_only_quantity(intent, &exposure) {
                Ok(r) => r,
                Err(reason) => return RiskDecision::Deny(reason),
            }
        } else {
            self.opening_quantity(intent, &exposure, price)
        };

        let allowed = allowed.round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero);
        let decision = match binding {
            None => RiskDecision::Allow,
            Some(reason) if allowed <= Decimal::ZERO => return RiskDecision::Deny(reason),
            Some(reason) => RiskDecision::Resize {
                quantity: allowed,
                reason,
            },
        };

        if !intent.client_id.is_empty() {
            book.reserve(
                intent.client_id.clone(),
                Commitment {
                    symbol: symbol.clone(),
                    side: intent.side,
                    remaining: allowed,
                    price,
                },
            );
        }
        decision
    }

    fn reduce_only_quantity(
        &self,
        intent: &OrderIntent,
        exposure: &SymbolExposure,
    ) -> Result<(Decimal, Option<RiskRejectionReason>), RiskRejectionReason> {
        // Selling reduces a long, buying reduces a short.
        let reducible = (-intent.side.sign() * exposure.projected()).max(Decimal::ZERO);
        if reducible.is_zero() {
            return Err(RiskRejectionReason::ReduceOnlyViolation(intent.symbol.clone()));
        }
        if intent.quantity <= reducible {
            Ok((intent.quantity, None))
        } else {
            Ok((
                reducible,
                Some(RiskRejectionReason::ReduceOnlyClamped {
                    symbol: intent.symbol.clone(),
                    reducible,
                }),
            ))
        }
    }

    /// Smallest headroom across the position, order-notional and exposure
    /// limits, with the limit that bound it.
    fn opening_quantity(
        &self,
        intent: &OrderIntent,
        exposure: &SymbolExposure,
        price: Decimal,
    ) -> (Decimal, Option<RiskRejectionReason>) {
        let limits = &self.limits;
        let sign = intent.side.sign();
        let projected = exposure.projected();
        let after = (projected + sign * intent.quantity).abs();

        let mut allowed = intent.quantity;
        let mut binding = None;

        let position_headroom = limits.max_position_size - sign * projected;
        if position_headroom < allowed {
            allowed = position_headroom;
            binding = Some(RiskRejectionReason::PositionLimit {
                symbol: intent.symbol.clone(),
                projected: after,
                limit: limits.max_position_size,
            });
        }

        let notional_headroom = limits.max_order_notional / price;
        if notional_headroom < allowed {
            allowed = notional_headroom;
            binding = Some(RiskRejectionReason::OrderNotionalLimit {
                notional: intent.quantity * price,
                limit: limits.max_order_notional,
            });
        }

        let exposure_headroom = limits.max_exposure_per_symbol / price - sign * projected;
        if exposure_headroom < allowed {
            allowed = exposure_headroom;
            binding = Some(RiskRejectionReason::ExposureLimit {
                symbol: intent.symbol.clone(),
                projected_notional: after * price,
                limit: limits.max_exposure_per_symbol,
            });
        }

        (allowed, binding)
    }

    /// Move filled quantity from the order's reservation into the position.
    pub fn on_fill(&self, client_id: &str, symbol: &Symbol, side: Side, quantity: Decimal) {
        if quantity <= Decimal::ZERO {
            return;
        }
        self.book.lock().apply_fill(client_id, symbol, side, quantity);
    }

    /// Drop whatever is left of an order's reservation (cancel, reject,
    /// expiry, failed submission, or completion).
    pub fn release(&self, client_id: &str) {
        if let Some(c) = self.book.lock().release(client_id) {
            debug!(client_id, symbol = %c.symbol, remaining = %c.remaining, "Released risk reservation");
        }
    }

    /// Overwrite the filled position, e.g. after reconciling with an exchange.
    pub fn set_position(&self, symbol: Symbol, quantity: Decimal) {
        self.book.lock().set_position(symbol, quantity);
    }

    pub fn exposure(&self, symbol: &Symbol) -> SymbolExposure {
        self.book.lock().exposure(symbol)
    }

    pub fn exposures(&self) -> Vec<SymbolExposure> {
        self.book.lock().snapshot()
    }

    pub fn open_reservations(&self) -> usize {
        self.book.lock().open_commitments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TickerSnapshot;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn view(bid: Decimal, ask: Decimal, stale: bool) -> AggregatedView {
        let mut tickers = BTreeMap::new();
        tickers.insert(
            "binance".to_string(),
            TickerSnapshot {
                exchange: "binance".into(),
                symbol: Symbol::new("BTCUSDT"),
                bid_price: bid,
                bid_qty: dec!(5),
                ask_price: ask,
                ask_qty: dec!(5),
                last_price: bid,
                volume_24h: Decimal::ZERO,
                change_24h_pct: Decimal::ZERO,
                timestamp: Utc::now(),
            },
        );
        AggregatedView::compute(Symbol::new("BTCUSDT"), tickers, None, stale)
    }

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: dec!(2),
            max_order_notional: dec!(1000),
            max_exposure_per_symbol: dec!(5000),
            max_leverage: dec!(3),
            max_price_deviation_bps: 100,
            allowed_symbols: Vec::new(),
            max_bot_failures: 3,
            reject_stale_views: true,
        }
    }

    fn gate() -> RiskGate {
        RiskGate::new(limits(), GlobalHalt::new())
    }

    fn ctx(view: &AggregatedView) -> RiskContext<'_> {
        RiskContext {
            bot_failures: 0,
            view: Some(view),
        }
    }

    fn buy(qty: Decimal, id: &str) -> OrderIntent {
        OrderIntent::market("BTCUSDT", Side::Buy, qty).with_client_id(id)
    }

    #[test]
    fn test_allow_within_limits() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), false);
        assert_eq!(gate.evaluate(&buy(dec!(1), "a"), ctx(&v)), RiskDecision::Allow);
        assert_eq!(gate.exposure(&Symbol::new("BTCUSDT")).committed, dec!(1));
    }

    #[test]
    fn test_resize_to_order_notional() {
        let gate = gate();
        let v = view(dec!(999), dec!(1000), false);
        // 1.5 * 1000 = 1500 > 1000 notional cap
        match gate.evaluate(&buy(dec!(1.5), "a"), ctx(&v)) {
            RiskDecision::Resize { quantity, reason } => {
                assert_eq!(quantity, dec!(1));
                assert!(matches!(reason, RiskRejectionReason::OrderNotionalLimit { .. }));
            }
            other => panic!("expected resize, got {:?}", other),
        }
    }

    #[test]
    fn test_reservations_consume_position_headroom() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), false);
        assert_eq!(gate.evaluate(&buy(dec!(1.5), "a"), ctx(&v)), RiskDecision::Allow);

        let second = gate.evaluate(&buy(dec!(1), "b"), ctx(&v));
        assert_eq!(second.approved_quantity(dec!(1)), Some(dec!(0.5)));

        let third = gate.evaluate(&buy(dec!(1), "c"), ctx(&v));
        assert!(matches!(
            third,
            RiskDecision::Deny(RiskRejectionReason::PositionLimit { .. })
        ));

        gate.release("a");
        assert_eq!(gate.evaluate(&buy(dec!(1), "d"), ctx(&v)), RiskDecision::Allow);
    }

    #[test]
    fn test_fill_moves_reservation_into_position() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), false);
        let symbol = Symbol::new("BTCUSDT");
        gate.evaluate(&buy(dec!(1), "a"), ctx(&v));
        gate.on_fill("a", &symbol, Side::Buy, dec!(0.4));
        let exp = gate.exposure(&symbol);
        assert_eq!(exp.position, dec!(0.4));
        assert_eq!(exp.committed, dec!(0.6));

        gate.release("a");
        assert_eq!(gate.exposure(&symbol).committed, Decimal::ZERO);
        assert_eq!(gate.open_reservations(), 0);
    }

    #[test]
    fn test_halt_denies_all_but_reduce_only() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), false);
        gate.set_position(Symbol::new("BTCUSDT"), dec!(1));
        gate.halt().set_halt(true, "drill");

        assert!(matches!(
            gate.evaluate(&buy(dec!(0.1), "a"), ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::Halted(_))
        ));

        let reduce = OrderIntent::market("BTCUSDT", Side::Sell, dec!(0.5))
            .with_client_id("b")
            .reduce_only();
        assert_eq!(gate.evaluate(&reduce, ctx(&v)), RiskDecision::Allow);
    }

    #[test]
    fn test_reduce_only_clamps_and_denies() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), false);
        let flat = OrderIntent::market("BTCUSDT", Side::Sell, dec!(1))
            .with_client_id("a")
            .reduce_only();
        assert!(matches!(
            gate.evaluate(&flat, ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::ReduceOnlyViolation(_))
        ));

        gate.set_position(Symbol::new("BTCUSDT"), dec!(0.3));
        let too_big = flat.clone().with_client_id("b");
        assert_eq!(
            gate.evaluate(&too_big, ctx(&v)).approved_quantity(dec!(1)),
            Some(dec!(0.3))
        );
    }

    #[test]
    fn test_stale_view_denied() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), true);
        assert!(matches!(
            gate.evaluate(&buy(dec!(1), "a"), ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::StaleMarketData(_))
        ));
    }

    #[test]
    fn test_price_deviation_denied() {
        let gate = gate();
        let v = view(dec!(99), dec!(101), false);
        let far = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(0.1), dec!(110)).with_client_id("a");
        assert!(matches!(
            gate.evaluate(&far, ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::PriceDeviation { .. })
        ));
        let near = OrderIntent::limit("BTCUSDT", Side::Buy, dec!(0.1), dec!(100.5)).with_client_id("b");
        assert_eq!(gate.evaluate(&near, ctx(&v)), RiskDecision::Allow);
    }

    #[test]
    fn test_market_order_without_view_denied() {
        let gate = gate();
        assert!(matches!(
            gate.evaluate(&buy(dec!(1), "a"), RiskContext::default()),
            RiskDecision::Deny(RiskRejectionReason::NoReferencePrice(_))
        ));
    }

    #[test]
    fn test_bot_failures_and_leverage() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), false);
        let failing = RiskContext {
            bot_failures: 3,
            view: Some(&v),
        };
        assert!(matches!(
            gate.evaluate(&buy(dec!(0.1), "a"), failing),
            RiskDecision::Deny(RiskRejectionReason::BotFailures { .. })
        ));

        let mut levered = buy(dec!(0.1), "b");
        levered.leverage = Some(dec!(10));
        assert!(matches!(
            gate.evaluate(&levered, ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::LeverageExceeded { .. })
        ));
    }

    #[test]
    fn test_whitelist_and_invalid_quantity() {
        let gate = RiskGate::new(
            RiskLimits {
                allowed_symbols: vec![Symbol::new("ETHUSDT")],
                ..limits()
            },
            GlobalHalt::new(),
        );
        let v = view(dec!(99), dec!(100), false);
        assert!(matches!(
            gate.evaluate(&buy(dec!(1), "a"), ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::SymbolNotAllowed(_))
        ));
        assert!(matches!(
            gate.evaluate(&buy(dec!(0), "b"), ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::InvalidQuantity(_))
        ));
    }

    #[test]
    fn test_duplicate_client_id_denied() {
        let gate = gate();
        let v = view(dec!(99), dec!(100), false);
        gate.evaluate(&buy(dec!(0.1), "same"), ctx(&v));
        assert!(matches!(
            gate.evaluate(&buy(dec!(0.1), "same"), ctx(&v)),
            RiskDecision::Deny(RiskRejectionReason::DuplicateClientId(_))
        ));
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_limit() {
        let gate = Arc::new(gate());
        let v = Arc::new(view(dec!(99), dec!(100), false));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = gate.clone();
                let v = v.clone();
                std::thread::spawn(move || {
                    for j in 0..10 {
                        gate.evaluate(&buy(dec!(0.1), &format!("{}-{}", i, j)), ctx(&v));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(gate.exposure(&Symbol::new("BTCUSDT")).projected() <= dec!(2));
    }
}
