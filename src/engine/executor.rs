use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::engine::bot::{Bot, BotState, ExecutionTally};
use crate::engine::orders::OrderTracker;
use crate::engine::retry::RetryPolicy;
use crate::events::{EngineEvent, EventSink};
use crate::exchange::ExchangeRegistry;
use crate::exchange::adapter::ExchangeError;
use crate::market_data::MarketDataAggregator;
use crate::market_data::view::AggregatedView;
use crate::metrics;
use crate::model::{OrderIntent, OrderRequest, Symbol};
use crate::order_fsm::OrderRecord;
use crate::risk::{RiskContext, RiskDecision, RiskGate};
use crate::strategy::StrategyError;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("strategy error on {symbol}: {source}")]
    Strategy {
        symbol: Symbol,
        #[source]
        source: StrategyError,
    },
    #[error("intent {client_order_id} names no exchange and the bot has none configured")]
    NoExchange { client_order_id: String },
    #[error("submission of {client_order_id} to {exchange} failed after {attempts} attempt(s): {source}")]
    Submission {
        client_order_id: String,
        exchange: String,
        attempts: u32,
        #[source]
        source: ExchangeError,
    },
}

/// Outcome of one bot execution. `error` holds the first failure; intents
/// after a failed submission are still processed.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub intents: usize,
    pub tally: ExecutionTally,
    pub failed: usize,
    pub error: Option<ExecutionError>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

enum IntentOutcome {
    Submitted,
    Denied,
}

/// Runs single bot executions: view → strategy → risk gate → submission.
pub(crate) struct Executor {
    pub(crate) registry: Arc<ExchangeRegistry>,
    pub(crate) aggregator: Arc<MarketDataAggregator>,
    pub(crate) risk: Arc<RiskGate>,
    pub(crate) tracker: Arc<OrderTracker>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) context: ExecutionContext,
    pub(crate) retry: RetryPolicy,
}

impl Executor {
    pub(crate) async fn execute(&self, bot: &Bot) -> ExecutionReport {
        let state = bot.snapshot();
        let mut report = ExecutionReport::default();

        for symbol in &state.symbols {
            let view = self
                .aggregator
                .view(symbol)
                .unwrap_or_else(|| AggregatedView::empty(symbol.clone()));

            let intents = match bot.strategy.evaluate(&view, &state) {
                Ok(intents) => intents,
                Err(source) => {
                    report.error = Some(ExecutionError::Strategy {
                        symbol: symbol.clone(),
                        source,
                    });
                    return report;
                }
            };
            debug!(bot_id = %state.id, symbol = %symbol, intents = intents.len(), "Strategy evaluated");

            for intent in intents {
                report.intents += 1;
                match self.process(&state, &view, intent).await {
                    Ok(IntentOutcome::Submitted) => report.tally.submitted += 1,
                    Ok(IntentOutcome::Denied) => report.tally.denied += 1,
                    Err(e) => {
                        report.failed += 1;
                        if report.error.is_none() {
                            report.error = Some(e);
                        }
                    }
                }
            }
        }
        report
    }

    async fn process(
        &self,
        bot: &BotState,
        view: &AggregatedView,
        mut intent: OrderIntent,
    ) -> Result<IntentOutcome, ExecutionError> {
        if intent.client_id.is_empty() {
            intent.client_id = self.context.id.new_id();
        }
        let exchange = match intent.exchange.as_deref().or(bot.default_exchange()) {
            Some(name) => name.to_lowercase(),
            None => {
                return Err(ExecutionError::NoExchange {
                    client_order_id: intent.client_id,
                });
            }
        };

        // One fresh decision per intent.
        let decision = self.risk.evaluate(
            &intent,
            RiskContext {
                bot_failures: bot.consecutive_failures,
                view: Some(view),
            },
        );
        self.sink.emit(EngineEvent::RiskDecision {
            bot_id: bot.id.clone(),
            client_order_id: intent.client_id.clone(),
            symbol: intent.symbol.clone(),
            requested: intent.quantity,
            decision: decision.clone(),
            timestamp: self.context.time.now(),
        });
        let quantity = match decision.approved_quantity(intent.quantity) {
            Some(quantity) => quantity,
            None => return Ok(IntentOutcome::Denied),
        };
        if let RiskDecision::Resize { .. } = decision {
            debug!(client_order_id = %intent.client_id, %quantity, "Submitting resized intent");
        }

        let request = OrderRequest::from_intent(&intent, quantity);
        let mut record = OrderRecord::new(intent, quantity, exchange.clone(), bot.id.clone(), self.context.time.now());

        let started = Instant::now();
        let outcome = self
            .retry
            .run(|| self.registry.place_order(&exchange, request.clone()))
            .await;
        let elapsed = started.elapsed();

        match outcome.result {
            Ok(ack) => {
                record.latency_ms = Some(elapsed.as_millis() as i64);
                metrics::inc_order_submissions();
                metrics::observe_order_latency(elapsed.as_secs_f64());
                info!(
                    bot_id = %bot.id,
                    exchange = %exchange,
                    symbol = %request.symbol,
                    side = ?request.side,
                    quantity = %quantity,
                    attempts = outcome.attempts,
                    latency_ms = elapsed.as_millis() as u64,
                    "✅ Order submitted"
                );
                self.tracker.record_submitted(record, &ack);
                Ok(IntentOutcome::Submitted)
            }
            Err(source) => {
                metrics::inc_order_failures();
                self.tracker.record_failed(record, &source);
                Err(ExecutionError::Submission {
                    client_order_id: request.client_order_id,
                    exchange,
                    attempts: outcome.attempts,
                    source,
                })
            }
        }
    }
}
