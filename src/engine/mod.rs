//! Bot scheduler.
//!
//! A fixed pool of `max_concurrent_bots` workers pulls due bots from a queue
//! filled by the scheduler on every `execution_interval` tick. A bot is never
//! queued twice: it stays claimed from dispatch until its execution ends.

pub mod bot;
pub mod executor;
pub mod orders;
pub mod retry;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{MissedTickBehavior, interval, interval_at, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::config::{BotConfig, EngineConfig};
use crate::context::ExecutionContext;
use crate::events::{EngineEvent, EventSink};
use crate::exchange::ExchangeRegistry;
use crate::market_data::{AggregatorError, MarketDataAggregator, SymbolLease};
use crate::metrics;
use crate::model::{ExchangeOrder, Symbol, UserDataEvent};
use crate::order_fsm::OrderRecord;
use crate::risk::RiskGate;
use crate::status::SystemStatus;
use crate::strategy::{StrategyError, StrategyRegistry};

use bot::Bot;
use executor::Executor;

pub use bot::{BotPerformance, BotState, ExecutionTally};
pub use executor::{ExecutionError, ExecutionReport};
pub use orders::OrderTracker;
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown bot '{0}'")]
    UnknownBot(String),
    #[error("Duplicate bot id '{0}'")]
    DuplicateBot(String),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error("Invalid engine configuration: {0}")]
    Config(String),
}

/// Collaborators shared with the rest of the process.
#[derive(Clone)]
pub struct EngineServices {
    pub registry: Arc<ExchangeRegistry>,
    pub aggregator: Arc<MarketDataAggregator>,
    pub risk: Arc<RiskGate>,
    pub sink: Arc<dyn EventSink>,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Bots whose execution was still running at the deadline and was cut off.
    pub abandoned: Vec<String>,
    /// True when every in-flight execution finished within the grace period.
    pub completed: bool,
}

struct Runtime {
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    leases: Vec<SymbolLease>,
}

/// What a worker needs to run one bot and record the outcome.
#[derive(Clone)]
struct Dispatch {
    executor: Arc<Executor>,
    sink: Arc<dyn EventSink>,
    executing: Arc<Mutex<HashSet<String>>>,
    max_failures: u32,
}

impl Dispatch {
    async fn run(&self, bot: Arc<Bot>) {
        self.executing.lock().insert(bot.id.clone());
        let started = Instant::now();
        let report = self.executor.execute(&bot).await;
        let latency = started.elapsed();
        self.executing.lock().remove(&bot.id);

        let now = self.executor.context.time.now();
        metrics::inc_bot_executions();
        metrics::observe_execution_latency(latency.as_secs_f64());

        match report.error {
            None => {
                bot.record_success(latency, report.tally, now);
                debug!(
                    bot_id = %bot.id,
                    submitted = report.tally.submitted,
                    denied = report.tally.denied,
                    "Execution complete"
                );
            }
            Some(err) => {
                metrics::inc_bot_failures();
                let failures = bot.record_failure(latency, report.tally, now);
                self.sink.emit(EngineEvent::ExecutionFailed {
                    bot_id: bot.id.clone(),
                    error: err.to_string(),
                });
                if failures >= self.max_failures {
                    let reason = format!("{} consecutive failed executions, last: {}", failures, err);
                    if bot.pause(reason.clone()) {
                        metrics::inc_bot_pauses();
                        self.sink.emit(EngineEvent::BotPaused {
                            bot_id: bot.id.clone(),
                            consecutive_failures: failures,
                            reason,
                        });
                    }
                }
            }
        }
        bot.finish();
    }
}

pub struct BotEngine {
    config: EngineConfig,
    services: EngineServices,
    bots: Vec<Arc<Bot>>,
    executor: Arc<Executor>,
    tracker: Arc<OrderTracker>,
    executing: Arc<Mutex<HashSet<String>>>,
    running: AtomicBool,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl BotEngine {
    pub fn new(
        config: EngineConfig,
        bots: &[BotConfig],
        strategies: &StrategyRegistry,
        services: EngineServices,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut instances = Vec::with_capacity(bots.len());
        for cfg in bots {
            if !seen.insert(cfg.id.clone()) {
                return Err(EngineError::DuplicateBot(cfg.id.clone()));
            }
            let strategy = strategies.get(&cfg.strategy)?;
            instances.push(Arc::new(Bot::new(cfg, strategy)));
        }

        let tracker = Arc::new(OrderTracker::new(
            services.risk.clone(),
            services.sink.clone(),
            services.context.time.clone(),
        ));
        let executor = Arc::new(Executor {
            registry: services.registry.clone(),
            aggregator: services.aggregator.clone(),
            risk: services.risk.clone(),
            tracker: tracker.clone(),
            sink: services.sink.clone(),
            context: services.context.clone(),
            retry: RetryPolicy::from_config(&config),
        });

        Ok(Self {
            config,
            services,
            bots: instances,
            executor,
            tracker,
            executing: Arc::new(Mutex::new(HashSet::new())),
            running: AtomicBool::new(false),
            runtime: tokio::sync::Mutex::new(None),
        })
    }

    /// Begin scheduling. Calling it on a running engine is a no-op.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        let mut leases = Vec::new();
        for symbol in self.symbols() {
            match self.services.aggregator.acquire(&symbol).await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    for lease in leases {
                        self.services.aggregator.release(lease).await;
                    }
                    return Err(e.into());
                }
            }
        }

        let (shutdown, _) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel::<Arc<Bot>>(self.bots.len().max(1));
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let dispatch = Dispatch {
            executor: self.executor.clone(),
            sink: self.services.sink.clone(),
            executing: self.executing.clone(),
            max_failures: self.config.max_consecutive_failures.max(1),
        };
        let workers = (0..self.config.max_concurrent_bots)
            .map(|id| spawn_worker(id, dispatch.clone(), queue_rx.clone(), shutdown.subscribe()))
            .collect();
        let scheduler = self.spawn_scheduler(queue_tx, shutdown.subscribe());

        let mut background = vec![self.spawn_performance_reporter(shutdown.subscribe())];
        background.extend(self.spawn_user_data(shutdown.subscribe()).await);

        *runtime = Some(Runtime {
            shutdown,
            scheduler,
            workers,
            background,
            leases,
        });
        self.running.store(true, Ordering::SeqCst);
        info!(
            bots = self.bots.len(),
            workers = self.config.max_concurrent_bots,
            interval_ms = self.config.execution_interval_ms,
            "🚀 Bot engine started"
        );
        Ok(())
    }

    /// Stop scheduling and wait up to `grace` for in-flight executions.
    /// Executions still running at the deadline are aborted and reported as
    /// abandoned. Aggregator leases and user-data streams are released.
    pub async fn stop(&self, grace: Duration) -> StopReport {
        let deadline = tokio::time::Instant::now() + grace;
        let Some(runtime) = self.runtime.lock().await.take() else {
            return StopReport {
                abandoned: Vec::new(),
                completed: true,
            };
        };
        self.running.store(false, Ordering::SeqCst);
        runtime.shutdown.send_replace(true);
        let _ = runtime.scheduler.await;

        let aborts: Vec<AbortHandle> = runtime.workers.iter().map(|h| h.abort_handle()).collect();
        let completed = timeout_at(deadline, futures::future::join_all(runtime.workers))
            .await
            .is_ok();

        let mut abandoned = Vec::new();
        if !completed {
            for handle in &aborts {
                handle.abort();
            }
            abandoned = self.executing.lock().drain().collect();
            abandoned.sort();
            for id in &abandoned {
                if let Some(bot) = self.find(id) {
                    bot.record_abandoned();
                }
                self.services.sink.emit(EngineEvent::ExecutionAbandoned { bot_id: id.clone() });
            }
            metrics::inc_bot_abandoned(abandoned.len() as u64);
            warn!(count = abandoned.len(), "🛑 Executions abandoned at shutdown: {:?}", abandoned);
        }
        for bot in &self.bots {
            bot.finish();
        }

        let background: Vec<AbortHandle> = runtime.background.iter().map(|h| h.abort_handle()).collect();
        if timeout_at(deadline, futures::future::join_all(runtime.background))
            .await
            .is_err()
        {
            for handle in &background {
                handle.abort();
            }
        }

        let mut leases = runtime.leases.into_iter();
        let released = timeout_at(deadline, async {
            for lease in leases.by_ref() {
                self.services.aggregator.release(lease).await;
            }
        })
        .await;
        if released.is_err() {
            warn!(
                unreleased = leases.len() + 1,
                "⚠️ Market data leases not released before the deadline"
            );
        }

        info!(abandoned = abandoned.len(), "🛑 Bot engine stopped");
        StopReport {
            abandoned,
            completed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pause_bot(&self, id: &str) -> Result<(), EngineError> {
        let bot = self.find(id).ok_or_else(|| EngineError::UnknownBot(id.to_string()))?;
        let reason = "paused by operator".to_string();
        if bot.pause(reason.clone()) {
            info!(bot_id = %id, "⏸️ Bot paused by operator");
            self.services.sink.emit(EngineEvent::BotPaused {
                bot_id: id.to_string(),
                consecutive_failures: bot.consecutive_failures(),
                reason,
            });
        }
        Ok(())
    }

    /// Resume a paused bot and clear its failure streak.
    pub fn resume_bot(&self, id: &str) -> Result<(), EngineError> {
        let bot = self.find(id).ok_or_else(|| EngineError::UnknownBot(id.to_string()))?;
        if bot.resume() {
            self.services.sink.emit(EngineEvent::BotResumed {
                bot_id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn bot_states(&self) -> Vec<BotState> {
        self.bots.iter().map(|b| b.snapshot()).collect()
    }

    pub fn bot_state(&self, id: &str) -> Option<BotState> {
        self.find(id).map(|b| b.snapshot())
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.tracker.all()
    }

    pub fn order(&self, client_order_id: &str) -> Option<OrderRecord> {
        self.tracker.get(client_order_id)
    }

    /// Feed an adapter status report (REST poll or user-data stream) into the
    /// order records. Returns true when it changed a record.
    pub fn apply_order_update(&self, update: &ExchangeOrder) -> bool {
        self.tracker.apply_update(update).is_some()
    }

    pub fn status(&self) -> SystemStatus {
        let halt = self.services.risk.halt();
        SystemStatus {
            running: self.is_running(),
            halted: halt.is_halted(),
            halt_reason: halt.reason(),
            exchanges: self.services.registry.health_snapshot(),
            bots: self.bot_states(),
            aggregated_symbols: self.services.aggregator.symbols(),
            dropped_views: self.services.aggregator.dropped_views(),
            open_orders: self.tracker.open_count(),
            exposures: self.services.risk.exposures(),
            generated_at: self.services.context.time.now(),
        }
    }

    fn find(&self, id: &str) -> Option<&Arc<Bot>> {
        self.bots.iter().find(|b| b.id == id)
    }

    fn symbols(&self) -> BTreeSet<Symbol> {
        self.bots.iter().flat_map(|b| b.symbols()).collect()
    }

    fn spawn_scheduler(
        &self,
        queue: mpsc::Sender<Arc<Bot>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let bots = self.bots.clone();
        let every = self.config.execution_interval();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for bot in &bots {
                            if !bot.is_running() || !bot.try_begin() {
                                continue;
                            }
                            if queue.try_send(bot.clone()).is_err() {
                                bot.finish();
                            }
                        }
                    }
                }
            }
            debug!("Scheduler stopped");
        })
    }

    fn spawn_performance_reporter(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let bots = self.bots.clone();
        let sink = self.services.sink.clone();
        let every = self.config.performance_update_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for bot in &bots {
                            sink.emit(EngineEvent::BotPerformance {
                                bot_id: bot.id.clone(),
                                performance: bot.performance(),
                            });
                        }
                    }
                }
            }
        })
    }

    /// One task per exchange whose adapter offers a user-data stream,
    /// folding order reports into the tracker.
    async fn spawn_user_data(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (name, adapter) in self.services.registry.all() {
            let mut stream = match timeout(self.config.connect_timeout(), adapter.subscribe_user_data()).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    info!(exchange = %name, "User data stream unavailable: {}", e);
                    continue;
                }
                Err(_) => {
                    warn!(exchange = %name, "⚠️ User data subscribe timed out");
                    continue;
                }
            };
            info!(exchange = %name, "👤 User data stream attached");

            let tracker = self.tracker.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = stream.recv() => match event {
                            Some(UserDataEvent::Order(order)) => {
                                tracker.apply_update(&order);
                            }
                            Some(UserDataEvent::Balance(balance)) => {
                                debug!(exchange = %name, asset = %balance.asset, free = %balance.free, "Balance update");
                            }
                            None => {
                                warn!(exchange = %name, "⚠️ User data stream closed");
                                break;
                            }
                        },
                    }
                }
            }));
        }
        handles
    }
}

fn spawn_worker(
    id: usize,
    dispatch: Dispatch,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Bot>>>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => None,
                    bot = rx.recv() => bot,
                }
            };
            let Some(bot) = next else {
                break;
            };
            if *shutdown.borrow() {
                bot.finish();
                break;
            }
            dispatch.run(bot).await;
        }
        debug!(worker = id, "Worker stopped");
    })
}
