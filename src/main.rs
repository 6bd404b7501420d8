use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nexus_trader::circuit_breaker::GlobalHalt;
use nexus_trader::config::{ExchangeKind, Settings};
use nexus_trader::context::ExecutionContext;
use nexus_trader::engine::{BotEngine, EngineServices};
use nexus_trader::events::{EventSink, TracingSink};
use nexus_trader::exchange::{
    BinanceAdapter, BybitAdapter, ExchangeRegistry, PaperAdapter, SharedAdapter,
};
use nexus_trader::market_data::{AggregatorConfig, MarketDataAggregator};
use nexus_trader::metrics;
use nexus_trader::risk::RiskGate;
use nexus_trader::strategy::StrategyRegistry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_registry(settings: &Settings) -> Result<Arc<ExchangeRegistry>, Box<dyn std::error::Error + Send + Sync>> {
    let registry = Arc::new(ExchangeRegistry::new());
    let mut names: Vec<&String> = settings.exchanges.keys().collect();
    names.sort();

    for name in names {
        let cfg = &settings.exchanges[name];
        if !cfg.enabled {
            info!("⏭️ Exchange {} disabled, skipping", name);
            continue;
        }
        let adapter: SharedAdapter = match cfg.resolve_kind(name) {
            Some(ExchangeKind::Binance) => Arc::new(BinanceAdapter::new(name, cfg)),
            Some(ExchangeKind::Bybit) => Arc::new(BybitAdapter::new(name, cfg)),
            Some(ExchangeKind::Paper) => Arc::new(PaperAdapter::new(name.as_str())),
            None => {
                warn!("⚠️ Exchange {} has no known kind, skipping", name);
                continue;
            }
        };
        registry.register(name, adapter)?;
        info!("🏦 Registered exchange {}", name);
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                        NEXUS TRADER                           ║");
    info!("║          Multi-exchange aggregation and bot execution         ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        exchanges = settings.exchanges.len(),
        bots = settings.bots.len(),
        "✅ Configuration loaded"
    );

    let registry = build_registry(&settings)?;
    if registry.is_empty() {
        warn!("⚠️ No exchanges configured; bots will have nothing to trade on");
    }
    let connected = registry.connect_all(settings.engine.connect_timeout()).await;
    let failed = connected.values().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!("⚠️ {}/{} exchanges failed to connect", failed, connected.len());
    }

    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_checker =
        registry.spawn_health_checker(settings.engine.health_check_interval(), sink.clone(), shutdown_rx);

    let aggregator = Arc::new(MarketDataAggregator::new(
        registry.clone(),
        AggregatorConfig::from(&settings.engine),
    ));
    aggregator.start_heartbeat(settings.engine.health_check_interval());

    let halt = GlobalHalt::new();
    let risk = Arc::new(RiskGate::new(settings.risk.clone(), halt.clone()));

    let services = EngineServices {
        registry: registry.clone(),
        aggregator: aggregator.clone(),
        risk,
        sink,
        context: ExecutionContext::new_system(),
    };
    let engine = BotEngine::new(
        settings.engine.clone(),
        &settings.bots,
        &StrategyRegistry::with_defaults(),
        services,
    )?;
    engine.start().await?;

    let status = engine.status();
    info!(
        running_bots = status.bots.iter().filter(|b| b.running).count(),
        symbols = status.aggregated_symbols.len(),
        "🚀 Nexus trader running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received");

    let report = engine.stop(SHUTDOWN_GRACE).await;
    if !report.completed {
        warn!("⚠️ Abandoned executions: {:?}", report.abandoned);
    }
    aggregator.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = health_checker.await;
    registry.disconnect_all().await;

    match serde_json::to_string(&engine.status()) {
        Ok(json) => info!("📊 Final status: {}", json),
        Err(e) => warn!("⚠️ Could not serialize final status: {}", e),
    }
    tracing::debug!("{}", metrics::render());
    info!("👋 Nexus trader stopped");
    Ok(())
}
