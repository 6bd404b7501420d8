use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};

// --- Market data ---

pub static VIEW_PUBLICATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_view_publications_total",
        "Aggregated views published to subscribers"
    )
    .expect("view_publications counter")
});

pub static SUBSCRIBER_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_subscriber_drops_total",
        "Views dropped because a subscriber channel was full"
    )
    .expect("subscriber_drops counter")
});

pub static STALE_VIEWS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_stale_views_total",
        "Aggregated views that went stale (fresh to stale transitions)"
    )
    .expect("stale_views counter")
});

pub static AGGREGATION_TASKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "nexus_aggregation_tasks",
        "Running per-(exchange, symbol, stream) aggregation tasks"
    )
    .expect("aggregation_tasks gauge")
});

pub static EXCHANGE_DISCONNECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "nexus_exchange_disconnected_total",
        "Heartbeat checks that found an exchange disconnected",
        &["exchange"]
    )
    .expect("exchange_disconnected counter")
});

// --- Risk ---

pub static RISK_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "nexus_risk_decisions_total",
        "Risk gate decisions by verdict",
        &["verdict"]
    )
    .expect("risk_decisions counter")
});

pub static TRADING_HALTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("nexus_trading_halted", "1 while the kill switch is tripped")
        .expect("trading_halted gauge")
});

// --- Orders ---

pub static ORDER_SUBMISSIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_order_submissions_total",
        "Orders accepted by an exchange"
    )
    .expect("order_submissions counter")
});

pub static ORDER_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_order_retries_total",
        "Order submissions retried after a transient failure"
    )
    .expect("order_retries counter")
});

pub static ORDER_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_order_failures_total",
        "Order submissions that failed after all attempts"
    )
    .expect("order_failures counter")
});

pub static ORDER_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "nexus_order_latency_seconds",
        "Round-trip latency of accepted order submissions",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("order_latency histogram")
});

// --- Bots ---

pub static BOT_EXECUTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("nexus_bot_executions_total", "Completed bot executions")
        .expect("bot_executions counter")
});

pub static BOT_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("nexus_bot_failures_total", "Failed bot executions")
        .expect("bot_failures counter")
});

pub static BOT_PAUSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_bot_auto_pauses_total",
        "Bots paused after consecutive failures"
    )
    .expect("bot_pauses counter")
});

pub static BOT_ABANDONED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "nexus_bot_abandoned_total",
        "Executions aborted at shutdown after the grace period"
    )
    .expect("bot_abandoned counter")
});

pub static EXECUTION_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "nexus_bot_execution_seconds",
        "Wall time of one bot execution",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .expect("execution_latency histogram")
});

pub fn inc_view_publications() {
    VIEW_PUBLICATIONS.inc();
}

pub fn inc_subscriber_drops() {
    SUBSCRIBER_DROPS.inc();
}

pub fn inc_stale_views() {
    STALE_VIEWS.inc();
}

pub fn inc_aggregation_tasks() {
    AGGREGATION_TASKS.inc();
}

pub fn dec_aggregation_tasks() {
    AGGREGATION_TASKS.dec();
}

pub fn inc_exchange_disconnected(exchange: &str) {
    EXCHANGE_DISCONNECTED.with_label_values(&[exchange]).inc();
}

pub fn inc_risk_decision(verdict: &str) {
    RISK_DECISIONS.with_label_values(&[verdict]).inc();
}

pub fn set_halted(halted: bool) {
    TRADING_HALTED.set(i64::from(halted));
}

pub fn inc_order_submissions() {
    ORDER_SUBMISSIONS.inc();
}

pub fn inc_order_retries() {
    ORDER_RETRIES.inc();
}

pub fn inc_order_failures() {
    ORDER_FAILURES.inc();
}

pub fn observe_order_latency(duration_sec: f64) {
    ORDER_LATENCY.observe(duration_sec);
}

pub fn inc_bot_executions() {
    BOT_EXECUTIONS.inc();
}

pub fn inc_bot_failures() {
    BOT_FAILURES.inc();
}

pub fn inc_bot_pauses() {
    BOT_PAUSES.inc();
}

pub fn inc_bot_abandoned(count: u64) {
    BOT_ABANDONED.inc_by(count);
}

pub fn observe_execution_latency(duration_sec: f64) {
    EXECUTION_LATENCY.observe(duration_sec);
}

/// Text exposition of the default registry.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!("⚠️ Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        inc_risk_decision("allow");
        inc_order_submissions();
        let text = render();
        assert!(text.contains("nexus_risk_decisions_total"));
        assert!(text.contains("nexus_order_submissions_total"));
    }
}
