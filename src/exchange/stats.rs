use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::model::{ConnectionHealth, LatencyPercentiles};

const LATENCY_WINDOW: usize = 512;

/// Self-reported adapter counters.
///
/// Counters are atomics so producers (socket readers, REST calls) never
/// contend with readers; the latency window sits behind a short mutex that is
/// only held to push or copy samples.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connected: AtomicBool,
    reconnects: AtomicU64,
    messages: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
    latencies_us: Mutex<VecDeque<u64>>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was && self.messages.load(Ordering::Relaxed) > 0 {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self, bytes: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: impl Into<String>) {
        *self.last_error.lock() = Some(error.into());
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let mut window = self.latencies_us.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed.as_micros() as u64);
    }

    pub fn latency(&self) -> LatencyPercentiles {
        let mut samples: Vec<u64> = self.latencies_us.lock().iter().copied().collect();
        if samples.is_empty() {
            return LatencyPercentiles::default();
        }
        samples.sort_unstable();
        LatencyPercentiles {
            p50_ms: percentile(&samples, 50.0),
            p95_ms: percentile(&samples, 95.0),
            p99_ms: percentile(&samples, 99.0),
            samples: samples.len(),
        }
    }

    pub fn snapshot(&self, exchange: &str) -> ConnectionHealth {
        ConnectionHealth {
            exchange: exchange.to_string(),
            connected: self.is_connected(),
            reconnect_count: self.reconnects.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            messages_received: self.messages.load(Ordering::Relaxed),
            bytes_received: self.bytes.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            latency: self.latency(),
        }
    }
}

/// Nearest-rank percentile over sorted microsecond samples, in milliseconds.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx] as f64 / 1000.0
}
