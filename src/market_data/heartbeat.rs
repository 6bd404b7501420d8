use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::exchange::ExchangeRegistry;
use crate::metrics;

/// Periodically flags registered exchanges whose adapter reports
/// `is_connected() == false`. Advisory only: reconnecting is the adapter's job.
pub struct HeartbeatMonitor {
    registry: Arc<ExchangeRegistry>,
    every: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ExchangeRegistry>, every: Duration) -> Self {
        Self { registry, every }
    }

    /// One pass over the registry. Returns the disconnected exchange names.
    pub fn check(&self) -> Vec<String> {
        let mut down = Vec::new();
        for (name, adapter) in self.registry.all() {
            if !adapter.is_connected() {
                warn!(exchange = %name, "⚠️ Heartbeat: exchange disconnected");
                metrics::inc_exchange_disconnected(&name);
                down.push(name);
            }
        }
        down
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        self.check();
                    }
                }
            }
            debug!("Heartbeat monitor stopped");
        })
    }
}
