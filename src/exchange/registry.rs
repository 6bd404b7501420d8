use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::events::{EngineEvent, EventSink};
use crate::exchange::adapter::{ExchangeAdapter, ExchangeError, ExchangeResult, TransientKind};
use crate::model::{ConnectionHealth, ExchangeOrder, OrderRequest};

pub type SharedAdapter = Arc<dyn ExchangeAdapter + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Exchange '{0}' is not registered")]
    UnknownExchange(String),
    #[error("Exchange '{0}' is already registered")]
    Duplicate(String),
}

/// Owns every configured adapter, keyed by lowercase name.
#[derive(Default)]
pub struct ExchangeRegistry {
    adapters: RwLock<HashMap<String, SharedAdapter>>,
    health: RwLock<BTreeMap<String, ConnectionHealth>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, adapter: SharedAdapter) -> Result<(), RegistryError> {
        let key = name.to_lowercase();
        let mut map = self.adapters.write();
        if map.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        map.insert(key, adapter);
        info!("🔌 Registered Adapter: {}", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<SharedAdapter, RegistryError> {
        self.adapters
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownExchange(name.to_lowercase()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.read().contains_key(&name.to_lowercase())
    }

    /// Point-in-time copy; adapters registered later are not included.
    pub fn all(&self) -> BTreeMap<String, SharedAdapter> {
        self.adapters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    pub fn health_check(&self) -> BTreeMap<String, bool> {
        self.all()
            .into_iter()
            .map(|(name, adapter)| (name, adapter.is_connected()))
            .collect()
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, ConnectionHealth> {
        let snapshot: BTreeMap<String, ConnectionHealth> = self
            .all()
            .into_iter()
            .map(|(name, adapter)| (name, adapter.health()))
            .collect();
        *self.health.write() = snapshot.clone();
        snapshot
    }

    /// Health as of the last `health_snapshot` or checker tick.
    pub fn cached_health(&self) -> BTreeMap<String, ConnectionHealth> {
        self.health.read().clone()
    }

    /// Connect every adapter concurrently, each bounded by `deadline`.
    /// Failures are logged and returned; they do not abort the others.
    pub async fn connect_all(&self, deadline: Duration) -> BTreeMap<String, ExchangeResult<()>> {
        let attempts = self.all().into_iter().map(|(name, adapter)| async move {
            let result = match timeout(deadline, adapter.connect()).await {
                Ok(r) => r,
                Err(_) => Err(ExchangeError::transient(
                    TransientKind::Timeout,
                    format!("connect exceeded {:?}", deadline),
                )),
            };
            match &result {
                Ok(()) => info!("✅ Connected to {}", name),
                Err(e) => error!("❌ Failed to connect to {}: {}", name, e),
            }
            (name, result)
        });
        join_all(attempts).await.into_iter().collect()
    }

    pub async fn disconnect_all(&self) {
        let all = self.all();
        let tasks = all.iter().map(|(name, adapter)| async move {
            if let Err(e) = adapter.disconnect().await {
                warn!("⚠️ Disconnect from {} failed: {}", name, e);
            }
        });
        join_all(tasks).await;
    }

    pub async fn place_order(
        &self,
        exchange: &str,
        request: OrderRequest,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let adapter = self
            .get(exchange)
            .map_err(|e| ExchangeError::Configuration(e.to_string()))?;
        adapter.place_order(request).await
    }

    /// Periodically refresh the cached health map and emit a
    /// `ConnectionHealth` event per exchange until `shutdown` flips.
    pub fn spawn_health_checker(
        self: &Arc<Self>,
        every: Duration,
        sink: Arc<dyn EventSink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for health in registry.health_snapshot().into_values() {
                            if !health.connected {
                                warn!("⚠️ Exchange {} reports disconnected", health.exchange);
                            }
                            sink.emit(EngineEvent::ConnectionHealth(health));
                        }
                    }
                }
            }
            debug!("Health checker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::exchange::paper::PaperAdapter;

    #[test]
    fn test_names_are_case_insensitive() {
        let registry = ExchangeRegistry::new();
        registry
            .register("Paper", Arc::new(PaperAdapter::new("paper")))
            .unwrap();
        assert!(registry.get("PAPER").is_ok());
        assert!(registry.contains("paper"));
        assert_eq!(
            registry.get("kraken").err(),
            Some(RegistryError::UnknownExchange("kraken".into()))
        );
        assert!(matches!(
            registry.register("paper", Arc::new(PaperAdapter::new("paper"))),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_all_and_health() {
        let registry = ExchangeRegistry::new();
        registry.register("a", Arc::new(PaperAdapter::new("a"))).unwrap();
        registry.register("b", Arc::new(PaperAdapter::new("b"))).unwrap();
        assert_eq!(registry.health_check().values().filter(|c| **c).count(), 0);

        let results = registry.connect_all(Duration::from_secs(1)).await;
        assert!(results.values().all(|r| r.is_ok()));
        assert!(registry.health_check().values().all(|c| *c));
        assert_eq!(registry.health_snapshot().len(), 2);
        assert_eq!(registry.cached_health().len(), 2);
    }

    #[tokio::test]
    async fn test_health_checker_emits_and_stops() {
        let registry = Arc::new(ExchangeRegistry::new());
        registry.register("a", Arc::new(PaperAdapter::new("a"))).unwrap();
        let (sink, mut rx) = ChannelSink::new(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = registry.spawn_health_checker(Duration::from_millis(10), Arc::new(sink), stop_rx);
        match rx.recv().await {
            Some(EngineEvent::ConnectionHealth(h)) => assert_eq!(h.exchange, "a"),
            other => panic!("unexpected {:?}", other),
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
