use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

/// Source of wall-clock time for order records and events.
pub trait TimeProvider: Send + Sync {
    fn now_millis(&self) -> i64;
    fn now(&self) -> DateTime<Utc>;
}

/// Source of client order ids.
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Providers handed to the engine and its executors.
#[derive(Clone)]
pub struct ExecutionContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
}

impl ExecutionContext {
    pub fn new_system() -> Self {
        Self {
            time: Arc::new(SystemTimeProvider),
            id: Arc::new(RandomIdProvider),
        }
    }

    /// Fixed clock and sequential ids, for tests.
    pub fn new_simulated(start_time_ms: i64) -> Self {
        Self {
            time: Arc::new(SimulatedTimeProvider::new(start_time_ms)),
            id: Arc::new(SequentialIdProvider::new("nx")),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new_system()
    }
}

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// UUIDv4 without hyphens; fits the 36-char client id limit on every venue.
pub struct RandomIdProvider;

impl IdProvider for RandomIdProvider {
    fn new_id(&self) -> String {
        format!("nx{}", Uuid::new_v4().simple())
    }
}

pub struct SimulatedTimeProvider {
    current_time_ms: AtomicI64,
}

impl SimulatedTimeProvider {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            current_time_ms: AtomicI64::new(start_time_ms),
        }
    }

    pub fn set_time(&self, time_ms: i64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, duration_ms: i64) {
        self.current_time_ms.fetch_add(duration_ms, Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTimeProvider {
    fn now_millis(&self) -> i64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_default()
    }
}

pub struct SequentialIdProvider {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdProvider for SequentialIdProvider {
    fn new_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:08}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_time_advances() {
        let clock = SimulatedTimeProvider::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);
        assert_eq!(clock.now().timestamp_millis(), 1_500);
        clock.set_time(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdProvider::new("bot");
        assert_eq!(ids.new_id(), "bot-00000001");
        assert_eq!(ids.new_id(), "bot-00000002");
    }

    #[test]
    fn test_random_ids_are_unique_and_short() {
        let ids = RandomIdProvider;
        let a = ids.new_id();
        let b = ids.new_id();
        assert_ne!(a, b);
        assert!(a.len() <= 36);
    }
}
