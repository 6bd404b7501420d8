use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;

/// Token bucket guarding an exchange's REST endpoints.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: usize, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec.max(f64::EPSILON),
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `amount` tokens if available, otherwise report how long until they are.
    fn try_take(&self, amount: f64) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= amount {
            state.tokens -= amount;
            Ok(())
        } else {
            let missing = amount - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    pub fn try_acquire(&self, amount: usize) -> bool {
        self.try_take(amount as f64).is_ok()
    }

    /// Wait until `amount` tokens can be taken.
    pub async fn acquire(&self, amount: usize) {
        let amount = (amount as f64).min(self.capacity);
        loop {
            match self.try_take(amount) {
                Ok(()) => return,
                Err(wait) => sleep(wait.max(Duration::from_millis(1))).await,
            }
        }
    }
}
