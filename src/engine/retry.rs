use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::EngineConfig;
use crate::exchange::adapter::{ExchangeError, ExchangeResult, TransientKind};
use crate::metrics;

/// Submission retry schedule.
///
/// `attempts` counts the first call. Each attempt runs under `deadline`;
/// only retryable errors are retried, with exponential backoff from
/// `base_delay`, each wait capped at `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub deadline: Duration,
}

/// Result of a retried call plus the number of calls made.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: ExchangeResult<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
            deadline: config.order_timeout(),
        }
    }

    /// Wait before attempt `attempt + 1`, after `attempt` failures.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.deadline)
    }

    pub async fn run<T, F, Fut>(&self, mut call: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(self.deadline, call()).await {
                Ok(result) => result,
                Err(_) => Err(ExchangeError::transient(
                    TransientKind::Timeout,
                    format!("no response within {:?}", self.deadline),
                )),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    let wait = self.backoff(attempt);
                    warn!(attempt, max = self.attempts, ?wait, "🔁 Retrying after transient error: {}", e);
                    metrics::inc_order_retries();
                    sleep(wait).await;
                }
                result => {
                    return Attempted {
                        result,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::adapter::PermanentKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(100),
            deadline: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_bounded() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let out = policy(3)
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::transient(TransientKind::RateLimited, "slow down"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(out.result, Ok(42));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Attempted<()> = policy(3)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::permanent(PermanentKind::InvalidOrder, "bad qty"))
            })
            .await;
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let out: Attempted<()> = policy(2)
            .run(|| async { Err(ExchangeError::Connection("refused".into())) })
            .await;
        assert_eq!(out.attempts, 2);
        assert!(matches!(out.result, Err(ExchangeError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out() {
        let out: Attempted<()> = policy(1)
            .run(|| futures::future::pending::<ExchangeResult<()>>())
            .await;
        assert!(matches!(
            out.result,
            Err(ExchangeError::Transient {
                kind: TransientKind::Timeout,
                ..
            })
        ));
    }
}
