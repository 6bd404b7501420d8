//! Bounded, order-preserving update channels handed out by adapter subscriptions.
//!
//! Each subscription gets its own channel. When a consumer falls behind by
//! more than the channel capacity the oldest updates are discarded and counted;
//! the producer never waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

/// Producer half, owned by the adapter's connection task.
#[derive(Debug)]
pub struct StreamSender<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> StreamSender<T> {
    /// Publish an update. Returns false once the consumer has gone away so the
    /// adapter can prune this subscription.
    pub fn publish(&self, update: T) -> bool {
        self.tx.send(update).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.receiver_count() == 0
    }
}

/// Consumer half returned from `subscribe_*` calls.
#[derive(Debug)]
pub struct MarketStream<T> {
    rx: broadcast::Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T: Clone> MarketStream<T> {
    /// Next update in emission order, or `None` when the adapter closed the
    /// stream (disconnect or shutdown).
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Number of updates discarded because this consumer lagged.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared handle to the drop counter, for adapters that aggregate it into
    /// their connection health.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

pub fn stream_channel<T: Clone>(capacity: usize) -> (StreamSender<T>, MarketStream<T>) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (
        StreamSender { tx },
        MarketStream {
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
    )
}
