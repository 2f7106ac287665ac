use super::ResilienceError;
use crate::metrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Concurrency limits for one dependency
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once
    pub max_parallel: usize,
    /// Callers allowed to wait for a slot; anyone beyond this is rejected
    pub max_queued: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            max_queued: 20,
        }
    }
}

impl BulkheadConfig {
    pub fn new(max_parallel: usize, max_queued: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            max_queued,
        }
    }
}

/// Slot held for the duration of one call
pub type BulkheadPermit = OwnedSemaphorePermit;

/// Semaphore with a bounded wait queue
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    slots: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(config.max_parallel)),
            queued: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Take a slot, waiting in the queue if needed.
    ///
    /// Returns [`ResilienceError::BulkheadRejected`] immediately when the queue is full.
    pub async fn acquire(&self) -> Result<BulkheadPermit, ResilienceError> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let position = self.queued.fetch_add(1, Ordering::SeqCst);
        let _waiting = QueueSlot(self.queued.clone());
        if position >= self.config.max_queued {
            metrics::record_bulkhead_rejection(&self.name);
            return Err(self.rejected());
        }

        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.rejected())
    }

    /// Calls currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.config.max_parallel - self.slots.available_permits()
    }

    /// Callers currently waiting for a slot
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn rejected(&self) -> ResilienceError {
        ResilienceError::BulkheadRejected {
            name: self.name.clone(),
        }
    }
}

/// Leaves the wait queue on drop, including when the waiting future is cancelled
struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rejects_beyond_parallel_plus_queue() {
        let bulkhead = Arc::new(Bulkhead::new("booking", BulkheadConfig::new(2, 1)));

        let first = bulkhead.acquire().await.unwrap();
        let _second = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 2);

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await.map(|_| ()) })
        };
        while bulkhead.queued() == 0 {
            tokio::task::yield_now().await;
        }

        let rejected = bulkhead.acquire().await;
        assert!(matches!(
            rejected,
            Err(ResilienceError::BulkheadRejected { .. })
        ));

        drop(first);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(bulkhead.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_queue() {
        let bulkhead = Bulkhead::new("booking", BulkheadConfig::new(1, 1));
        let _held = bulkhead.acquire().await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(10), bulkhead.acquire()).await;
        assert!(waited.is_err());
        assert_eq!(bulkhead.queued(), 0);

        // Queue slot is free again, so this caller waits instead of being rejected
        let waited = tokio::time::timeout(Duration::from_millis(10), bulkhead.acquire()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_default_limits() {
        let config = BulkheadConfig::default();
        assert_eq!(config.max_parallel, 10);
        assert_eq!(config.max_queued, 20);
    }
}
