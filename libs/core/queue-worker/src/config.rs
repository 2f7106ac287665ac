//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the queue worker.

use crate::registry::QueueDef;
use std::time::Duration;

/// Configuration for the queue worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume
    pub queue_name: String,

    /// Maximum handlers running at once
    pub max_concurrent_calls: usize,

    /// Messages requested per receive call
    pub receive_batch_size: usize,

    /// How long a receive call waits for messages
    pub receive_wait: Duration,

    /// Delivery count at which a failed message is dead-lettered
    pub max_delivery_count: u32,

    /// Interval between lease renewals (None = half the broker's lock duration)
    pub lock_renewal_interval: Option<Duration>,

    /// Ceiling on total renewal time per message
    pub max_lock_renewal: Duration,

    /// Maximum backoff after consecutive receive errors
    pub max_error_backoff: Duration,
}

impl WorkerConfig {
    /// Create a new WorkerConfig from a QueueDef
    pub fn from_queue_def<Q: QueueDef>() -> Self {
        Self::new(Q::QUEUE_NAME)
            .with_max_concurrent_calls(Q::MAX_CONCURRENT_CALLS)
            .with_max_delivery_count(Q::MAX_DELIVERY_COUNT)
            .with_max_lock_renewal(Duration::from_secs(Q::MAX_LOCK_RENEWAL_SECS))
    }

    /// Create a new WorkerConfig with defaults for everything but the queue name
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            max_concurrent_calls: 10,
            receive_batch_size: 10,
            receive_wait: Duration::from_secs(5),
            max_delivery_count: 3,
            lock_renewal_interval: None,
            max_lock_renewal: Duration::from_secs(300),
            max_error_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_max_concurrent_calls(mut self, count: usize) -> Self {
        self.max_concurrent_calls = count.max(1);
        self
    }

    pub fn with_receive_batch_size(mut self, size: usize) -> Self {
        self.receive_batch_size = size.max(1);
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count.max(1);
        self
    }

    pub fn with_lock_renewal_interval(mut self, interval: Duration) -> Self {
        self.lock_renewal_interval = Some(interval);
        self
    }

    pub fn with_max_lock_renewal(mut self, duration: Duration) -> Self {
        self.max_lock_renewal = duration;
        self
    }

    pub fn with_max_error_backoff(mut self, backoff: Duration) -> Self {
        self.max_error_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestQueue;

    impl QueueDef for TestQueue {
        const QUEUE_NAME: &'static str = "test-queue";
        const MAX_CONCURRENT_CALLS: usize = 4;
    }

    #[test]
    fn test_from_queue_def() {
        let config = WorkerConfig::from_queue_def::<TestQueue>();

        assert_eq!(config.queue_name, "test-queue");
        assert_eq!(config.max_concurrent_calls, 4);
        assert_eq!(config.max_delivery_count, 3);
        assert_eq!(config.max_lock_renewal, Duration::from_secs(300));
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("my-queue")
            .with_receive_batch_size(0)
            .with_max_concurrent_calls(0)
            .with_receive_wait(Duration::from_millis(250))
            .with_lock_renewal_interval(Duration::from_secs(10));

        assert_eq!(config.receive_batch_size, 1);
        assert_eq!(config.max_concurrent_calls, 1);
        assert_eq!(config.receive_wait, Duration::from_millis(250));
        assert_eq!(config.lock_renewal_interval, Some(Duration::from_secs(10)));
    }
}
