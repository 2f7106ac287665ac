//! Background lease renewal for in-flight messages.

use crate::broker::QueueBroker;
use crate::envelope::ReceivedMessage;
use crate::error::WorkerError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Renews one message's lock on a fixed interval until dropped.
///
/// Renewal stops on its own once `max_duration` has passed since the message was
/// received, or when the broker reports the lock as lost. Dropping the handle
/// cancels the task, so the lease is never extended past settlement.
pub struct LeaseRenewal {
    handle: JoinHandle<()>,
}

impl LeaseRenewal {
    pub fn spawn(
        broker: Arc<dyn QueueBroker>,
        message: ReceivedMessage,
        interval: Duration,
        max_duration: Duration,
    ) -> Self {
        let interval = interval.max(Duration::from_millis(10));
        let deadline = Instant::now() + max_duration;

        let handle = tokio::spawn(async move {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining < interval {
                    debug!(
                        message_id = %message.message_id(),
                        "Lock renewal ceiling reached, lease will lapse"
                    );
                    break;
                }
                tokio::time::sleep(interval).await;

                match broker.renew_lock(&message).await {
                    Ok(()) => debug!(message_id = %message.message_id(), "Renewed message lock"),
                    Err(WorkerError::LockLost { .. }) => {
                        warn!(
                            message_id = %message.message_id(),
                            "Message lock lost, broker will redeliver"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(
                            message_id = %message.message_id(),
                            error = %e,
                            "Lock renewal failed, will retry"
                        );
                    }
                }
            }
        });

        Self { handle }
    }

    /// Stop renewing. Equivalent to dropping the handle.
    pub fn stop(self) {}

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LeaseRenewal {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{OutgoingMessage, SubQueue};
    use crate::memory::InMemoryBroker;

    async fn received(broker: &InMemoryBroker) -> ReceivedMessage {
        broker
            .enqueue("q", OutgoingMessage::json(&serde_json::json!({"n": 1})).unwrap())
            .await;
        broker
            .receive("q", SubQueue::Active, 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lock_alive() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let message = received(&broker).await;

        let lease = LeaseRenewal::spawn(
            broker.clone(),
            message.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!lease.is_finished());
        assert!(broker.complete(&message).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_stops_at_ceiling() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let message = received(&broker).await;

        let lease = LeaseRenewal::spawn(
            broker.clone(),
            message.clone(),
            Duration::from_secs(10),
            Duration::from_secs(60),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(lease.is_finished());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(
            broker.complete(&message).await,
            Err(WorkerError::LockLost { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_lease_lets_lock_lapse() {
        let broker = Arc::new(InMemoryBroker::new(Duration::from_secs(30)));
        let message = received(&broker).await;

        let lease = LeaseRenewal::spawn(
            broker.clone(),
            message.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        drop(lease);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(broker.renew_lock(&message).await.is_err());
    }
}
