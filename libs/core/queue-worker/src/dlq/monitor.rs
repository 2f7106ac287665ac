use crate::broker::QueueBroker;
use crate::error::WorkerError;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Result of one monitor check. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqAlert {
    pub queue_name: String,
    pub active_count: u64,
    pub dead_letter_count: u64,
    pub total_count: u64,
    pub threshold: u64,
    /// `dead_letter_count > threshold`
    pub breached: bool,
    pub checked_at: DateTime<Utc>,
}

/// Compares a queue's dead-letter depth against a threshold.
///
/// Read-only; scheduling the check is up to the caller.
#[derive(Clone)]
pub struct DlqMonitor {
    broker: Arc<dyn QueueBroker>,
    queue_name: String,
    threshold: u64,
}

impl DlqMonitor {
    pub fn new(broker: Arc<dyn QueueBroker>, queue_name: impl Into<String>, threshold: u64) -> Self {
        Self {
            broker,
            queue_name: queue_name.into(),
            threshold,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub async fn check(&self) -> Result<DlqAlert, WorkerError> {
        let props = self.broker.runtime_properties(&self.queue_name).await?;
        let breached = props.dead_letter_count > self.threshold;

        let alert = DlqAlert {
            queue_name: self.queue_name.clone(),
            active_count: props.active_count,
            dead_letter_count: props.dead_letter_count,
            total_count: props.total_count,
            threshold: self.threshold,
            breached,
            checked_at: Utc::now(),
        };

        metrics::record_dlq_depth(&self.queue_name, alert.dead_letter_count, breached);

        if breached {
            error!(
                queue = %alert.queue_name,
                dead_letter_count = alert.dead_letter_count,
                threshold = alert.threshold,
                active_count = alert.active_count,
                "DLQ ALERT: dead-letter count exceeds threshold"
            );
        } else {
            info!(
                queue = %alert.queue_name,
                active_count = alert.active_count,
                dead_letter_count = alert.dead_letter_count,
                total_count = alert.total_count,
                "DLQ check healthy"
            );
        }

        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, OutgoingMessage};
    use crate::memory::InMemoryBroker;

    fn dead_lettered(n: usize) -> Envelope {
        let mut envelope = OutgoingMessage::json(&serde_json::json!({ "n": n }))
            .unwrap()
            .into_envelope(Utc::now());
        envelope.dead_letter_reason = Some("Processing failed after multiple retries".into());
        envelope
    }

    #[tokio::test]
    async fn test_below_and_at_threshold_is_healthy() {
        let broker = InMemoryBroker::default();
        for n in 0..10 {
            broker.insert_dead_letter("q", dead_lettered(n));
        }
        broker
            .enqueue("q", OutgoingMessage::json(&1).unwrap())
            .await;

        let alert = DlqMonitor::new(Arc::new(broker), "q", 10).check().await.unwrap();

        assert_eq!(alert.dead_letter_count, 10);
        assert_eq!(alert.active_count, 1);
        assert_eq!(alert.total_count, 11);
        assert!(!alert.breached);
    }

    #[tokio::test]
    async fn test_above_threshold_breaches() {
        let broker = InMemoryBroker::default();
        for n in 0..11 {
            broker.insert_dead_letter("q", dead_lettered(n));
        }

        let alert = DlqMonitor::new(Arc::new(broker), "q", 10).check().await.unwrap();

        assert!(alert.breached);
        assert_eq!(alert.threshold, 10);
        assert_eq!(alert.queue_name, "q");
    }

    #[tokio::test]
    async fn test_check_has_no_side_effects() {
        let broker = InMemoryBroker::default();
        broker.insert_dead_letter("q", dead_lettered(0));
        let monitor = DlqMonitor::new(Arc::new(broker.clone()), "q", 0);

        monitor.check().await.unwrap();
        monitor.check().await.unwrap();

        assert_eq!(broker.messages("q", crate::SubQueue::DeadLetter).len(), 1);
    }
}
