use crate::broker::QueueBroker;
use crate::envelope::{Envelope, ReceivedMessage, SubQueue};
use crate::error::WorkerError;
use crate::metrics;
use crate::senders::SenderCache;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_MESSAGES: usize = 100;

/// Which dead-lettered messages to resubmit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessFilter {
    /// Inclusive lower bound on enqueue time
    #[serde(default)]
    pub from_date: Option<DateTime<Utc>>,
    /// Exclusive upper bound on enqueue time
    #[serde(default)]
    pub to_date: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the dead-letter reason
    #[serde(default)]
    pub error_reason_filter: Option<String>,
    /// Hard cap on messages considered in one run
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

impl Default for ReprocessFilter {
    fn default() -> Self {
        Self {
            from_date: None,
            to_date: None,
            error_reason_filter: None,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

/// Why a message was discarded instead of resubmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BeforeFromDate,
    NotBeforeToDate,
    ReasonMismatch,
}

impl ReprocessFilter {
    pub fn with_from_date(mut self, from: DateTime<Utc>) -> Self {
        self.from_date = Some(from);
        self
    }

    pub fn with_to_date(mut self, to: DateTime<Utc>) -> Self {
        self.to_date = Some(to);
        self
    }

    pub fn with_error_reason(mut self, reason: impl Into<String>) -> Self {
        self.error_reason_filter = Some(reason.into());
        self
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = max;
        self
    }

    /// Apply the date and reason filters, in that order.
    pub fn evaluate(&self, envelope: &Envelope) -> Result<(), SkipReason> {
        if let Some(from) = self.from_date
            && envelope.enqueued_time < from
        {
            return Err(SkipReason::BeforeFromDate);
        }

        if let Some(to) = self.to_date
            && envelope.enqueued_time >= to
        {
            return Err(SkipReason::NotBeforeToDate);
        }

        if let Some(needle) = self.error_reason_filter.as_deref().filter(|f| !f.is_empty()) {
            let matches = envelope
                .dead_letter_reason
                .as_deref()
                .is_some_and(|reason| reason.to_lowercase().contains(&needle.to_lowercase()));
            if !matches {
                return Err(SkipReason::ReasonMismatch);
            }
        }

        Ok(())
    }
}

/// Counts for one reprocess run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessBatchResult {
    /// Resubmitted to the live queue and removed from the DLQ
    pub processed_count: u64,
    /// Filtered out and removed from the DLQ without resubmission
    pub skipped_count: u64,
    /// Resubmission failed; left in the DLQ
    pub failed_count: u64,
}

impl ReprocessBatchResult {
    pub fn total(&self) -> u64 {
        self.processed_count + self.skipped_count + self.failed_count
    }
}

/// Moves dead-lettered messages back onto the live queue with fresh identities.
///
/// Each message is settled on its own; a run that fails part-way keeps the
/// progress made so far, and the counts reached are logged and recorded
/// before the error is returned.
#[derive(Clone)]
pub struct DlqReprocessor {
    broker: Arc<dyn QueueBroker>,
    senders: Arc<SenderCache>,
    queue_name: String,
    page_size: usize,
    page_wait: Duration,
}

impl DlqReprocessor {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        senders: Arc<SenderCache>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            senders,
            queue_name: queue_name.into(),
            page_size: 10,
            page_wait: Duration::from_secs(2),
        }
    }

    /// Messages requested per DLQ receive (at most 10)
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.clamp(1, 10);
        self
    }

    pub fn with_page_wait(mut self, wait: Duration) -> Self {
        self.page_wait = wait;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub async fn reprocess(
        &self,
        filter: &ReprocessFilter,
    ) -> Result<ReprocessBatchResult, WorkerError> {
        info!(
            queue = %self.queue_name,
            from_date = ?filter.from_date,
            to_date = ?filter.to_date,
            error_reason_filter = ?filter.error_reason_filter,
            max_messages = filter.max_messages,
            "Starting DLQ reprocessing"
        );

        let mut result = ReprocessBatchResult::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut considered = 0usize;

        while considered < filter.max_messages {
            let page = (filter.max_messages - considered).min(self.page_size);
            let messages = match self
                .broker
                .receive(&self.queue_name, SubQueue::DeadLetter, page, self.page_wait)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    self.record(&result);
                    error!(
                        queue = %self.queue_name,
                        error = %e,
                        processed = result.processed_count,
                        skipped = result.skipped_count,
                        failed = result.failed_count,
                        "DLQ receive failed, reprocessing aborted"
                    );
                    return Err(e);
                }
            };

            if messages.is_empty() {
                debug!("No more messages in DLQ");
                break;
            }

            let mut fresh = 0;
            for message in messages {
                // Abandoned earlier in this run; it cycles back until the DLQ is exhausted
                if !seen.insert(message.envelope.message_id.clone()) {
                    self.release(&message).await;
                    continue;
                }
                fresh += 1;
                considered += 1;
                self.reprocess_one(&message, filter, &mut result).await;
            }

            if fresh == 0 {
                break;
            }
        }

        self.record(&result);
        info!(
            queue = %self.queue_name,
            processed = result.processed_count,
            skipped = result.skipped_count,
            failed = result.failed_count,
            "DLQ reprocessing complete"
        );

        Ok(result)
    }

    async fn reprocess_one(
        &self,
        message: &ReceivedMessage,
        filter: &ReprocessFilter,
        result: &mut ReprocessBatchResult,
    ) {
        let envelope = &message.envelope;

        if let Err(skip) = filter.evaluate(envelope) {
            match self.broker.complete(message).await {
                Ok(()) => {
                    result.skipped_count += 1;
                    debug!(
                        message_id = %envelope.message_id,
                        skip = ?skip,
                        reason = ?envelope.dead_letter_reason,
                        "Skipped DLQ message"
                    );
                }
                Err(e) => {
                    result.failed_count += 1;
                    warn!(message_id = %envelope.message_id, error = %e, "Failed to discard DLQ message");
                    self.release(message).await;
                }
            }
            return;
        }

        let resubmitted = envelope.to_reprocessed(Utc::now());
        let new_message_id = resubmitted.message_id.clone();

        if let Err(e) = self.senders.send(&self.queue_name, resubmitted).await {
            result.failed_count += 1;
            error!(
                message_id = %envelope.message_id,
                error = %e,
                "Failed to resubmit DLQ message, leaving it for inspection"
            );
            self.release(message).await;
            return;
        }

        result.processed_count += 1;
        if let Err(e) = self.broker.complete(message).await {
            // The copy is already live; the original may be resubmitted again by a later run
            warn!(
                original_message_id = %envelope.message_id,
                new_message_id = %new_message_id,
                error = %e,
                "Resubmitted DLQ message but could not remove the original"
            );
            return;
        }

        info!(
            original_message_id = %envelope.message_id,
            new_message_id = %new_message_id,
            correlation_id = ?envelope.correlation_id,
            reason = ?envelope.dead_letter_reason,
            "Reprocessed DLQ message"
        );
    }

    fn record(&self, result: &ReprocessBatchResult) {
        metrics::record_reprocess(
            &self.queue_name,
            result.processed_count,
            result.skipped_count,
            result.failed_count,
        );
    }

    async fn release(&self, message: &ReceivedMessage) {
        if let Err(e) = self.broker.abandon(message).await {
            warn!(message_id = %message.message_id(), error = %e, "Failed to abandon DLQ message");
        }
    }
}
