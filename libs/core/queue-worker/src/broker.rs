//! Broker abstraction
//!
//! Peek-lock queue semantics expressed as traits so the consumer, the DLQ monitor
//! and the DLQ reprocessor run unchanged against Redis Streams or the in-memory broker.

use crate::envelope::{OutgoingMessage, ReceivedMessage, SubQueue};
use crate::error::WorkerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Message counts for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRuntimeProperties {
    pub active_count: u64,
    pub dead_letter_count: u64,
    pub total_count: u64,
}

/// Receive and settle messages with manual completion.
///
/// Nothing is acknowledged implicitly: every received message must end in exactly one
/// of `complete`, `abandon` or `dead_letter`, or its lease expires and the broker
/// hands it out again with an incremented delivery count.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `max_wait` when nothing is available.
    /// Each returned message is locked for this consumer.
    async fn receive(
        &self,
        queue: &str,
        sub_queue: SubQueue,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, WorkerError>;

    /// Remove the message permanently
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), WorkerError>;

    /// Release the lock so the message becomes available again
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), WorkerError>;

    /// Move the message to the queue's dead-letter sub-queue
    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), WorkerError>;

    /// Extend the lease; fails with [`WorkerError::LockLost`] if the lock already lapsed
    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<(), WorkerError>;

    async fn runtime_properties(&self, queue: &str)
    -> Result<QueueRuntimeProperties, WorkerError>;

    /// How long a lease lasts without renewal
    fn lock_duration(&self) -> Duration;
}

/// Sends messages to one destination
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn destination(&self) -> &str;

    async fn send(&self, message: OutgoingMessage) -> Result<(), WorkerError>;
}

/// Creates senders; the [`crate::SenderCache`] calls this at most once per destination
#[async_trait]
pub trait SenderFactory: Send + Sync {
    async fn create_sender(&self, destination: &str) -> Result<Arc<dyn MessageSender>, WorkerError>;
}
