//! Queue definitions and handler traits.
//!
//! This module provides:
//! - `QueueDef` trait for domain-specific queue definitions
//! - `QueueJob` trait for decoded message payloads
//! - `MessageHandler` trait implemented by domain processors
//! - `MessageContext` carrying broker metadata into the handler

use crate::envelope::ReceivedMessage;
use crate::error::WorkerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

/// Queue definition trait.
///
/// Each domain implements this trait to describe the queue it consumes.
///
/// # Example
///
/// ```rust,ignore
/// use queue_worker::QueueDef;
///
/// pub struct PolicyProcessingQueue;
///
/// impl QueueDef for PolicyProcessingQueue {
///     const QUEUE_NAME: &'static str = "policy-processing-queue";
/// }
/// ```
pub trait QueueDef: Send + Sync {
    /// Queue name; the dead-letter sub-queue is derived from it by the broker.
    const QUEUE_NAME: &'static str;

    /// Delivery count at which a failed message is dead-lettered.
    const MAX_DELIVERY_COUNT: u32 = 3;

    /// Handlers running concurrently.
    const MAX_CONCURRENT_CALLS: usize = 10;

    /// Ceiling on how long a lease is renewed for one message.
    const MAX_LOCK_RENEWAL_SECS: u64 = 300;
}

/// Decoded message payload.
pub trait QueueJob: DeserializeOwned + Send + Sync + 'static {
    /// Identifier of the business entity the job targets, for logs.
    fn entity_id(&self) -> String;
}

/// Broker metadata for the message being handled
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: String,
    pub correlation_id: String,
    pub delivery_count: u32,
    pub enqueued_time: DateTime<Utc>,
    pub subject: Option<String>,
}

impl From<&ReceivedMessage> for MessageContext {
    fn from(message: &ReceivedMessage) -> Self {
        let envelope = &message.envelope;
        Self {
            message_id: envelope.message_id.clone(),
            correlation_id: envelope.correlation_or_message_id().to_string(),
            delivery_count: envelope.delivery_count,
            enqueued_time: envelope.enqueued_time,
            subject: envelope.subject.clone(),
        }
    }
}

/// Domain processing for one decoded message.
///
/// Returning `Ok` completes the message. An error is classified by its
/// [`crate::ErrorCategory`] and routed to abandon or dead-letter by the worker.
/// Handlers may see the same message more than once and must persist idempotently.
#[async_trait]
pub trait MessageHandler<J: QueueJob>: Send + Sync + 'static {
    async fn handle(&self, job: &J, ctx: &MessageContext) -> Result<(), WorkerError>;

    /// Handler name for logs and metrics.
    fn name(&self) -> &'static str;
}
