//! Message envelope types
//!
//! An [`Envelope`] is one transport-level message instance. The broker owns it;
//! a consumer only ever holds a [`ReceivedMessage`], which pairs the envelope with
//! the lock token of its current lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Application property set on messages resubmitted from the dead-letter queue
pub const PROP_REPROCESSED_FROM_DLQ: &str = "reprocessedFromDLQ";
/// Application property carrying the message id of the dead-lettered original
pub const PROP_ORIGINAL_MESSAGE_ID: &str = "originalMessageId";
/// Application property carrying the RFC 3339 timestamp of the resubmission
pub const PROP_REPROCESSED_AT: &str = "reprocessedAt";

/// Transport unit as stored by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per send
    pub message_id: String,

    /// Stable across retries and reprocessing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Opaque serialized payload
    pub body: String,

    /// Incremented by the broker on every lock acquisition
    #[serde(default)]
    pub delivery_count: u32,

    /// Stamped by the broker when the message is accepted
    pub enqueued_time: DateTime<Utc>,

    /// Set only once dead-lettered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_error_description: Option<String>,

    #[serde(default)]
    pub application_properties: BTreeMap<String, Value>,
}

impl Envelope {
    /// Correlation id, falling back to the message id when the sender set none
    pub fn correlation_or_message_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.message_id)
    }

    /// Build the outgoing copy used to resubmit a dead-lettered message.
    ///
    /// The copy gets a fresh message id, keeps correlation id, subject, content type,
    /// body and properties, and gains the three reprocessing markers. Broker-assigned
    /// metadata (delivery count, enqueue time, dead-letter fields) is not carried over.
    pub fn to_reprocessed(&self, now: DateTime<Utc>) -> OutgoingMessage {
        let mut properties = self.application_properties.clone();
        properties.insert(PROP_REPROCESSED_FROM_DLQ.to_string(), Value::Bool(true));
        properties.insert(
            PROP_ORIGINAL_MESSAGE_ID.to_string(),
            Value::String(self.message_id.clone()),
        );
        properties.insert(
            PROP_REPROCESSED_AT.to_string(),
            Value::String(now.to_rfc3339()),
        );

        OutgoingMessage {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: self.correlation_id.clone(),
            subject: self.subject.clone(),
            content_type: self.content_type.clone(),
            body: self.body.clone(),
            application_properties: properties,
        }
    }
}

/// A message as handed to a sender, before the broker stamps delivery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: String,
    #[serde(default)]
    pub application_properties: BTreeMap<String, Value>,
}

impl OutgoingMessage {
    /// Create a JSON message with a fresh v4 message id
    pub fn json<T: Serialize>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            subject: None,
            content_type: Some("application/json".to_string()),
            body: serde_json::to_string(body)?,
            application_properties: BTreeMap::new(),
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Turn into a broker-side envelope, stamping enqueue time and a zero delivery count
    pub fn into_envelope(self, enqueued_time: DateTime<Utc>) -> Envelope {
        Envelope {
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            subject: self.subject,
            content_type: self.content_type,
            body: self.body,
            delivery_count: 0,
            enqueued_time,
            dead_letter_reason: None,
            dead_letter_error_description: None,
            application_properties: self.application_properties,
        }
    }
}

/// Which part of a queue to receive from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubQueue {
    Active,
    DeadLetter,
}

/// An envelope under lease by this consumer
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    /// Identifies the current lease; settlement with a stale token fails
    pub lock_token: String,
    pub locked_until: DateTime<Utc>,
    pub queue_name: String,
    pub sub_queue: SubQueue,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }

    pub fn delivery_count(&self) -> u32 {
        self.envelope.delivery_count
    }
}
