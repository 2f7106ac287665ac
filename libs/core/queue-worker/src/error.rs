//! Worker error types and error categorization
//!
//! Every failure is classified into one of three closed categories:
//! - **Transient**: temporary failure, eligible for retry and redelivery
//! - **Permanent**: will never succeed, dead-letter without further attempts
//! - **ResourceExhausted**: a resilience guard (circuit breaker, bulkhead) refused the call

use crate::resilience::ResilienceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Category of error for determining retry and settlement behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure (network, 5xx, timeout)
    Transient,
    /// Unrecoverable failure (bad payload, missing entity, 4xx)
    Permanent,
    /// Rejected by the circuit breaker or bulkhead
    ResourceExhausted,
}

impl ErrorCategory {
    /// Whether the in-call retry policy should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can report its [`ErrorCategory`].
///
/// The resilience pipeline and the consumer classify failures through this
/// trait only, so domain errors never need to be downcast.
pub trait Classify {
    fn category(&self) -> ErrorCategory;
}

/// Queue worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message body could not be decoded into the expected command
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Handler failed
    #[error("Processing error: {message}")]
    Processing {
        message: String,
        category: ErrorCategory,
    },

    /// Circuit open, bulkhead full or call timed out
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// The lock token no longer owns the message
    #[error("Lock lost for message {message_id}")]
    LockLost { message_id: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl WorkerError {
    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        WorkerError::Processing {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        WorkerError::Processing {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    /// Create a resource-exhausted processing error
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        WorkerError::Processing {
            message: message.into(),
            category: ErrorCategory::ResourceExhausted,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkerError::Redis(_) => ErrorCategory::Transient,
            WorkerError::Serialization(_) => ErrorCategory::Permanent,
            WorkerError::InvalidMessage(_) => ErrorCategory::Permanent,
            WorkerError::Processing { category, .. } => *category,
            WorkerError::Resilience(e) => e.category(),
            WorkerError::LockLost { .. } => ErrorCategory::Transient,
            WorkerError::Config(_) => ErrorCategory::Permanent,
            WorkerError::Shutdown => ErrorCategory::Transient,
        }
    }
}

impl Classify for WorkerError {
    fn category(&self) -> ErrorCategory {
        WorkerError::category(self)
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}
