use queue_worker::{Classify, ErrorCategory, ResilienceError, WorkerError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy not found: {0}")]
    NotFound(Uuid),

    /// Transport failure, 5xx or 408 from the booking system
    #[error("Booking system unavailable: {0}")]
    BookingUnavailable(String),

    /// Any other non-2xx from the booking system
    #[error("Booking system rejected request: {0}")]
    BookingRejected(String),

    #[error("Invalid booking system response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error("File generation failed: {0}")]
    File(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type PolicyResult<T> = Result<T, PolicyError>;

impl PolicyError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PolicyError::NotFound(_) => ErrorCategory::Permanent,
            PolicyError::BookingUnavailable(_) => ErrorCategory::Transient,
            PolicyError::BookingRejected(_) => ErrorCategory::Permanent,
            PolicyError::InvalidResponse(_) => ErrorCategory::Permanent,
            PolicyError::Resilience(e) => e.category(),
            PolicyError::File(_) => ErrorCategory::Transient,
            PolicyError::Database(_) => ErrorCategory::Transient,
            PolicyError::Config(_) => ErrorCategory::Permanent,
        }
    }
}

impl Classify for PolicyError {
    fn category(&self) -> ErrorCategory {
        PolicyError::category(self)
    }
}

impl From<sea_orm::DbErr> for PolicyError {
    fn from(err: sea_orm::DbErr) -> Self {
        PolicyError::Database(err.to_string())
    }
}

impl From<std::io::Error> for PolicyError {
    fn from(err: std::io::Error) -> Self {
        PolicyError::File(err.to_string())
    }
}

/// Convert PolicyError to WorkerError, keeping the category for settlement
impl From<PolicyError> for WorkerError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Resilience(e) => WorkerError::Resilience(e),
            other => WorkerError::Processing {
                message: other.to_string(),
                category: other.category(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_categories() {
        assert_eq!(
            PolicyError::NotFound(Uuid::nil()).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            PolicyError::BookingUnavailable("HTTP 503".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            PolicyError::BookingRejected("HTTP 400".into()).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            PolicyError::Database("connection reset".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            PolicyError::from(ResilienceError::CircuitOpen {
                name: "booking-system".into()
            })
            .category(),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(
            PolicyError::from(ResilienceError::Timeout(Duration::from_secs(10))).category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_worker_error_keeps_category() {
        let worker: WorkerError = PolicyError::NotFound(Uuid::nil()).into();
        assert_eq!(worker.category(), ErrorCategory::Permanent);
        assert!(worker.to_string().contains("Policy not found"));

        let worker: WorkerError = PolicyError::from(ResilienceError::BulkheadRejected {
            name: "booking-system".into(),
        })
        .into();
        assert!(matches!(worker, WorkerError::Resilience(_)));
        assert_eq!(worker.category(), ErrorCategory::ResourceExhausted);
    }
}
