//! Resilience policies for outbound calls.
//!
//! A [`ResiliencePipeline`] composes four policies in a fixed order, outermost first:
//!
//! ```text
//! bulkhead ─> circuit breaker ─> retry ─> timeout ─> call
//! ```
//!
//! - **Bulkhead**: at most `max_parallel` calls in flight, `max_queued` waiting, the rest rejected
//! - **Circuit breaker**: opens after consecutive transient failures, half-opens after the break
//! - **Retry**: transient errors only, exponential backoff (`base * 2^attempt`)
//! - **Timeout**: pessimistic, the attempt's future is dropped when the budget runs out
//!
//! The pipeline is generic over the caller's error type. It only needs to classify
//! errors ([`Classify`]) and to express its own rejections ([`ResilienceError`]).
//!
//! ## Example
//!
//! ```rust,ignore
//! use queue_worker::resilience::{ResilienceConfig, ResiliencePipeline};
//!
//! let pipeline = ResiliencePipeline::new(ResilienceConfig::new("booking-system"));
//! let response = pipeline.execute(|| client.post_booking(&request)).await?;
//! ```

mod bulkhead;
mod circuit_breaker;
mod retry;
mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitPermit, CircuitState,
};
pub use retry::RetryPolicy;
pub use timeout::with_timeout;

use crate::error::{Classify, ErrorCategory};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Rejections produced by the policies themselves
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("bulkhead '{name}' rejected the call")]
    BulkheadRejected { name: String },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl Classify for ResilienceError {
    fn category(&self) -> ErrorCategory {
        match self {
            ResilienceError::CircuitOpen { .. } | ResilienceError::BulkheadRejected { .. } => {
                ErrorCategory::ResourceExhausted
            }
            ResilienceError::Timeout(_) => ErrorCategory::Transient,
        }
    }
}

/// Settings for all four policies
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Used in logs, metrics and rejection errors
    pub name: String,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    /// Budget for one attempt
    pub timeout: Duration,
    pub bulkhead: BulkheadConfig,
}

impl ResilienceConfig {
    /// Defaults: 3 retries at 2s/4s/8s, breaker 5 failures / 30s, 10s timeout, bulkhead 10 + 20
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            timeout: Duration::from_secs(10),
            bulkhead: BulkheadConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.bulkhead = bulkhead;
        self
    }
}

/// Bulkhead, circuit breaker, retry and timeout around one dependency.
///
/// Owns its breaker state; construct one per client instance.
pub struct ResiliencePipeline {
    name: String,
    bulkhead: Bulkhead,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ResiliencePipeline {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            bulkhead: Bulkhead::new(config.name.clone(), config.bulkhead),
            breaker: CircuitBreaker::new(config.name.clone(), config.breaker),
            retry: config.retry,
            timeout: config.timeout,
            name: config.name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    /// Subscribe to circuit state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.breaker.subscribe()
    }

    /// Run `operation` under all four policies.
    ///
    /// `operation` is called once per attempt, so it must build a fresh future each time.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: Classify + From<ResilienceError> + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = match self.bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(
                    policy = %self.name,
                    error_category = %ErrorCategory::ResourceExhausted,
                    "Bulkhead rejected call, dependency is saturated"
                );
                return Err(E::from(e));
            }
        };

        // Held across the await so a cancelled call still releases a half-open trial
        let admission = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                warn!(
                    policy = %self.name,
                    error_category = %ErrorCategory::ResourceExhausted,
                    "Circuit open, failing fast"
                );
                return Err(E::from(e));
            }
        };

        let timeout = self.timeout;
        let result = self
            .retry
            .execute(&self.name, || with_timeout(timeout, operation()))
            .await;

        match &result {
            Ok(_) => admission.record_success(),
            Err(e) if e.category() == ErrorCategory::Transient => admission.record_failure(),
            Err(_) => drop(admission),
        }

        result
    }
}
