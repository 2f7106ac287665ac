//! External booking system client.
//!
//! Every call goes through a [`ResiliencePipeline`]. Responses are classified so that
//! only failures a later attempt could fix are retried:
//!
//! | Response | Error | Category |
//! |---|---|---|
//! | transport error, 5xx, 408 | `BookingUnavailable` | transient |
//! | other non-2xx | `BookingRejected` | permanent |
//! | 2xx with undecodable body | `InvalidResponse` | permanent |

use async_trait::async_trait;
use queue_worker::{ResilienceConfig, ResiliencePipeline};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PolicyError, PolicyResult};
use crate::models::{BookingRequest, BookingResponse, ProcessingOutcome};

/// Submits a policy to the external booking system
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookingSystemClient: Send + Sync {
    async fn submit(&self, request: &BookingRequest) -> PolicyResult<ProcessingOutcome>;
}

/// Booking system HTTP configuration
#[derive(Debug, Clone)]
pub struct BookingClientConfig {
    /// Base URL; requests go to `{base_url}/posts`
    pub base_url: String,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl BookingClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// reqwest client for the booking system
pub struct HttpBookingSystemClient {
    client: Client,
    endpoint: String,
    pipeline: ResiliencePipeline,
}

impl HttpBookingSystemClient {
    /// Client with the default pipeline (retry 3, breaker 5/30s, bulkhead 10+20)
    pub fn new(config: BookingClientConfig) -> PolicyResult<Self> {
        let resilience = ResilienceConfig::new("booking-system").with_timeout(config.timeout);
        Self::with_resilience(config, resilience)
    }

    pub fn with_resilience(
        config: BookingClientConfig,
        resilience: ResilienceConfig,
    ) -> PolicyResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| PolicyError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/posts", config.base_url.trim_end_matches('/')),
            pipeline: ResiliencePipeline::new(resilience),
        })
    }

    pub fn pipeline(&self) -> &ResiliencePipeline {
        &self.pipeline
    }

    /// One attempt, classified
    async fn post(&self, request: &BookingRequest) -> PolicyResult<BookingResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| PolicyError::BookingUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(policy_id = %request.policy_id, status = %status, "Booking system returned error status");
            return Err(if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
                PolicyError::BookingUnavailable(format!("HTTP {}", status))
            } else {
                PolicyError::BookingRejected(format!("HTTP {}", status))
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PolicyError::BookingUnavailable(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| PolicyError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl BookingSystemClient for HttpBookingSystemClient {
    async fn submit(&self, request: &BookingRequest) -> PolicyResult<ProcessingOutcome> {
        debug!(policy_id = %request.policy_id, endpoint = %self.endpoint, "Calling booking system");

        let response = self.pipeline.execute(|| self.post(request)).await?;

        info!(
            policy_id = %request.policy_id,
            success = response.success,
            status = %response.status,
            "Booking system responded"
        );
        Ok(response.into())
    }
}
