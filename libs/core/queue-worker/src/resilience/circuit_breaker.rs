//! Consecutive-failure circuit breaker.
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ break duration elapsed
//!      │                                   v
//!      │      success            ┌─────────────┐
//!      └──────────────────────── │ HALF-OPEN   │
//!                                └─────────────┘
//!                                      │
//!                       failure        │ (back to OPEN)
//!                       ───────────────┘
//! ```
//!
//! Half-open admits a single trial call; others are rejected until it settles.

use super::ResilienceError;
use crate::metrics;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// One trial call is allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Published on every state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    Opened { name: String, break_duration: Duration },
    HalfOpened { name: String },
    Closed { name: String },
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before opening.
    pub failure_threshold: u32,
    /// How long to stay open before allowing a trial call.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = duration;
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Thread-safe circuit breaker owned by one client.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, without side effects.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Ask permission for one call.
    ///
    /// Moves Open to HalfOpen once the break duration has elapsed. The returned
    /// permit must be settled with the call's outcome; a permit dropped unsettled
    /// (cancelled call, ignored error) frees the half-open trial slot.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, ResilienceError> {
        let mut event = None;
        let result = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|at| at.elapsed() >= self.config.break_duration)
                        .unwrap_or(true);
                    if elapsed {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        event = Some(CircuitEvent::HalfOpened {
                            name: self.name.clone(),
                        });
                        Ok(true)
                    } else {
                        Err(self.open_error())
                    }
                }
                CircuitState::HalfOpen if inner.trial_in_flight => Err(self.open_error()),
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        };

        if let Some(event) = event {
            self.publish(event);
        }
        result.map(|trial| CircuitPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Record a successful call. Closes the circuit if it was half-open.
    fn record_success(&self) {
        let event = {
            let mut inner = self.lock();
            inner.consecutive_failures = 0;
            inner.trial_in_flight = false;
            if inner.state == CircuitState::Closed {
                None
            } else {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                Some(CircuitEvent::Closed {
                    name: self.name.clone(),
                })
            }
        };

        if let Some(event) = event {
            self.publish(event);
        }
    }

    /// Record a transient failure.
    fn record_failure(&self) {
        let event = {
            let mut inner = self.lock();
            inner.trial_in_flight = false;
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        Some(self.trip(&mut inner))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Some(self.trip(&mut inner)),
                CircuitState::Open => None,
            }
        };

        if let Some(event) = event {
            self.publish(event);
        }
    }

    /// Free the half-open trial slot without changing state.
    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn trip(&self, inner: &mut Inner) -> CircuitEvent {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        CircuitEvent::Opened {
            name: self.name.clone(),
            break_duration: self.config.break_duration,
        }
    }

    fn publish(&self, event: CircuitEvent) {
        match &event {
            CircuitEvent::Opened { break_duration, .. } => {
                warn!(
                    breaker = %self.name,
                    break_secs = break_duration.as_secs(),
                    "Circuit breaker OPENED"
                );
                metrics::record_circuit_transition(&self.name, CircuitState::Open);
            }
            CircuitEvent::HalfOpened { .. } => {
                info!(breaker = %self.name, "Circuit breaker HALF-OPEN (testing recovery)");
                metrics::record_circuit_transition(&self.name, CircuitState::HalfOpen);
            }
            CircuitEvent::Closed { .. } => {
                info!(breaker = %self.name, "Circuit breaker CLOSED (recovered)");
                metrics::record_circuit_transition(&self.name, CircuitState::Closed);
            }
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn open_error(&self) -> ResilienceError {
        ResilienceError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission for one call through a [`CircuitBreaker`].
///
/// Dropping the permit without settling it counts as neither success nor failure.
#[must_use = "an unsettled permit records nothing"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Record a transient failure
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl std::fmt::Debug for CircuitPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("breaker", &self.breaker.name)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
