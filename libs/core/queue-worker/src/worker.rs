//! The generic QueueWorker.
//!
//! Per message:
//!
//! ```text
//! Received --decode ok--> handler --Ok--> Completed
//! Received --decode fail--> DeadLettered
//! handler --Err(permanent)--> DeadLettered
//! handler --Err(other), delivery_count >= max--> DeadLettered
//! handler --Err(other), delivery_count < max--> Abandoned (redelivered by the broker)
//! ```
//!
//! Settlement is always the last action, so a crash mid-processing leads to redelivery.

use crate::broker::QueueBroker;
use crate::config::WorkerConfig;
use crate::envelope::{ReceivedMessage, SubQueue};
use crate::error::{ErrorCategory, WorkerError};
use crate::lease::LeaseRenewal;
use crate::metrics::QueueMetrics;
use crate::registry::{MessageContext, MessageHandler, QueueJob};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Dead-letter reason for payloads that cannot be decoded
pub const REASON_INVALID_FORMAT: &str = "Invalid message format";
/// Dead-letter reason once the delivery count ceiling is reached
pub const REASON_MAX_DELIVERIES: &str = "Processing failed after multiple retries";
/// Dead-letter reason for errors that no retry can fix
pub const REASON_PERMANENT_FAILURE: &str = "Permanent processing failure";

/// How a handled message is settled with the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Abandon,
    DeadLetter { reason: String, description: String },
}

/// Decide settlement from the handler result and the broker's delivery count.
pub fn settlement_for(
    result: &Result<(), WorkerError>,
    delivery_count: u32,
    max_delivery_count: u32,
) -> Settlement {
    match result {
        Ok(()) => Settlement::Complete,
        Err(WorkerError::InvalidMessage(details)) => Settlement::DeadLetter {
            reason: REASON_INVALID_FORMAT.to_string(),
            description: details.clone(),
        },
        Err(e) if e.category() == ErrorCategory::Permanent => Settlement::DeadLetter {
            reason: REASON_PERMANENT_FAILURE.to_string(),
            description: e.to_string(),
        },
        Err(e) if delivery_count >= max_delivery_count => Settlement::DeadLetter {
            reason: REASON_MAX_DELIVERIES.to_string(),
            description: e.to_string(),
        },
        Err(_) => Settlement::Abandon,
    }
}

/// Consumes one queue with a bounded pool of concurrent handlers.
pub struct QueueWorker<J: QueueJob, H: MessageHandler<J>> {
    broker: Arc<dyn QueueBroker>,
    handler: Arc<H>,
    config: WorkerConfig,
    metrics: QueueMetrics,
    _job: PhantomData<fn() -> J>,
}

impl<J: QueueJob, H: MessageHandler<J>> QueueWorker<J, H> {
    pub fn new(broker: Arc<dyn QueueBroker>, handler: H, config: WorkerConfig) -> Self {
        Self::with_arc_handler(broker, Arc::new(handler), config)
    }

    pub fn with_arc_handler(
        broker: Arc<dyn QueueBroker>,
        handler: Arc<H>,
        config: WorkerConfig,
    ) -> Self {
        let metrics = QueueMetrics::new(&config.queue_name, handler.name());
        Self {
            broker,
            handler,
            config,
            metrics,
            _job: PhantomData,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Messages still in flight at shutdown are dropped unsettled; their leases
    /// lapse and the broker redelivers them.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(
            queue = %self.config.queue_name,
            handler = %self.handler.name(),
            max_concurrent_calls = self.config.max_concurrent_calls,
            max_delivery_count = self.config.max_delivery_count,
            max_lock_renewal_secs = self.config.max_lock_renewal.as_secs(),
            "Starting queue worker"
        );

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_calls));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            reap(&mut in_flight);

            // Wait for at least one free handler slot
            let first = tokio::select! {
                _ = shutdown_requested(shutdown.clone()) => break,
                permit = slots.clone().acquire_owned() => permit.map_err(|_| WorkerError::Shutdown)?,
            };
            let mut permits = vec![first];
            while permits.len() < self.config.receive_batch_size {
                match slots.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let received = tokio::select! {
                _ = shutdown_requested(shutdown.clone()) => break,
                received = self.broker.receive(
                    &self.config.queue_name,
                    SubQueue::Active,
                    permits.len(),
                    self.config.receive_wait,
                ) => received,
            };

            match received {
                Ok(messages) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Broker connection recovered");
                        consecutive_errors = 0;
                    }

                    for (message, permit) in messages.into_iter().zip(permits.drain(..)) {
                        self.spawn_handler(&mut in_flight, message, permit, shutdown.clone());
                    }
                    self.metrics.in_flight(in_flight.len());
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_secs(2u64.pow(consecutive_errors.min(5)))
                        .min(self.config.max_error_backoff);
                    error!(
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Receive failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_requested(shutdown.clone()) => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Shutdown requested, draining handlers");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!(error = %e, "Message handler panicked");
            }
        }

        info!(queue = %self.config.queue_name, "Queue worker stopped");
        Ok(())
    }

    /// Process and settle one message on its own task, holding `permit` until done.
    fn spawn_handler(
        &self,
        in_flight: &mut JoinSet<()>,
        message: ReceivedMessage,
        permit: OwnedSemaphorePermit,
        shutdown: watch::Receiver<bool>,
    ) {
        let broker = self.broker.clone();
        let handler = self.handler.clone();
        let metrics = self.metrics.clone();
        let max_delivery_count = self.config.max_delivery_count;
        let renewal_interval = self
            .config
            .lock_renewal_interval
            .unwrap_or_else(|| broker.lock_duration() / 2);
        let max_lock_renewal = self.config.max_lock_renewal;

        let ctx = MessageContext::from(&message);
        let span = info_span!(
            "message",
            message_id = %ctx.message_id,
            correlation_id = %ctx.correlation_id,
            delivery_count = ctx.delivery_count,
        );

        let task = async move {
            metrics.message_received();
            let started = Instant::now();
            let lease = LeaseRenewal::spawn(
                broker.clone(),
                message.clone(),
                renewal_interval,
                max_lock_renewal,
            );

            let result = handle_message::<J, H>(handler.as_ref(), &message, &ctx).await;
            if let Err(e) = &result {
                log_failure(e);
                metrics.handler_failed(e.category().as_str());
            }

            lease.stop();
            let settlement = settlement_for(&result, ctx.delivery_count, max_delivery_count);
            settle(broker.as_ref(), &message, &settlement, &metrics, started.elapsed()).await;
        }
        .instrument(span);

        in_flight.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = shutdown_requested(shutdown) => {
                    debug!("Shutdown during processing, leaving lease to lapse");
                }
                _ = task => {}
            }
        });
    }
}

async fn handle_message<J: QueueJob, H: MessageHandler<J>>(
    handler: &H,
    message: &ReceivedMessage,
    ctx: &MessageContext,
) -> Result<(), WorkerError> {
    let job: J = serde_json::from_str(&message.envelope.body)
        .map_err(|e| WorkerError::InvalidMessage(e.to_string()))?;

    debug!(entity_id = %job.entity_id(), handler = handler.name(), "Processing message");
    handler.handle(&job, ctx).await
}

fn log_failure(e: &WorkerError) {
    match e.category() {
        ErrorCategory::ResourceExhausted => warn!(
            error = %e,
            error_category = %ErrorCategory::ResourceExhausted,
            "Dependency overloaded, message not processed"
        ),
        category => error!(error = %e, error_category = %category, "Message processing failed"),
    }
}

async fn settle(
    broker: &dyn QueueBroker,
    message: &ReceivedMessage,
    settlement: &Settlement,
    metrics: &QueueMetrics,
    elapsed: Duration,
) {
    let outcome = match settlement {
        Settlement::Complete => broker.complete(message).await.map(|_| {
            metrics.message_completed(elapsed);
            info!(elapsed_ms = elapsed.as_millis() as u64, "Message completed");
        }),
        Settlement::Abandon => broker.abandon(message).await.map(|_| {
            metrics.message_abandoned();
            warn!("Message abandoned for redelivery");
        }),
        Settlement::DeadLetter {
            reason,
            description,
        } => broker
            .dead_letter(message, reason, description)
            .await
            .map(|_| {
                metrics.message_dead_lettered();
                error!(reason = %reason, description = %description, "Message dead-lettered");
            }),
    };

    match outcome {
        Ok(()) => {}
        Err(WorkerError::LockLost { .. }) => {
            metrics.lock_lost();
            warn!(settlement = ?settlement, "Lock lost before settlement, broker will redeliver");
        }
        Err(e) => error!(error = %e, settlement = ?settlement, "Failed to settle message"),
    }
}

/// Resolves once shutdown is signalled; never resolves if the sender is gone
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn reap(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.try_join_next() {
        if let Err(e) = joined
            && e.is_panic()
        {
            error!(error = %e, "Message handler panicked");
        }
    }
}
