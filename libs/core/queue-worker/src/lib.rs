//! Queue Worker Framework
//!
//! A generic peek-lock queue consumer with a resilience pipeline and DLQ tooling.
//!
//! ## Features
//!
//! - **Generic worker**: `QueueWorker<J, H>` decodes and handles any job type
//! - **Manual settlement**: complete, abandon or dead-letter, never auto-ack
//! - **Lease renewal**: locks are renewed while the handler runs, up to a ceiling
//! - **Resilience pipeline**: bulkhead, circuit breaker, retry and timeout for outbound calls
//! - **DLQ monitor and reprocessor**: threshold alerts and filtered resubmission
//! - **Brokers**: Redis Streams for production, in-memory for tests
//! - **Health endpoints**: liveness, readiness, metrics and DLQ admin
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{QueueDef, QueueJob, MessageHandler, QueueWorker, WorkerConfig};
//!
//! struct PolicyProcessingQueue;
//! impl QueueDef for PolicyProcessingQueue {
//!     const QUEUE_NAME: &'static str = "policy-processing-queue";
//! }
//!
//! let config = WorkerConfig::from_queue_def::<PolicyProcessingQueue>();
//! let worker = QueueWorker::new(broker, processor, config);
//! worker.run(shutdown_rx).await?;
//! ```

mod broker;
mod config;
pub mod dlq;
mod envelope;
mod error;
mod health;
mod lease;
mod memory;
pub mod metrics;
mod redis_broker;
mod registry;
pub mod resilience;
mod senders;
mod worker;

pub use broker::{MessageSender, QueueBroker, QueueRuntimeProperties, SenderFactory};
pub use config::WorkerConfig;
pub use dlq::{DlqAlert, DlqMonitor, DlqReprocessor, ReprocessBatchResult, ReprocessFilter};
pub use envelope::{
    Envelope, OutgoingMessage, ReceivedMessage, SubQueue, PROP_ORIGINAL_MESSAGE_ID,
    PROP_REPROCESSED_AT, PROP_REPROCESSED_FROM_DLQ,
};
pub use error::{Classify, ErrorCategory, WorkerError};
pub use health::{admin_router, HealthResponse, HealthState, ReadinessCheck};
pub use lease::LeaseRenewal;
pub use memory::InMemoryBroker;
pub use metrics::{init_metrics, QueueMetrics};
pub use redis_broker::{RedisBroker, RedisBrokerConfig};
pub use registry::{MessageContext, MessageHandler, QueueDef, QueueJob};
pub use resilience::{ResilienceConfig, ResilienceError, ResiliencePipeline};
pub use senders::SenderCache;
pub use worker::{
    settlement_for, QueueWorker, Settlement, REASON_INVALID_FORMAT, REASON_MAX_DELIVERIES,
    REASON_PERMANENT_FAILURE,
};
