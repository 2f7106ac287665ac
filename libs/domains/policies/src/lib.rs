//! Policies Domain
//!
//! Books insurance policies with the external booking system as they arrive on
//! the policy processing queue.
//!
//! # Architecture
//!
//! ```text
//! policy-processing-queue
//!   ↓ QueueWorker<ProcessPolicyCommand, PolicyProcessor>
//! PolicyProcessor
//!   ├─ TransferFileWriter   ← POLICY_<correlation>.txt
//!   ├─ BookingSystemClient  ← POST {base}/posts through the resilience pipeline
//!   └─ PolicyRepository     ← status Approved / Rejected
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use domain_policies::{
//!     BookingClientConfig, HttpBookingSystemClient, PgPolicyRepository, PolicyProcessor,
//!     TransferFileWriter,
//! };
//! use sea_orm::Database;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::connect("postgres://...").await?;
//! let repository = Arc::new(PgPolicyRepository::new(db));
//! let client = Arc::new(HttpBookingSystemClient::new(BookingClientConfig::new("https://booking.example.com"))?);
//! let processor = PolicyProcessor::new(repository, client, TransferFileWriter::new("./outbound"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod entity;
pub mod error;
pub mod files;
pub mod models;
pub mod postgres;
pub mod processor;
pub mod queues;
pub mod repository;

// Re-export commonly used types
pub use client::{BookingClientConfig, BookingSystemClient, HttpBookingSystemClient};
pub use error::{PolicyError, PolicyResult};
pub use files::TransferFileWriter;
pub use models::{
    BookingRequest, BookingResponse, Policy, PolicyStatus, ProcessPolicyCommand,
    ProcessingOutcome,
};
pub use postgres::PgPolicyRepository;
pub use processor::PolicyProcessor;
pub use queues::PolicyProcessingQueue;
pub use repository::{InMemoryPolicyRepository, PolicyRepository};
