//! Dead-letter queue tooling.
//!
//! - [`DlqMonitor`] reports dead-letter depth against an alert threshold
//! - [`DlqReprocessor`] drains dead-lettered messages back onto the live queue

mod monitor;
mod reprocessor;

pub use monitor::{DlqAlert, DlqMonitor};
pub use reprocessor::{DlqReprocessor, ReprocessBatchResult, ReprocessFilter, SkipReason};
