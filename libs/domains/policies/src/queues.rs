//! Queue definitions for the policies domain.

use queue_worker::QueueDef;

/// Policy processing queue definition.
///
/// Fed by the policy API with `ProcessPolicyCommand` messages; consumed by the
/// policy-worker.
pub struct PolicyProcessingQueue;

impl QueueDef for PolicyProcessingQueue {
    const QUEUE_NAME: &'static str = "policy-processing-queue";
}
