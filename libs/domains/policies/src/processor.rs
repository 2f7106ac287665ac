//! Policy processor for queue workers.
//!
//! This module provides the `PolicyProcessor` that implements
//! `MessageHandler<ProcessPolicyCommand>`: it writes the transfer file, books the
//! policy with the external system and persists the outcome. Settlement is left to
//! the worker, which completes the message only after this returns `Ok`.

use async_trait::async_trait;
use queue_worker::{MessageContext, MessageHandler, WorkerError};
use std::sync::Arc;
use tracing::{error, info};

use crate::client::BookingSystemClient;
use crate::error::PolicyError;
use crate::files::TransferFileWriter;
use crate::models::{BookingRequest, ProcessPolicyCommand};
use crate::repository::PolicyRepository;

pub struct PolicyProcessor<R: PolicyRepository, C: BookingSystemClient> {
    repository: Arc<R>,
    client: Arc<C>,
    files: TransferFileWriter,
}

impl<R: PolicyRepository, C: BookingSystemClient> PolicyProcessor<R, C> {
    pub fn new(repository: Arc<R>, client: Arc<C>, files: TransferFileWriter) -> Self {
        Self {
            repository,
            client,
            files,
        }
    }

    async fn process(
        &self,
        command: &ProcessPolicyCommand,
        ctx: &MessageContext,
    ) -> Result<(), PolicyError> {
        info!(
            policy_id = %command.policy_id,
            policy_number = %command.policy_number,
            "Processing policy"
        );

        // Fail before any side effect when the policy does not exist
        if self.repository.find_by_id(command.policy_id).await?.is_none() {
            error!(policy_id = %command.policy_id, "Policy not found in database");
            return Err(PolicyError::NotFound(command.policy_id));
        }

        let path = self.files.write(command, &ctx.correlation_id).await?;

        let outcome = self.client.submit(&BookingRequest::from(command)).await?;

        let policy = self
            .repository
            .apply_outcome(command.policy_id, &outcome)
            .await?;

        info!(
            policy_id = %policy.id,
            policy_number = %policy.policy_number,
            status = %policy.status,
            transfer_file = %path.display(),
            "Policy processed"
        );
        Ok(())
    }
}

#[async_trait]
impl<R, C> MessageHandler<ProcessPolicyCommand> for PolicyProcessor<R, C>
where
    R: PolicyRepository + 'static,
    C: BookingSystemClient + 'static,
{
    async fn handle(
        &self,
        command: &ProcessPolicyCommand,
        ctx: &MessageContext,
    ) -> Result<(), WorkerError> {
        self.process(command, ctx).await.map_err(WorkerError::from)
    }

    fn name(&self) -> &'static str {
        "policy_processor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBookingSystemClient;
    use crate::models::{Policy, PolicyStatus, ProcessingOutcome};
    use crate::repository::MockPolicyRepository;
    use chrono::Utc;
    use mockall::predicate::eq;
    use queue_worker::{ErrorCategory, ResilienceError};
    use uuid::Uuid;

    fn command(policy_id: Uuid) -> ProcessPolicyCommand {
        ProcessPolicyCommand {
            policy_id,
            policy_number: "POL-2024-0001".into(),
            customer_name: "Jane Doe".into(),
            customer_email: "jane@example.com".into(),
            customer_age: 42,
            policy_type: "Health".into(),
            premium: 1250.5,
            correlation_id: String::new(),
            retry_count: 0,
        }
    }

    fn ctx(delivery_count: u32) -> MessageContext {
        MessageContext {
            message_id: "msg-1".into(),
            correlation_id: "corr-1".into(),
            delivery_count,
            enqueued_time: Utc::now(),
            subject: None,
        }
    }

    fn existing(repo: &mut MockPolicyRepository, id: Uuid) {
        repo.expect_find_by_id()
            .with(eq(id))
            .returning(|id| Ok(Some(Policy::pending(id, "POL-2024-0001", "Jane", "jane@example.com"))));
    }

    fn processor(
        repo: MockPolicyRepository,
        client: MockBookingSystemClient,
        dir: &tempfile::TempDir,
    ) -> PolicyProcessor<MockPolicyRepository, MockBookingSystemClient> {
        PolicyProcessor::new(
            Arc::new(repo),
            Arc::new(client),
            TransferFileWriter::new(dir.path()),
        )
    }

    #[tokio::test]
    async fn test_approved_outcome_is_persisted() {
        let id = Uuid::now_v7();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = MockPolicyRepository::new();
        let mut client = MockBookingSystemClient::new();

        existing(&mut repo, id);
        client
            .expect_submit()
            .withf(move |req| req.policy_id == id && req.product_type == "Health")
            .times(1)
            .returning(|_| Ok(ProcessingOutcome::approved("EXT-1")));
        repo.expect_apply_outcome()
            .withf(move |policy_id, outcome| *policy_id == id && outcome.status() == PolicyStatus::Approved)
            .times(1)
            .returning(|id, outcome| {
                let mut policy = Policy::pending(id, "POL-2024-0001", "Jane", "jane@example.com");
                policy.apply_outcome(outcome);
                Ok(policy)
            });

        let result = processor(repo, client, &dir).handle(&command(id), &ctx(1)).await;

        assert!(result.is_ok());
        assert!(dir.path().join("POLICY_corr-1.txt").exists());
    }

    #[tokio::test]
    async fn test_rejected_outcome_is_persisted() {
        let id = Uuid::now_v7();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = MockPolicyRepository::new();
        let mut client = MockBookingSystemClient::new();

        existing(&mut repo, id);
        client
            .expect_submit()
            .returning(|_| Ok(ProcessingOutcome::rejected("underwriting declined")));
        repo.expect_apply_outcome()
            .withf(|_, outcome| outcome.status() == PolicyStatus::Rejected)
            .times(1)
            .returning(|id, outcome| {
                let mut policy = Policy::pending(id, "POL-2024-0001", "Jane", "jane@example.com");
                policy.apply_outcome(outcome);
                Ok(policy)
            });

        assert!(processor(repo, client, &dir).handle(&command(id), &ctx(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_policy_is_permanent_and_skips_booking() {
        let id = Uuid::now_v7();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = MockPolicyRepository::new();
        let mut client = MockBookingSystemClient::new();

        repo.expect_find_by_id().returning(|_| Ok(None));
        client.expect_submit().never();
        repo.expect_apply_outcome().never();

        let err = processor(repo, client, &dir)
            .handle(&command(id), &ctx(1))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!dir.path().join("POLICY_corr-1.txt").exists());
    }

    #[tokio::test]
    async fn test_booking_failure_is_transient_and_not_persisted() {
        let id = Uuid::now_v7();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = MockPolicyRepository::new();
        let mut client = MockBookingSystemClient::new();

        existing(&mut repo, id);
        client
            .expect_submit()
            .returning(|_| Err(PolicyError::BookingUnavailable("HTTP 503".into())));
        repo.expect_apply_outcome().never();

        let err = processor(repo, client, &dir)
            .handle(&command(id), &ctx(2))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_open_circuit_surfaces_as_resource_exhausted() {
        let id = Uuid::now_v7();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = MockPolicyRepository::new();
        let mut client = MockBookingSystemClient::new();

        existing(&mut repo, id);
        client.expect_submit().returning(|_| {
            Err(PolicyError::Resilience(ResilienceError::CircuitOpen {
                name: "booking-system".into(),
            }))
        });
        repo.expect_apply_outcome().never();

        let err = processor(repo, client, &dir)
            .handle(&command(id), &ctx(1))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_transient() {
        let id = Uuid::now_v7();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = MockPolicyRepository::new();
        let mut client = MockBookingSystemClient::new();

        existing(&mut repo, id);
        client
            .expect_submit()
            .returning(|_| Ok(ProcessingOutcome::approved("EXT-1")));
        repo.expect_apply_outcome()
            .returning(|_, _| Err(PolicyError::Database("connection reset".into())));

        let err = processor(repo, client, &dir)
            .handle(&command(id), &ctx(1))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Transient);
    }
}
