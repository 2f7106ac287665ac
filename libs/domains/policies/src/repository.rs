use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PolicyError, PolicyResult};
use crate::models::{Policy, ProcessingOutcome};

/// Repository trait for Policy persistence
///
/// Outcome writes are keyed by policy id and overwrite the previous outcome, so
/// a redelivered message can apply the same outcome twice without harm.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Get a policy by ID
    async fn find_by_id(&self, id: Uuid) -> PolicyResult<Option<Policy>>;

    /// Set status and booking fields from `outcome`; `NotFound` if the policy is missing
    async fn apply_outcome(&self, id: Uuid, outcome: &ProcessingOutcome) -> PolicyResult<Policy>;
}

/// In-memory repository for tests and local runs
#[derive(Default)]
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<Uuid, Policy>>,
}

impl InMemoryPolicyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, policy: Policy) {
        self.policies.write().await.insert(policy.id, policy);
    }
}

#[async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn find_by_id(&self, id: Uuid) -> PolicyResult<Option<Policy>> {
        Ok(self.policies.read().await.get(&id).cloned())
    }

    async fn apply_outcome(&self, id: Uuid, outcome: &ProcessingOutcome) -> PolicyResult<Policy> {
        let mut policies = self.policies.write().await;
        let policy = policies.get_mut(&id).ok_or(PolicyError::NotFound(id))?;
        policy.apply_outcome(outcome);
        Ok(policy.clone())
    }
}
