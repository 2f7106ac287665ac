use async_trait::async_trait;
use queue_worker::ReadinessCheck;
use sea_orm::ActiveValue::Set;
use sea_orm::{DatabaseConnection, DbErr, EntityTrait};
use uuid::Uuid;

use crate::{
    entity,
    error::{PolicyError, PolicyResult},
    models::{Policy, ProcessingOutcome},
    repository::PolicyRepository,
};

pub struct PgPolicyRepository {
    db: DatabaseConnection,
}

impl PgPolicyRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PolicyRepository for PgPolicyRepository {
    async fn find_by_id(&self, id: Uuid) -> PolicyResult<Option<Policy>> {
        let model = entity::Entity::find_by_id(id).one(&self.db).await?;
        Ok(model.map(Into::into))
    }

    async fn apply_outcome(&self, id: Uuid, outcome: &ProcessingOutcome) -> PolicyResult<Policy> {
        // Only the outcome columns are set; the update is a single keyed statement
        let active_model = entity::ActiveModel {
            id: Set(id),
            status: Set(outcome.status()),
            external_reference_id: Set(outcome.external_reference_id.clone()),
            rejection_reason: Set(outcome.rejection_reason.clone()),
            updated_at: Set(chrono::Utc::now().into()),
            ..Default::default()
        };

        let model = entity::Entity::update(active_model)
            .exec(&self.db)
            .await
            .map_err(|e| match e {
                DbErr::RecordNotUpdated => PolicyError::NotFound(id),
                other => PolicyError::from(other),
            })?;

        tracing::info!(policy_id = %id, status = %model.status, "Applied processing outcome");
        Ok(model.into())
    }
}

/// Database reachability for the readiness probe
#[async_trait]
impl ReadinessCheck for PgPolicyRepository {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        self.db.ping().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PolicyStatus;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    fn model(id: Uuid, status: PolicyStatus) -> entity::Model {
        entity::Model {
            id,
            policy_number: "POL-2024-0001".into(),
            customer_name: "Jane Doe".into(),
            customer_email: "jane@example.com".into(),
            status,
            external_reference_id: None,
            rejection_reason: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn test_find_by_id() {
        let id = Uuid::now_v7();
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![model(id, PolicyStatus::Pending)]])
            .into_connection();
        let repo = PgPolicyRepository::new(db);

        let policy = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(policy.id, id);
        assert_eq!(policy.status, PolicyStatus::Pending);
    }

    #[tokio::test]
    async fn test_apply_outcome_returns_updated_policy() {
        let id = Uuid::now_v7();
        let mut updated = model(id, PolicyStatus::Approved);
        updated.external_reference_id = Some("EXT-1".into());
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![updated]])
            .into_connection();
        let repo = PgPolicyRepository::new(db);

        let policy = repo
            .apply_outcome(id, &ProcessingOutcome::approved("EXT-1"))
            .await
            .unwrap();
        assert_eq!(policy.status, PolicyStatus::Approved);
        assert_eq!(policy.external_reference_id.as_deref(), Some("EXT-1"));
    }

    #[tokio::test]
    async fn test_apply_outcome_to_missing_row() {
        let id = Uuid::now_v7();
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<entity::Model>::new()])
            .into_connection();
        let repo = PgPolicyRepository::new(db);

        let result = repo
            .apply_outcome(id, &ProcessingOutcome::rejected("declined"))
            .await;
        assert!(matches!(result, Err(PolicyError::NotFound(missing)) if missing == id));
    }
}
