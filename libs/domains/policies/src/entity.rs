use crate::models::PolicyStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Sea-ORM Entity for the policies table
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "policies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub policy_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub status: PolicyStatus,
    pub external_reference_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for crate::models::Policy {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            policy_number: model.policy_number,
            customer_name: model.customer_name,
            customer_email: model.customer_email,
            status: model.status,
            external_reference_id: model.external_reference_id,
            rejection_reason: model.rejection_reason,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }
}
