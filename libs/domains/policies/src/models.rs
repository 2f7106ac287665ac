use chrono::{DateTime, Utc};
use queue_worker::QueueJob;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Policy lifecycle status
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    Default,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "policy_status")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PolicyStatus {
    /// Created, not yet booked
    #[default]
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "rejected")]
    Rejected,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// Policy entity as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub policy_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub status: PolicyStatus,
    pub external_reference_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// A pending policy, as created by the policy API
    pub fn pending(
        id: Uuid,
        policy_number: impl Into<String>,
        customer_name: impl Into<String>,
        customer_email: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            policy_number: policy_number.into(),
            customer_name: customer_name.into(),
            customer_email: customer_email.into(),
            status: PolicyStatus::Pending,
            external_reference_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite status and booking fields with `outcome`
    pub fn apply_outcome(&mut self, outcome: &ProcessingOutcome) {
        self.status = outcome.status();
        self.external_reference_id = outcome.external_reference_id.clone();
        self.rejection_reason = outcome.rejection_reason.clone();
        self.updated_at = Utc::now();
    }
}

/// Command consumed from the policy processing queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPolicyCommand {
    pub policy_id: Uuid,
    pub policy_number: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub customer_age: u32,
    #[serde(default)]
    pub policy_type: String,
    pub premium: f64,
    /// Set by the publisher; the envelope's correlation id takes precedence
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueueJob for ProcessPolicyCommand {
    fn entity_id(&self) -> String {
        self.policy_id.to_string()
    }
}

/// Result of one booking-system call. Persisted whole or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOutcome {
    pub success: bool,
    pub external_reference_id: Option<String>,
    pub rejection_reason: Option<String>,
}

impl ProcessingOutcome {
    pub fn approved(external_reference_id: impl Into<String>) -> Self {
        Self {
            success: true,
            external_reference_id: Some(external_reference_id.into()),
            rejection_reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            external_reference_id: None,
            rejection_reason: Some(reason.into()),
        }
    }

    pub fn status(&self) -> PolicyStatus {
        if self.success {
            PolicyStatus::Approved
        } else {
            PolicyStatus::Rejected
        }
    }
}

/// Booking system request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub policy_id: Uuid,
    pub policy_number: String,
    pub customer_name: String,
    pub product_type: String,
    pub premium: f64,
}

impl From<&ProcessPolicyCommand> for BookingRequest {
    fn from(command: &ProcessPolicyCommand) -> Self {
        Self {
            policy_id: command.policy_id,
            policy_number: command.policy_number.clone(),
            customer_name: command.customer_name.clone(),
            product_type: command.policy_type.clone(),
            premium: command.premium,
        }
    }
}

/// Booking system response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResponse {
    pub success: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub external_policy_id: Option<String>,
    #[serde(default)]
    pub external_policy_number: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl From<BookingResponse> for ProcessingOutcome {
    fn from(response: BookingResponse) -> Self {
        Self {
            success: response.success,
            external_reference_id: response
                .external_policy_id
                .or(response.external_policy_number),
            rejection_reason: response.rejection_reason,
        }
    }
}
