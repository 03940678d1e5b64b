use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GrantScope {
    /// Unlocks a single assessment attempt
    Attempt,
    /// Applies to the holder's whole account
    Account,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Revoked,
}

/// Durable entitlement produced by an order. Revoked grants stay queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenefitGrant {
    pub id: String,
    pub org_id: i64,
    pub user_id: Option<String>,
    /// Holder key: anonymous id, user id, or `attempt:{id}`
    pub benefit_ref: String,
    pub benefit_code: String,
    pub benefit_type: String,
    pub scope: GrantScope,
    pub attempt_id: Option<String>,
    pub status: GrantStatus,
    pub source_order_id: String,
    pub source_event_id: Option<String>,
    pub expires_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub revoke_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGrant {
    #[serde(default)]
    pub org_id: i64,
    pub source_order_id: String,
    pub source_event_id: Option<String>,
    pub benefit_type: String,
    pub benefit_code: String,
    pub benefit_ref: String,
    pub user_id: Option<String>,
    pub scope: GrantScope,
    pub attempt_id: Option<String>,
    pub expires_at: Option<i64>,
}
