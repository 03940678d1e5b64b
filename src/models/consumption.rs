use serde::{Deserialize, Serialize};

/// A benefit spent against one assessment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenefitConsumption {
    pub id: String,
    pub org_id: i64,
    pub benefit_code: String,
    pub attempt_id: String,
    pub grant_id: Option<String>,
    pub order_no: Option<String>,
    pub created_at: i64,
}
