use serde::{Deserialize, Serialize};

/// Daily drift counts for one org. Written by the reconciler only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSnapshot {
    pub id: String,
    pub org_id: i64,
    /// `YYYY-MM-DD` (UTC)
    pub snapshot_date: String,
    pub paid_orders_count: i64,
    pub paid_without_benefit_count: i64,
    pub benefit_without_report_count: i64,
    pub webhook_replay_count: i64,
    pub ledger_drift_count: i64,
    pub meta: Option<serde_json::Value>,
    pub created_at: i64,
}
