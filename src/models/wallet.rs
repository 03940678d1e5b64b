use serde::{Deserialize, Serialize};

/// Materialized balance per `(org_id, benefit_code)`; the ledger is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenefitWallet {
    pub org_id: i64,
    pub benefit_code: String,
    pub balance: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only signed delta. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub org_id: i64,
    pub benefit_code: String,
    pub delta: i64,
    pub reason: String,
    pub order_no: Option<String>,
    pub attempt_id: Option<String>,
    pub idempotency_key: String,
    pub meta: Option<serde_json::Value>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry<'a> {
    pub org_id: i64,
    pub benefit_code: &'a str,
    pub delta: i64,
    pub reason: &'a str,
    pub order_no: Option<&'a str>,
    pub attempt_id: Option<&'a str>,
    pub idempotency_key: &'a str,
    pub meta: Option<&'a serde_json::Value>,
}

/// Projection vs. ledger sum for one wallet.
#[derive(Debug, Clone, Serialize)]
pub struct WalletBalance {
    pub org_id: i64,
    pub benefit_code: String,
    pub balance: i64,
    pub ledger_sum: i64,
}

impl WalletBalance {
    pub fn in_sync(&self) -> bool {
        self.balance == self.ledger_sum
    }
}
