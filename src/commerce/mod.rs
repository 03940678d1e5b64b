//! The payment-to-entitlement pipeline.
//!
//! Single statements live in `db::queries`; the functions here own the
//! transaction boundaries and decide what a replay or a conflict means.

pub mod consumption;
pub mod grants;
pub mod idempotency;
pub mod intake;
pub mod orders;
pub mod processor;
pub mod reconcile;
pub mod refunds;
pub mod wallet;

pub use consumption::ConsumeOutcome;
pub use grants::{GrantOutcome, ManualGrant, RevokeOutcome};
pub use idempotency::RecordOutcome;
pub use intake::{IntakeOutcome, WebhookDelivery};
pub use orders::OrderOutcome;
pub use processor::{Effect, ProcessOutcome, Processor, SweepReport};
pub use refunds::{OpsRefund, RefundOutcome};
pub use wallet::{LedgerApply, ManualAdjustment};

/// Bounded exponential backoff for failed payment events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a retryable failure is escalated
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt: `min(base * 2^(attempts-1), max)`.
    pub fn backoff_secs(&self, attempts: i64) -> i64 {
        let exponent = (attempts - 1).clamp(0, 32) as u32;
        let delay = self
            .base_delay_secs
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_secs);
        i64::try_from(delay).unwrap_or(i64::MAX)
    }

    pub fn next_attempt_at(&self, now: i64, attempts: i64) -> i64 {
        now.saturating_add(self.backoff_secs(attempts))
    }

    pub fn is_exhausted(&self, attempts: i64) -> bool {
        attempts >= i64::from(self.max_attempts)
    }
}

/// Benefit codes are stored upper-case.
pub fn normalize_benefit_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Ledger key of the credit top-up produced by a paid credit-pack order.
pub fn topup_key(provider: &str, order_no: &str) -> String {
    format!("TOPUP:{}:{}", provider, order_no)
}

/// Ledger key of the reversal of an earlier ledger row.
pub fn reversal_key(original_key: &str) -> String {
    format!("{}:reversal", original_key)
}

/// Ledger key of a debit made when a benefit is consumed for an attempt.
pub fn consume_key(org_id: i64, attempt_id: &str, benefit_code: &str) -> String {
    format!("CONSUME:{}:{}:{}", org_id, attempt_id, benefit_code)
}

/// Ledger key of an operator adjustment.
pub fn manual_ledger_key(org_id: i64, idempotency_key: &str) -> String {
    format!("MANUAL:{}:{}", org_id, idempotency_key)
}

/// `source_order_id` of an operator-issued grant.
pub fn manual_grant_source(org_id: i64, idempotency_key: &str) -> String {
    format!("manual:{}:{}", org_id, idempotency_key)
}
