use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentEventStatus {
    Received,
    Processing,
    Handled,
    Failed,
    /// Recorded for audit but never actioned (bad signature, unparseable body)
    Rejected,
}

/// A provider webhook delivery, one row per `(provider, provider_event_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    pub org_id: i64,
    pub provider: String,
    pub provider_event_id: String,
    pub order_no: Option<String>,
    pub event_type: String,
    #[serde(skip_serializing)]
    pub payload_json: Option<String>,
    pub payload_sha256: String,
    pub payload_size_bytes: i64,
    pub payload_excerpt: Option<String>,
    pub normalized: Option<NormalizedEvent>,
    pub signature_ok: bool,
    pub status: PaymentEventStatus,
    pub attempts: i64,
    pub duplicate_count: i64,
    pub last_duplicate_at: Option<i64>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub request_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub received_at: i64,
    pub processed_at: Option<i64>,
    pub handled_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub escalated_at: Option<i64>,
}

/// Provider-agnostic view of a webhook payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub provider_event_id: Option<String>,
    pub order_no: Option<String>,
    pub event_type: String,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub provider_order_id: Option<String>,
    pub paid_at: Option<i64>,
    pub refund_amount_cents: Option<i64>,
    pub refund_reason: Option<String>,
}

impl NormalizedEvent {
    pub fn is_refund(&self) -> bool {
        self.event_type.to_lowercase().contains("refund")
            || self.refund_amount_cents.is_some_and(|a| a > 0)
    }
}

/// Transport metadata captured at intake for forensics.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub request_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Insert payload for a new payment event row.
#[derive(Debug, Clone)]
pub struct NewPaymentEvent<'a> {
    pub org_id: i64,
    pub provider: &'a str,
    pub provider_event_id: &'a str,
    pub order_no: Option<&'a str>,
    pub event_type: &'a str,
    pub payload_json: Option<&'a str>,
    pub payload_sha256: &'a str,
    pub payload_size_bytes: i64,
    pub payload_excerpt: Option<&'a str>,
    pub normalized_json: Option<&'a str>,
    pub signature_ok: bool,
    pub status: PaymentEventStatus,
    pub error_code: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub meta: &'a RequestMeta,
}
