use axum::http::HeaderMap;
use serde_json::Value;

use crate::error::Result;
use crate::models::NormalizedEvent;

use super::{PaymentProvider, normalize_flat, verify_timestamped_hmac};

const SUCCESS_EVENT_TYPES: &[&str] = &["payment_succeeded", "payment.success", "payment_completed", "paid"];

const SIGNATURE_HEADER: &str = "x-billing-signature";
const TIMESTAMP_HEADER: &str = "x-billing-timestamp";

/// Generic billing gateway: flat JSON body, hex HMAC-SHA256 of
/// `"{timestamp}.{body}"` in `X-Billing-Signature`, the unix timestamp in
/// `X-Billing-Timestamp`.
#[derive(Debug, Clone)]
pub struct BillingProvider {
    webhook_secret: String,
}

impl BillingProvider {
    pub fn new(webhook_secret: &str) -> Self {
        Self {
            webhook_secret: webhook_secret.to_string(),
        }
    }

    fn verify_at(&self, body: &[u8], signature: &str, now: i64) -> Result<bool> {
        verify_timestamped_hmac(self.name(), &self.webhook_secret, body, signature, now)
    }
}

impl PaymentProvider for BillingProvider {
    fn name(&self) -> &'static str {
        "billing"
    }

    /// Both headers folded into one `t=..,v1=..` value. A missing timestamp
    /// leaves a value that never verifies.
    fn extract_signature(&self, headers: &HeaderMap) -> Option<String> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
        };
        let signature = header(SIGNATURE_HEADER)?;
        Some(match header(TIMESTAMP_HEADER) {
            Some(timestamp) => format!("t={},v1={}", timestamp, signature),
            None => format!("v1={}", signature),
        })
    }

    fn verify_signature(&self, body: &[u8], signature: &str) -> Result<bool> {
        self.verify_at(body, signature, chrono::Utc::now().timestamp())
    }

    fn normalize(&self, payload: &Value) -> NormalizedEvent {
        normalize_flat(payload)
    }

    fn success_event_types(&self) -> &'static [&'static str] {
        SUCCESS_EVENT_TYPES
    }
}
