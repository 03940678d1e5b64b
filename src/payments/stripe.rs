use axum::http::HeaderMap;
use serde_json::Value;

use crate::error::Result;
use crate::models::NormalizedEvent;

use super::{DEFAULT_EVENT_TYPE, PaymentProvider, int_at, str_at, upper, verify_timestamped_hmac};

const SUCCESS_EVENT_TYPES: &[&str] = &[
    "payment_succeeded",
    "payment_intent.succeeded",
    "charge.succeeded",
    "checkout.session.completed",
    "invoice.payment_succeeded",
];

#[derive(Debug, Clone)]
pub struct StripeProvider {
    webhook_secret: String,
}

impl StripeProvider {
    pub fn new(webhook_secret: &str) -> Self {
        Self {
            webhook_secret: webhook_secret.to_string(),
        }
    }

    fn verify_at(&self, payload: &[u8], signature: &str, now: i64) -> Result<bool> {
        verify_timestamped_hmac(self.name(), &self.webhook_secret, payload, signature, now)
    }
}

impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn extract_signature(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    fn verify_signature(&self, body: &[u8], signature: &str) -> Result<bool> {
        self.verify_at(body, signature, chrono::Utc::now().timestamp())
    }

    fn normalize(&self, payload: &Value) -> NormalizedEvent {
        let object = payload
            .get("data")
            .and_then(|d| d.get("object"))
            .unwrap_or(payload);

        let event_type = str_at(payload, &[&["type"]]).unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
        let is_refund_type = event_type.contains("refund");

        let amount_refunded = int_at(object, &[&["amount_refunded"]]).or_else(|| {
            object
                .get("refunds")
                .and_then(|r| r.get("data"))
                .and_then(|d| d.as_array())
                .map(|refunds| {
                    refunds
                        .iter()
                        .filter_map(|r| r.get("amount").and_then(|a| a.as_i64()))
                        .sum()
                })
        });
        // A charge object always carries amount_refunded, usually 0.
        let refund_amount_cents = amount_refunded
            .filter(|amount| *amount > 0)
            .or_else(|| is_refund_type.then(|| int_at(object, &[&["amount"]])).flatten());

        let refund_reason = str_at(object, &[&["reason"]]).or_else(|| {
            object
                .get("refunds")
                .and_then(|r| r.get("data"))
                .and_then(|d| d.as_array())
                .and_then(|refunds| refunds.first())
                .and_then(|r| str_at(r, &[&["reason"]]))
        });

        NormalizedEvent {
            provider_event_id: str_at(payload, &[&["id"]]),
            order_no: str_at(
                object,
                &[&["order_no"], &["metadata", "order_no"], &["client_reference_id"]],
            )
            .or_else(|| str_at(payload, &[&["metadata", "order_no"]])),
            event_type,
            amount_cents: int_at(object, &[&["amount_total"], &["amount_received"], &["amount"]]),
            currency: upper(str_at(object, &[&["currency"]])),
            provider_order_id: str_at(object, &[&["payment_intent"], &["id"]]),
            paid_at: int_at(object, &[&["created"]]).or_else(|| int_at(payload, &[&["created"]])),
            refund_amount_cents,
            refund_reason,
        }
    }

    fn success_event_types(&self) -> &'static [&'static str] {
        SUCCESS_EVENT_TYPES
    }
}
