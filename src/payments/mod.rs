//! Payment provider adapters.
//!
//! A provider knows how to authenticate a raw webhook body and how to read
//! its payload into a [`NormalizedEvent`]. Nothing here touches the database.

mod billing;
mod stripe;
mod stub;

pub use billing::BillingProvider;
pub use stripe::StripeProvider;
pub use stub::StubProvider;

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AppError, Result, msg};
use crate::models::NormalizedEvent;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook timestamp before it's rejected (in seconds).
pub const WEBHOOK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Allowed clock skew for timestamps from the future.
pub const WEBHOOK_FUTURE_SKEW_SECS: i64 = 60;

/// Event type assumed when a payload does not carry one.
pub const DEFAULT_EVENT_TYPE: &str = "payment_succeeded";

pub trait PaymentProvider: Send + Sync {
    /// Provider name for routing, logging and storage (e.g. "stripe").
    fn name(&self) -> &'static str;

    /// Signature header value, if the request carries one.
    fn extract_signature(&self, headers: &HeaderMap) -> Option<String>;

    /// Verify the raw body against the signature header.
    ///
    /// `Ok(false)` is a mismatch; `Err` is a malformed header. Callers treat
    /// both as an unverified delivery.
    fn verify_signature(&self, body: &[u8], signature: &str) -> Result<bool>;

    /// Read the provider payload into the common event shape.
    fn normalize(&self, payload: &Value) -> NormalizedEvent;

    /// Event types that mean "the buyer paid".
    fn success_event_types(&self) -> &'static [&'static str];

    fn is_success_event(&self, event_type: &str) -> bool {
        self.success_event_types().contains(&event_type)
    }

    /// Event types that mean "the payment did not go through".
    fn is_failure_event(&self, event_type: &str) -> bool {
        let lower = event_type.to_lowercase();
        lower.contains("payment_failed") || lower.ends_with(".failed") || lower == "failed"
    }
}

/// The set of providers enabled by configuration.
pub struct PaymentProviders {
    providers: Vec<Box<dyn PaymentProvider>>,
}

impl PaymentProviders {
    pub fn new(stripe_secret: Option<&str>, billing_secret: Option<&str>, stub_enabled: bool) -> Self {
        let mut providers: Vec<Box<dyn PaymentProvider>> = Vec::new();
        if let Some(secret) = stripe_secret {
            providers.push(Box::new(StripeProvider::new(secret)));
        }
        if let Some(secret) = billing_secret {
            providers.push(Box::new(BillingProvider::new(secret)));
        }
        if stub_enabled {
            providers.push(Box::new(StubProvider));
        }
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<&dyn PaymentProvider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

// ============ Payload field helpers ============

/// First string found at any of the given paths. Numbers are stringified.
/// Check a `t=<unix>,v1=<hex>[,v1=...]` header: HMAC-SHA256 over
/// `"{t}.{body}"`, with `t` inside the tolerance window.
pub(crate) fn verify_timestamped_hmac(
    provider: &str,
    secret: &str,
    payload: &[u8],
    header: &str,
    now: i64,
) -> Result<bool> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(s) = part.strip_prefix("v1=") {
            candidates.push(s);
        }
    }

    let timestamp_str =
        timestamp.ok_or_else(|| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;
    if candidates.is_empty() {
        return Err(AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()));
    }
    let timestamp: i64 = timestamp_str
        .parse()
        .map_err(|_| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;

    let age = now - timestamp;
    if age > WEBHOOK_TIMESTAMP_TOLERANCE_SECS {
        tracing::warn!(
            provider,
            "Webhook rejected: timestamp too old (age={}s, max={}s)",
            age,
            WEBHOOK_TIMESTAMP_TOLERANCE_SECS
        );
        return Ok(false);
    }
    if age < -WEBHOOK_FUTURE_SKEW_SECS {
        tracing::warn!(provider, "Webhook rejected: timestamp in the future (age={}s)", age);
        return Ok(false);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal(msg::INVALID_WEBHOOK_SECRET.into()))?;
    mac.update(timestamp_str.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    let expected_bytes = expected.as_bytes();

    // Signature length is not secret; only the content comparison must be constant-time.
    Ok(candidates.iter().any(|candidate| {
        let provided = candidate.to_ascii_lowercase();
        let provided = provided.as_bytes();
        provided.len() == expected_bytes.len() && bool::from(expected_bytes.ct_eq(provided))
    }))
}

pub(crate) fn str_at(value: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        let found = path.iter().try_fold(value, |v, key| v.get(*key))?;
        match found {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}

/// First integer found at any of the given paths. Numeric strings are accepted.
pub(crate) fn int_at(value: &Value, paths: &[&[&str]]) -> Option<i64> {
    paths.iter().find_map(|path| {
        let found = path.iter().try_fold(value, |v, key| v.get(*key))?;
        match found {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    })
}

pub(crate) fn upper(currency: Option<String>) -> Option<String> {
    currency.map(|c| c.to_uppercase())
}

/// Flat payload shape shared by the billing gateway and the stub provider.
pub(crate) fn normalize_flat(payload: &Value) -> NormalizedEvent {
    NormalizedEvent {
        provider_event_id: str_at(payload, &[&["event_id"], &["id"]]),
        order_no: str_at(payload, &[&["order_no"], &["metadata", "order_no"]]),
        event_type: str_at(payload, &[&["event_type"], &["type"]])
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
        amount_cents: int_at(payload, &[&["amount_cents"], &["amount"]]),
        currency: upper(str_at(payload, &[&["currency"]])),
        provider_order_id: str_at(
            payload,
            &[&["provider_order_id"], &["trade_no"], &["transaction_id"]],
        ),
        paid_at: int_at(payload, &[&["paid_at"]]),
        refund_amount_cents: int_at(payload, &[&["refund_amount_cents"], &["refund_amount"]]),
        refund_reason: str_at(payload, &[&["refund_reason"], &["reason"]]),
    }
}
