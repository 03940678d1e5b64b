use axum::http::HeaderMap;
use serde_json::Value;

use crate::error::Result;
use crate::models::NormalizedEvent;

use super::{PaymentProvider, normalize_flat};

/// Development provider. Every delivery counts as verified; only registered
/// when `STUB_PROVIDER_ENABLED` is set (defaults on in dev mode).
#[derive(Debug, Clone, Copy)]
pub struct StubProvider;

impl PaymentProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn extract_signature(&self, _headers: &HeaderMap) -> Option<String> {
        Some(String::new())
    }

    fn verify_signature(&self, _body: &[u8], _signature: &str) -> Result<bool> {
        Ok(true)
    }

    fn normalize(&self, payload: &Value) -> NormalizedEvent {
        normalize_flat(payload)
    }

    fn success_event_types(&self) -> &'static [&'static str] {
        &["payment_succeeded", "paid"]
    }
}
