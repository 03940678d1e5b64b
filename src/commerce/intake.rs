//! Webhook intake: verify, capture, dedup. Nothing here changes an order.
//!
//! Digest, size, excerpt and signature check all happen before the single
//! insert that records the delivery, so no transaction is held open while the
//! body is inspected.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use crate::db::queries;
use crate::error::{AppError, ErrorCode, Result, msg};
use crate::models::{NewPaymentEvent, NormalizedEvent, PaymentEventStatus, RequestMeta};
use crate::payments::{PaymentProvider, PaymentProviders};
use crate::util::{payload_excerpt, sha256_hex};

/// One raw webhook delivery.
#[derive(Debug, Clone, Copy)]
pub struct WebhookDelivery<'a> {
    pub provider: &'a str,
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub meta: &'a RequestMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntakeOutcome {
    /// The stored event is verified and will be actioned
    pub accepted: bool,
    pub event_id: String,
    /// `(provider, provider_event_id)` was already recorded
    pub duplicate: bool,
    /// The caller should run the processor now
    #[serde(skip)]
    pub process: bool,
}

/// Record a delivery exactly once per `(provider, provider_event_id)`.
///
/// Errors only for requests that cannot be keyed: unknown provider (404),
/// oversized body (413), unparseable body or missing event id (400). The last
/// two are still recorded as `rejected` under a digest-derived id.
pub fn ingest(
    conn: &Connection,
    providers: &PaymentProviders,
    max_bytes: usize,
    delivery: &WebhookDelivery,
) -> Result<IntakeOutcome> {
    let provider = providers
        .get(delivery.provider)
        .ok_or_else(|| AppError::NotFound(msg::UNKNOWN_PROVIDER.into()))?;

    if delivery.body.len() > max_bytes {
        tracing::warn!(
            provider = delivery.provider,
            size = delivery.body.len(),
            max_bytes,
            "Webhook payload too large"
        );
        return Err(AppError::PayloadTooLarge(msg::PAYLOAD_TOO_LARGE.into()));
    }

    let digest = sha256_hex(delivery.body);
    let excerpt = payload_excerpt(delivery.body);
    let signature_ok = verify(provider, delivery);

    let payload: Value = match serde_json::from_slice(delivery.body) {
        Ok(v) => v,
        Err(e) => {
            record_rejected(conn, delivery, &digest, &excerpt, signature_ok, &e.to_string())?;
            return Err(AppError::BadRequest(msg::INVALID_JSON_PAYLOAD.into()));
        }
    };

    let normalized = provider.normalize(&payload);
    let Some(provider_event_id) = normalized.provider_event_id.clone() else {
        record_rejected(conn, delivery, &digest, &excerpt, signature_ok, msg::MISSING_EVENT_ID)?;
        return Err(AppError::BadRequest(msg::MISSING_EVENT_ID.into()));
    };

    let org_id = resolve_org(conn, provider.name(), &normalized)?;
    let payload_json = String::from_utf8_lossy(delivery.body);
    let normalized_json = serde_json::to_string(&normalized)?;
    let (status, error_code, error_message) = if signature_ok {
        (PaymentEventStatus::Received, None, None)
    } else {
        (
            PaymentEventStatus::Rejected,
            Some(ErrorCode::InvalidSignature.as_ref()),
            Some("signature verification failed"),
        )
    };

    let new_event = NewPaymentEvent {
        org_id,
        provider: provider.name(),
        provider_event_id: &provider_event_id,
        order_no: normalized.order_no.as_deref(),
        event_type: &normalized.event_type,
        payload_json: Some(&payload_json),
        payload_sha256: &digest,
        payload_size_bytes: delivery.body.len() as i64,
        payload_excerpt: Some(&excerpt),
        normalized_json: Some(&normalized_json),
        signature_ok,
        status,
        error_code,
        error_message,
        meta: delivery.meta,
    };

    if let Some(event_id) = queries::insert_payment_event(conn, &new_event)? {
        if signature_ok {
            tracing::info!(
                provider = provider.name(),
                provider_event_id = %provider_event_id,
                order_no = ?normalized.order_no,
                event_type = %normalized.event_type,
                org_id,
                "Payment event recorded"
            );
        } else {
            tracing::warn!(
                provider = provider.name(),
                provider_event_id = %provider_event_id,
                "Payment event recorded with invalid signature"
            );
        }
        return Ok(IntakeOutcome {
            accepted: signature_ok,
            event_id,
            duplicate: false,
            process: signature_ok,
        });
    }

    let existing =
        queries::get_payment_event_by_provider_id(conn, provider.name(), &provider_event_id)?
            .ok_or_else(|| AppError::Internal("payment event vanished after conflict".into()))?;

    // A forged first delivery must not shadow the genuine one.
    if signature_ok
        && !existing.signature_ok
        && queries::upgrade_event_signature(conn, &existing.id, &new_event)?
    {
        tracing::warn!(
            provider = provider.name(),
            provider_event_id = %provider_event_id,
            event_id = %existing.id,
            "Unverified payment event replaced by verified delivery"
        );
        return Ok(IntakeOutcome {
            accepted: true,
            event_id: existing.id,
            duplicate: true,
            process: true,
        });
    }

    queries::record_duplicate_delivery(conn, &existing.id)?;
    tracing::debug!(
        provider = provider.name(),
        provider_event_id = %provider_event_id,
        event_id = %existing.id,
        "Duplicate payment event absorbed"
    );
    Ok(IntakeOutcome {
        accepted: existing.signature_ok,
        event_id: existing.id,
        duplicate: true,
        process: false,
    })
}

fn verify(provider: &dyn PaymentProvider, delivery: &WebhookDelivery) -> bool {
    let Some(signature) = delivery.signature else {
        tracing::warn!(provider = provider.name(), "Webhook without signature header");
        return false;
    };
    match provider.verify_signature(delivery.body, signature) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::warn!(provider = provider.name(), "Webhook signature unusable: {}", e);
            false
        }
    }
}

/// Tenant of the referenced order; org 0 when the order is not known yet.
fn resolve_org(conn: &Connection, provider: &str, normalized: &NormalizedEvent) -> Result<i64> {
    let order = match (&normalized.order_no, &normalized.provider_order_id) {
        (Some(order_no), _) => queries::get_order_by_no(conn, order_no)?,
        (None, Some(provider_order_id)) => {
            queries::get_order_by_provider_order_id(conn, provider, provider_order_id)?
        }
        (None, None) => None,
    };
    Ok(order.map(|o| o.org_id).unwrap_or(0))
}

/// Keep a forensic row for a body that cannot be keyed by the provider.
fn record_rejected(
    conn: &Connection,
    delivery: &WebhookDelivery,
    digest: &str,
    excerpt: &str,
    signature_ok: bool,
    reason: &str,
) -> Result<()> {
    let synthetic_id = format!("sha256:{}", digest);
    let payload_json = String::from_utf8_lossy(delivery.body);
    let event = NewPaymentEvent {
        org_id: 0,
        provider: delivery.provider,
        provider_event_id: &synthetic_id,
        order_no: None,
        event_type: "unknown",
        payload_json: Some(&payload_json),
        payload_sha256: digest,
        payload_size_bytes: delivery.body.len() as i64,
        payload_excerpt: Some(excerpt),
        normalized_json: None,
        signature_ok,
        status: PaymentEventStatus::Rejected,
        error_code: Some(ErrorCode::PayloadInvalid.as_ref()),
        error_message: Some(reason),
        meta: delivery.meta,
    };
    match queries::insert_payment_event(conn, &event)? {
        Some(_) => {}
        None => {
            let existing =
                queries::get_payment_event_by_provider_id(conn, delivery.provider, &synthetic_id)?;
            if let Some(existing) = existing {
                queries::record_duplicate_delivery(conn, &existing.id)?;
            }
        }
    }
    tracing::warn!(provider = delivery.provider, digest, reason, "Unusable webhook payload recorded");
    Ok(())
}
