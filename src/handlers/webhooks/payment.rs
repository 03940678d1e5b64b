//! Inbound payment webhooks.
//!
//! The provider always gets a 200 once the delivery is durably recorded.
//! Processing runs inline right after, and its failures stay on the event
//! row for the retry sweep; they never change the response.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
};

use crate::commerce::{IntakeOutcome, ProcessOutcome, WebhookDelivery, intake};
use crate::db::AppState;
use crate::error::Result;
use crate::extractors::{Json, Path};
use crate::util::request_meta;

pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IntakeOutcome>> {
    let meta = request_meta(&headers);
    let signature = state
        .providers
        .get(&provider)
        .and_then(|p| p.extract_signature(&headers));

    let mut conn = state.db.get()?;
    let outcome = intake::ingest(
        &conn,
        &state.providers,
        state.webhook_max_bytes,
        &WebhookDelivery {
            provider: &provider,
            body: &body,
            signature: signature.as_deref(),
            meta: &meta,
        },
    )?;

    if outcome.process {
        match state.processor().process(&mut conn, &outcome.event_id) {
            Ok(ProcessOutcome::Failed { code, .. }) => {
                tracing::debug!(event_id = %outcome.event_id, error_code = %code, "Inline processing failed");
            }
            Ok(_) => {}
            Err(e) => {
                // Left in processing; the sweep recovers it.
                tracing::error!(event_id = %outcome.event_id, "Inline processing error: {}", e);
            }
        }
    }

    Ok(Json(outcome))
}
