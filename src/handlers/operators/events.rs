use axum::extract::{Extension, State};
use serde::Deserialize;

use crate::commerce::{ProcessOutcome, SweepReport};
use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::extractors::{Json, Path, Query};
use crate::id::is_valid_prefixed_id;
use crate::middleware::OperatorContext;
use crate::models::PaymentEvent;
use crate::pagination::{PageWindow, Paginated};

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    pub org_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EventListQuery {
    fn window(&self) -> PageWindow {
        PageWindow::new(self.limit, self.offset)
    }
}

/// Events that need a human: permanent failures and exhausted retries.
pub async fn list_escalated_events(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> Result<Json<Paginated<PaymentEvent>>> {
    let conn = state.db.get()?;
    let window = query.window();
    let (events, total) =
        queries::list_escalated_events_paginated(&conn, query.org_id, window.limit, window.offset)?;
    Ok(Json(Paginated::new(events, total, window)))
}

/// Events still waiting for an automatic retry.
pub async fn list_failed_events(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> Result<Json<Paginated<PaymentEvent>>> {
    let conn = state.db.get()?;
    let window = query.window();
    let (events, total) =
        queries::list_failed_events_paginated(&conn, query.org_id, window.limit, window.offset)?;
    Ok(Json(Paginated::new(events, total, window)))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<PaymentEvent>> {
    if !is_valid_prefixed_id(&event_id) {
        return Err(AppError::NotFound(msg::EVENT_NOT_FOUND.into()));
    }
    let conn = state.db.get()?;
    let event = queries::get_payment_event(&conn, &event_id)?.or_not_found(msg::EVENT_NOT_FOUND)?;
    Ok(Json(event))
}

pub async fn reprocess_event(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperatorContext>,
    Path(event_id): Path<String>,
) -> Result<Json<ProcessOutcome>> {
    if !is_valid_prefixed_id(&event_id) {
        return Err(AppError::NotFound(msg::EVENT_NOT_FOUND.into()));
    }
    let mut conn = state.db.get()?;
    let outcome = state.processor().reprocess(&mut conn, &ctx.actor(), &event_id)?;
    tracing::info!(
        event_id = %event_id,
        operator = ?ctx.operator_id,
        outcome = ?outcome,
        "Operator reprocessed payment event"
    );
    Ok(Json(outcome))
}

/// Run one retry sweep now instead of waiting for the background task.
pub async fn run_sweep(State(state): State<AppState>) -> Result<Json<SweepReport>> {
    let mut conn = state.db.get()?;
    Ok(Json(state.processor().sweep(&mut conn)?))
}
