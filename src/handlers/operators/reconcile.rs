use axum::extract::{Extension, State};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::commerce::reconcile;
use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::extractors::{Json, Query};
use crate::middleware::OperatorContext;
use crate::models::ReconcileSnapshot;

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    #[serde(default)]
    pub org_id: i64,
    /// `YYYY-MM-DD`, UTC
    pub day: String,
}

pub async fn run_reconcile(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperatorContext>,
    Json(input): Json<ReconcileRequest>,
) -> Result<Json<ReconcileSnapshot>> {
    let day = NaiveDate::parse_from_str(&input.day, "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest("day must be YYYY-MM-DD".into()))?;
    let conn = state.db.get()?;
    let snapshot = reconcile::reconcile(&conn, &state.audit_trail(), &ctx.actor(), input.org_id, day)?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    pub org_id: i64,
    pub limit: Option<i64>,
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<Vec<ReconcileSnapshot>>> {
    let conn = state.db.get()?;
    let limit = query.limit.unwrap_or(30).clamp(1, 366);
    Ok(Json(queries::list_snapshots(&conn, query.org_id, limit)?))
}
