use axum::{
    extract::{Extension, State},
    http::StatusCode,
};
use serde::Deserialize;

use crate::commerce::{GrantOutcome, ManualGrant, RevokeOutcome, grants};
use crate::db::AppState;
use crate::error::{AppError, Result, msg};
use crate::extractors::{Json, Path};
use crate::id::is_valid_prefixed_id;
use crate::middleware::OperatorContext;

pub async fn issue_grant(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperatorContext>,
    Json(input): Json<ManualGrant>,
) -> Result<(StatusCode, Json<GrantOutcome>)> {
    let mut conn = state.db.get()?;
    let outcome = grants::issue_manual_grant(&mut conn, &state.audit_trail(), &ctx.actor(), &input)?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct RevokeGrantRequest {
    pub reason: String,
}

pub async fn revoke_grant(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperatorContext>,
    Path(grant_id): Path<String>,
    Json(input): Json<RevokeGrantRequest>,
) -> Result<Json<RevokeOutcome>> {
    if !is_valid_prefixed_id(&grant_id) {
        return Err(AppError::NotFound(msg::GRANT_NOT_FOUND.into()));
    }
    let conn = state.db.get()?;
    let outcome = grants::revoke(&conn, &state.audit_trail(), &ctx.actor(), &grant_id, &input.reason)?;
    Ok(Json(outcome))
}
