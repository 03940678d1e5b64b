use axum::extract::{Extension, State};

use crate::commerce::{LedgerApply, ManualAdjustment, wallet};
use crate::db::AppState;
use crate::error::Result;
use crate::extractors::Json;
use crate::middleware::OperatorContext;

/// Append a manual ledger row. Replays of the same key report `applied=false`.
pub async fn adjust_wallet(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperatorContext>,
    Json(input): Json<ManualAdjustment>,
) -> Result<Json<LedgerApply>> {
    let mut conn = state.db.get()?;
    let applied = wallet::manual_adjustment(&mut conn, &state.audit_trail(), &ctx.actor(), &input)?;
    Ok(Json(applied))
}
