use axum::extract::{Extension, State};

use crate::commerce::{OpsRefund, RefundOutcome, refunds};
use crate::db::AppState;
use crate::error::Result;
use crate::extractors::{Json, Path};
use crate::middleware::OperatorContext;

/// Manual refund. Same bound and revocation rules as a provider refund;
/// `idempotency_key` makes the request safe to resend.
pub async fn refund_order(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperatorContext>,
    Path(order_no): Path<String>,
    Json(input): Json<OpsRefund>,
) -> Result<Json<RefundOutcome>> {
    let mut conn = state.db.get()?;
    let outcome = refunds::refund_order(
        &mut conn,
        &state.audit_trail(),
        &ctx.actor(),
        &order_no,
        &input,
    )?;
    Ok(Json(outcome))
}
