use axum::extract::{Extension, State};
use serde::Deserialize;
use serde_json::json;

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::extractors::{Json, Query};
use crate::middleware::OperatorContext;
use crate::models::{AuditAction, Sku, UpsertSku};

#[derive(Debug, Deserialize)]
pub struct SkuListQuery {
    #[serde(default)]
    pub org_id: i64,
}

pub async fn list_skus(
    State(state): State<AppState>,
    Query(query): Query<SkuListQuery>,
) -> Result<Json<Vec<Sku>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_skus(&conn, query.org_id)?))
}

pub async fn upsert_sku(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperatorContext>,
    Json(input): Json<UpsertSku>,
) -> Result<Json<Sku>> {
    if input.sku.trim().is_empty() || input.benefit_code.trim().is_empty() {
        return Err(AppError::BadRequest("sku and benefit_code are required".into()));
    }
    if input.unit_qty <= 0 || input.price_cents < 0 {
        return Err(AppError::BadRequest(
            "unit_qty must be positive and price_cents non-negative".into(),
        ));
    }

    let conn = state.db.get()?;
    let sku = queries::upsert_sku(&conn, &input)?;
    tracing::info!(org_id = sku.org_id, sku = %sku.sku, kind = %sku.kind, "SKU upserted");

    state
        .audit_trail()
        .entry(&ctx.actor())
        .action(AuditAction::UpsertSku)
        .resource("sku", &sku.sku)
        .details(json!({
            "kind": sku.kind,
            "unit_qty": sku.unit_qty,
            "benefit_code": sku.benefit_code,
            "price_cents": sku.price_cents,
            "currency": sku.currency,
            "is_active": sku.is_active,
        }))
        .org(sku.org_id)
        .record();

    Ok(Json(sku))
}
