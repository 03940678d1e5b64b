use axum::extract::State;

use crate::commerce::{normalize_benefit_code, wallet};
use crate::db::{AppState, queries};
use crate::error::Result;
use crate::extractors::{Json, Path, Query};
use crate::models::{LedgerEntry, WalletBalance};
use crate::pagination::{Paginated, PaginationQuery};

/// Projection balance next to the ledger sum, so drift is visible.
pub async fn get_wallet(
    State(state): State<AppState>,
    Path((org_id, benefit_code)): Path<(i64, String)>,
) -> Result<Json<WalletBalance>> {
    let conn = state.db.get()?;
    Ok(Json(wallet::balance_with_ledger(&conn, org_id, &benefit_code)?))
}

pub async fn list_wallet_ledger(
    State(state): State<AppState>,
    Path((org_id, benefit_code)): Path<(i64, String)>,
    Query(page): Query<PaginationQuery>,
) -> Result<Json<Paginated<LedgerEntry>>> {
    let conn = state.db.get()?;
    let window = page.window();
    let (entries, total) = queries::list_ledger_entries_paginated(
        &conn,
        org_id,
        &normalize_benefit_code(&benefit_code),
        window.limit,
        window.offset,
    )?;
    Ok(Json(Paginated::new(entries, total, window)))
}
