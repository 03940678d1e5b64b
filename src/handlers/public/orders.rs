use axum::{extract::State, http::StatusCode};
use serde::Deserialize;

use crate::commerce::{OrderOutcome, orders};
use crate::db::AppState;
use crate::error::Result;
use crate::extractors::{Caller, Json, Path, Query};
use crate::models::{CreateOrder, Order};

/// 201 for a new order, 200 for a replay of an existing intent.
pub async fn create_order(
    State(state): State<AppState>,
    caller: Caller,
    Json(input): Json<CreateOrder>,
) -> Result<(StatusCode, Json<OrderOutcome>)> {
    let conn = state.db.get()?;
    let buyer = input.user_id.as_deref().or(input.anon_id.as_deref()).unwrap_or("anonymous");
    let outcome = orders::create_order(
        &conn,
        &state.providers,
        &state.audit_trail(),
        &caller.actor(buyer),
        &input,
    )?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct OrgQuery {
    #[serde(default)]
    pub org_id: i64,
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_no): Path<String>,
    Query(query): Query<OrgQuery>,
) -> Result<Json<Order>> {
    let conn = state.db.get()?;
    Ok(Json(orders::get_order(&conn, query.org_id, &order_no)?))
}
