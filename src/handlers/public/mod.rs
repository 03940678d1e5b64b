//! Collaborator-facing API: purchase intents, wallets and benefit checks.
//!
//! Callers are authenticated upstream; `x-caller-id` names them in audit rows
//! (see [`crate::extractors::Caller`]).

mod benefits;
mod orders;
mod wallets;

pub use benefits::*;
pub use orders::*;
pub use wallets::*;

use axum::{
    Router,
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::db::AppState;
use crate::extractors::Json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/orders", post(create_order))
        .route("/orders/{order_no}", get(get_order))
        .route("/wallets/{org_id}/{benefit_code}", get(get_wallet))
        .route("/wallets/{org_id}/{benefit_code}/ledger", get(list_wallet_ledger))
        .route("/benefits/consume", post(consume_benefit))
        .route("/benefits/access", get(check_access))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

