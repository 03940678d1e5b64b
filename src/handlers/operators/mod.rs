//! Operator API under `/ops`, behind the shared ops bearer token.

mod audit_logs;
mod events;
mod grants;
mod orders;
mod reconcile;
mod skus;
mod wallets;

pub use audit_logs::*;
pub use events::*;
pub use grants::*;
pub use orders::*;
pub use reconcile::*;
pub use skus::*;
pub use wallets::*;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};

use crate::db::AppState;
use crate::middleware::operator_auth;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // Operator queue
        .route("/ops/events/escalated", get(list_escalated_events))
        .route("/ops/events/failed", get(list_failed_events))
        .route("/ops/events/{event_id}", get(get_event))
        .route("/ops/events/{event_id}/reprocess", post(reprocess_event))
        .route("/ops/sweep", post(run_sweep))
        // Money-affecting corrections
        .route("/ops/orders/{order_no}/refund", post(refund_order))
        .route("/ops/grants", post(issue_grant))
        .route("/ops/grants/{grant_id}/revoke", post(revoke_grant))
        .route("/ops/wallets/adjust", post(adjust_wallet))
        // Reconciliation
        .route("/ops/reconcile", post(run_reconcile))
        .route("/ops/reconcile/snapshots", get(list_snapshots))
        // Catalog and audit
        .route("/ops/skus", get(list_skus))
        .route("/ops/skus", put(upsert_sku))
        .route("/ops/audit-logs", get(query_audit_logs))
        .layer(middleware::from_fn_with_state(state, operator_auth))
}
