pub mod operators;
pub mod public;
pub mod webhooks;

use axum::Router;

use crate::db::AppState;

/// Every route the service exposes, without state or outer layers.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .merge(public::router())
        .merge(webhooks::router())
        .merge(operators::router(state))
}
