mod payment;

pub use payment::handle_payment_webhook;

use axum::{Router, routing::post};

use crate::db::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/payments/webhook/{provider}", post(handle_payment_webhook))
}
