use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::db::AppState;
use crate::util::{Actor, extract_bearer_token};

/// Header naming the human behind an ops request, recorded in audit rows.
pub const OPERATOR_ID_HEADER: &str = "x-operator-id";

#[derive(Debug, Clone)]
pub struct OperatorContext {
    /// Self-declared operator identity; the token is shared
    pub operator_id: Option<String>,
}

impl OperatorContext {
    pub fn actor(&self) -> Actor {
        Actor::operator(self.operator_id.as_deref())
    }
}

/// Constant-time comparison of the presented token against the configured one.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<OperatorContext, StatusCode> {
    let Some(expected) = state.ops_api_token.as_deref() else {
        // Ops API disabled
        return Err(StatusCode::NOT_FOUND);
    };
    let token = extract_bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;
    if !token_matches(token, expected) {
        tracing::warn!("Ops request with invalid bearer token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let operator_id = headers
        .get(OPERATOR_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    Ok(OperatorContext { operator_id })
}

pub async fn operator_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ctx = authenticate(&state, request.headers())?;
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}
