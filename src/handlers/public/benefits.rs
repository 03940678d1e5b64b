use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::commerce::{ConsumeOutcome, consumption, grants};
use crate::db::AppState;
use crate::error::Result;
use crate::extractors::{Caller, Json, Query};
use crate::models::BenefitGrant;

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    #[serde(default)]
    pub org_id: i64,
    pub benefit_code: String,
    pub attempt_id: String,
    /// Also take one credit from the wallet
    #[serde(default)]
    pub debit: bool,
}

/// 200 with `consumed=false` when the attempt already spent the benefit;
/// 402 when a debiting consume finds an empty wallet.
pub async fn consume_benefit(
    State(state): State<AppState>,
    caller: Caller,
    Json(input): Json<ConsumeRequest>,
) -> Result<Json<ConsumeOutcome>> {
    let mut conn = state.db.get()?;
    let audit = state.audit_trail();
    let actor = caller.actor("consumer");

    let outcome = if input.debit {
        consumption::consume_and_debit(
            &mut conn,
            &audit,
            &actor,
            input.org_id,
            &input.benefit_code,
            &input.attempt_id,
        )?
    } else {
        consumption::consume(
            &conn,
            &audit,
            &actor,
            input.org_id,
            &input.benefit_code,
            &input.attempt_id,
        )?
    };
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    #[serde(default)]
    pub org_id: i64,
    pub benefit_code: String,
    pub attempt_id: Option<String>,
    /// `benefit_ref` of the holder (anon_id or user_id)
    pub holder: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccessResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<BenefitGrant>,
}

pub async fn check_access(
    State(state): State<AppState>,
    Query(query): Query<AccessQuery>,
) -> Result<Json<AccessResponse>> {
    let conn = state.db.get()?;
    let grant = grants::has_access(
        &conn,
        query.org_id,
        &query.benefit_code,
        query.attempt_id.as_deref(),
        query.holder.as_deref(),
    )?;
    Ok(Json(AccessResponse {
        allowed: grant.is_some(),
        grant,
    }))
}
