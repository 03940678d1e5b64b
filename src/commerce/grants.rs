use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::queries;
use crate::error::{AppError, OptionExt, Result, msg};
use crate::models::{AuditAction, BenefitGrant, GrantScope, GrantStatus, NewGrant};
use crate::util::{Actor, AuditTrail};

use super::{manual_grant_source, normalize_benefit_code};

#[derive(Debug, Clone, Serialize)]
pub struct GrantOutcome {
    pub grant: BenefitGrant,
    /// False when the grant identity already existed
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub grant: BenefitGrant,
    /// False when the grant was already revoked
    pub revoked: bool,
}

/// Operator-issued grant outside any payment.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualGrant {
    #[serde(default)]
    pub org_id: i64,
    pub benefit_code: String,
    pub benefit_type: Option<String>,
    pub benefit_ref: Option<String>,
    pub user_id: Option<String>,
    pub scope: GrantScope,
    pub attempt_id: Option<String>,
    pub expires_at: Option<i64>,
    /// Makes the request replay-safe; becomes `source_order_id = "manual:<org>:<key>"`
    pub idempotency_key: String,
    pub reason: Option<String>,
}

/// Insert a grant or return the one that already holds its identity
/// `(source_order_id, benefit_type, benefit_ref)`.
///
/// Runs on whatever connection or transaction the caller holds.
pub fn grant_in(conn: &Connection, new: &NewGrant) -> Result<GrantOutcome> {
    if let Some(grant) = queries::insert_grant(conn, new)? {
        return Ok(GrantOutcome {
            grant,
            created: true,
        });
    }

    let grant = queries::get_grant_by_identity(
        conn,
        &new.source_order_id,
        &new.benefit_type,
        &new.benefit_ref,
    )?
    .ok_or_else(|| AppError::Internal("grant vanished after conflict".into()))?;

    tracing::debug!(
        grant_id = %grant.id,
        source_order_id = %new.source_order_id,
        benefit_type = %new.benefit_type,
        "Grant already issued"
    );
    Ok(GrantOutcome {
        grant,
        created: false,
    })
}

pub fn issue_manual_grant(
    conn: &mut Connection,
    audit: &AuditTrail,
    actor: &Actor,
    input: &ManualGrant,
) -> Result<GrantOutcome> {
    let key = input.idempotency_key.trim();
    if key.is_empty() {
        return Err(AppError::BadRequest(msg::IDEMPOTENCY_KEY_REQUIRED.into()));
    }
    let benefit_code = normalize_benefit_code(&input.benefit_code);
    if benefit_code.is_empty() {
        return Err(AppError::BadRequest(msg::BENEFIT_CODE_REQUIRED.into()));
    }
    if input.scope == GrantScope::Attempt
        && input.attempt_id.as_deref().map_or(true, |a| a.trim().is_empty())
    {
        return Err(AppError::BadRequest(
            "attempt_id is required for attempt-scoped grants".into(),
        ));
    }

    let benefit_ref = input
        .benefit_ref
        .clone()
        .or_else(|| input.user_id.clone())
        .or_else(|| input.attempt_id.as_ref().map(|a| format!("attempt:{}", a)))
        .ok_or_else(|| AppError::BadRequest(msg::BUYER_REQUIRED.into()))?;

    let new = NewGrant {
        org_id: input.org_id,
        source_order_id: manual_grant_source(input.org_id, key),
        source_event_id: None,
        benefit_type: input
            .benefit_type
            .clone()
            .unwrap_or_else(|| "manual".to_string()),
        benefit_code,
        benefit_ref,
        user_id: input.user_id.clone(),
        scope: input.scope,
        attempt_id: input.attempt_id.clone(),
        expires_at: input.expires_at,
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let outcome = grant_in(&tx, &new)?;
    tx.commit()?;

    if outcome.created {
        tracing::info!(
            grant_id = %outcome.grant.id,
            org_id = outcome.grant.org_id,
            benefit_code = %outcome.grant.benefit_code,
            "Manual grant issued"
        );
        audit
            .entry(actor)
            .action(AuditAction::IssueGrant)
            .resource("benefit_grant", &outcome.grant.id)
            .details(json!({
                "source": "manual",
                "benefit_code": outcome.grant.benefit_code,
                "benefit_ref": outcome.grant.benefit_ref,
                "reason": input.reason,
            }))
            .org(outcome.grant.org_id)
            .record();
    }
    Ok(outcome)
}

/// active -> revoked. The row is kept for audit and disputes.
pub fn revoke(
    conn: &Connection,
    audit: &AuditTrail,
    actor: &Actor,
    grant_id: &str,
    reason: &str,
) -> Result<RevokeOutcome> {
    let revoked = queries::revoke_grant(conn, grant_id, reason)?;
    let grant = queries::get_grant(conn, grant_id)?.or_not_found(msg::GRANT_NOT_FOUND)?;

    if revoked {
        tracing::info!(grant_id, org_id = grant.org_id, reason, "Grant revoked");
        audit
            .entry(actor)
            .action(AuditAction::RevokeGrant)
            .resource("benefit_grant", &grant.id)
            .details(json!({ "reason": reason, "source_order_id": grant.source_order_id }))
            .org(grant.org_id)
            .record();
    } else {
        tracing::debug!(grant_id, status = %grant.status, "Grant revoke was a no-op");
    }
    Ok(RevokeOutcome { grant, revoked })
}

/// Revoke every active grant of an order inside the caller's transaction.
/// Returns the grants that changed state.
pub(crate) fn revoke_order_grants_in(
    conn: &Connection,
    source_order_id: &str,
    reason: &str,
) -> Result<Vec<BenefitGrant>> {
    let mut revoked = Vec::new();
    for grant in queries::list_grants_for_order(conn, source_order_id)? {
        if grant.status == GrantStatus::Active && queries::revoke_grant(conn, &grant.id, reason)? {
            revoked.push(grant);
        }
    }
    Ok(revoked)
}

/// Active, unexpired grant giving access to a benefit for an attempt or holder.
pub fn has_access(
    conn: &Connection,
    org_id: i64,
    benefit_code: &str,
    attempt_id: Option<&str>,
    holder: Option<&str>,
) -> Result<Option<BenefitGrant>> {
    let code = normalize_benefit_code(benefit_code);
    queries::find_active_grant(conn, org_id, &code, attempt_id, holder)
}
