use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::json;

use crate::db::queries;
use crate::error::{AppError, Result, msg};
use crate::models::{AuditAction, BenefitConsumption, NewLedgerEntry};
use crate::util::{Actor, AuditTrail};

use super::{consume_key, normalize_benefit_code, wallet};

#[derive(Debug, Clone, Serialize)]
pub struct ConsumeOutcome {
    /// False when this attempt already spent the benefit; the caller should
    /// reuse the earlier result instead of spending again.
    pub consumed: bool,
    pub consumption: BenefitConsumption,
    /// Wallet balance after the debit (debiting consumption only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
}

fn validate(benefit_code: &str, attempt_id: &str) -> Result<String> {
    let code = normalize_benefit_code(benefit_code);
    if code.is_empty() {
        return Err(AppError::BadRequest(msg::BENEFIT_CODE_REQUIRED.into()));
    }
    if attempt_id.trim().is_empty() {
        return Err(AppError::BadRequest("attempt_id is required".into()));
    }
    Ok(code)
}

/// Record that a benefit was spent on an attempt. Does not touch the wallet.
pub fn consume(
    conn: &Connection,
    audit: &AuditTrail,
    actor: &Actor,
    org_id: i64,
    benefit_code: &str,
    attempt_id: &str,
) -> Result<ConsumeOutcome> {
    let code = validate(benefit_code, attempt_id)?;
    let attempt_id = attempt_id.trim();

    let (grant_id, order_no) = grant_link(conn, org_id, &code, attempt_id)?;

    match queries::insert_consumption(
        conn,
        org_id,
        &code,
        attempt_id,
        grant_id.as_deref(),
        order_no.as_deref(),
    )? {
        Some(consumption) => {
            record_audit(audit, actor, &consumption, None);
            Ok(ConsumeOutcome {
                consumed: true,
                consumption,
                balance: None,
            })
        }
        None => already_consumed(conn, org_id, &code, attempt_id, None),
    }
}

/// Record the spend and debit one unit from the wallet in one transaction.
///
/// Fails with `PaymentRequired` when the balance is not positive; nothing is
/// written in that case.
pub fn consume_and_debit(
    conn: &mut Connection,
    audit: &AuditTrail,
    actor: &Actor,
    org_id: i64,
    benefit_code: &str,
    attempt_id: &str,
) -> Result<ConsumeOutcome> {
    let code = validate(benefit_code, attempt_id)?;
    let attempt_id = attempt_id.trim();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (grant_id, order_no) = grant_link(&tx, org_id, &code, attempt_id)?;
    let Some(consumption) = queries::insert_consumption(
        &tx,
        org_id,
        &code,
        attempt_id,
        grant_id.as_deref(),
        order_no.as_deref(),
    )?
    else {
        let balance = queries::wallet_balance(&tx, org_id, &code)?;
        drop(tx);
        return already_consumed(conn, org_id, &code, attempt_id, Some(balance));
    };

    if queries::wallet_balance(&tx, org_id, &code)? <= 0 {
        tracing::info!(org_id, benefit_code = %code, attempt_id, "Consumption refused: empty wallet");
        return Err(AppError::PaymentRequired(msg::INSUFFICIENT_CREDITS.into()));
    }

    let key = consume_key(org_id, attempt_id, &code);
    let applied = wallet::apply_delta_in(
        &tx,
        &NewLedgerEntry {
            org_id,
            benefit_code: &code,
            delta: -1,
            reason: "consume",
            order_no: order_no.as_deref(),
            attempt_id: Some(attempt_id),
            idempotency_key: &key,
            meta: None,
        },
    )?;
    tx.commit()?;

    record_audit(audit, actor, &consumption, Some(applied.balance));
    Ok(ConsumeOutcome {
        consumed: true,
        consumption,
        balance: Some(applied.balance),
    })
}

fn already_consumed(
    conn: &Connection,
    org_id: i64,
    code: &str,
    attempt_id: &str,
    balance: Option<i64>,
) -> Result<ConsumeOutcome> {
    let consumption = queries::get_consumption(conn, org_id, code, attempt_id)?
        .ok_or_else(|| AppError::Internal("consumption vanished after conflict".into()))?;
    tracing::debug!(org_id, benefit_code = %code, attempt_id, "Benefit already consumed for attempt");
    Ok(ConsumeOutcome {
        consumed: false,
        consumption,
        balance,
    })
}

/// Active attempt grant backing a consumption, with the order it came from.
fn grant_link(
    conn: &Connection,
    org_id: i64,
    code: &str,
    attempt_id: &str,
) -> Result<(Option<String>, Option<String>)> {
    let Some(grant) = queries::find_active_grant(conn, org_id, code, Some(attempt_id), None)? else {
        return Ok((None, None));
    };
    let order_no = queries::get_order_by_id(conn, &grant.source_order_id)?.map(|o| o.order_no);
    Ok((Some(grant.id), order_no))
}

fn record_audit(audit: &AuditTrail, actor: &Actor, consumption: &BenefitConsumption, balance: Option<i64>) {
    tracing::info!(
        org_id = consumption.org_id,
        benefit_code = %consumption.benefit_code,
        attempt_id = %consumption.attempt_id,
        "Benefit consumed"
    );
    audit
        .entry(actor)
        .action(AuditAction::RecordConsumption)
        .resource("benefit_consumption", &consumption.id)
        .details(json!({
            "benefit_code": consumption.benefit_code,
            "attempt_id": consumption.attempt_id,
            "grant_id": consumption.grant_id,
            "balance": balance,
        }))
        .org(consumption.org_id)
        .record();
}
