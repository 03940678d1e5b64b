//! Wallet projection over the append-only ledger.
//!
//! Every balance change is a ledger insert followed by a wallet upsert in the
//! same transaction. The ledger's unique `idempotency_key` is the replay
//! barrier: a second insert with the same key changes nothing.

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::queries;
use crate::error::{AppError, Result, msg};
use crate::models::{AuditAction, NewLedgerEntry, WalletBalance};
use crate::util::{Actor, AuditTrail};

use super::{manual_ledger_key, normalize_benefit_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerApply {
    /// False when the idempotency key was already used
    pub applied: bool,
    pub balance: i64,
}

/// Operator correction of a wallet.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualAdjustment {
    #[serde(default)]
    pub org_id: i64,
    pub benefit_code: String,
    pub delta: i64,
    pub reason: String,
    pub idempotency_key: String,
    pub meta: Option<serde_json::Value>,
}

/// Apply a delta inside the caller's transaction.
///
/// A replayed key returns the current balance. Reusing a key for a different
/// org, benefit or delta is a conflict, never a silent no-op.
pub fn apply_delta_in(conn: &Connection, entry: &NewLedgerEntry) -> Result<LedgerApply> {
    if entry.idempotency_key.trim().is_empty() {
        return Err(AppError::BadRequest(msg::IDEMPOTENCY_KEY_REQUIRED.into()));
    }
    if entry.delta == 0 {
        return Err(AppError::BadRequest("delta must be non-zero".into()));
    }
    let code = normalize_benefit_code(entry.benefit_code);
    if code.is_empty() {
        return Err(AppError::BadRequest(msg::BENEFIT_CODE_REQUIRED.into()));
    }
    let entry = NewLedgerEntry {
        benefit_code: &code,
        ..entry.clone()
    };

    if queries::insert_ledger_entry(conn, &entry)? {
        let balance = queries::add_to_wallet(conn, entry.org_id, &code, entry.delta)?;
        tracing::info!(
            org_id = entry.org_id,
            benefit_code = %code,
            delta = entry.delta,
            balance,
            idempotency_key = entry.idempotency_key,
            "Ledger entry applied"
        );
        return Ok(LedgerApply {
            applied: true,
            balance,
        });
    }

    let existing = queries::get_ledger_entry_by_key(conn, entry.idempotency_key)?
        .ok_or_else(|| AppError::Internal("ledger entry vanished after conflict".into()))?;
    if existing.org_id != entry.org_id
        || existing.benefit_code != code
        || existing.delta != entry.delta
    {
        tracing::warn!(
            idempotency_key = entry.idempotency_key,
            "Ledger idempotency key reused for a different entry"
        );
        return Err(AppError::Conflict(msg::IDEMPOTENCY_KEY_REUSED.into()));
    }

    let balance = queries::wallet_balance(conn, entry.org_id, &code)?;
    tracing::debug!(
        org_id = entry.org_id,
        benefit_code = %code,
        idempotency_key = entry.idempotency_key,
        "Ledger replay absorbed"
    );
    Ok(LedgerApply {
        applied: false,
        balance,
    })
}

/// Apply a delta in its own transaction and audit it once committed.
pub fn apply_delta(
    conn: &mut Connection,
    audit: &AuditTrail,
    actor: &Actor,
    entry: &NewLedgerEntry,
) -> Result<LedgerApply> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let result = apply_delta_in(&tx, entry)?;
    tx.commit()?;

    if result.applied {
        audit
            .entry(actor)
            .action(AuditAction::AppendLedgerEntry)
            .resource("wallet_ledger", entry.idempotency_key)
            .details(json!({
                "benefit_code": normalize_benefit_code(entry.benefit_code),
                "delta": entry.delta,
                "reason": entry.reason,
                "order_no": entry.order_no,
                "attempt_id": entry.attempt_id,
                "balance": result.balance,
            }))
            .org(entry.org_id)
            .record();
    }
    Ok(result)
}

pub fn manual_adjustment(
    conn: &mut Connection,
    audit: &AuditTrail,
    actor: &Actor,
    input: &ManualAdjustment,
) -> Result<LedgerApply> {
    if input.idempotency_key.trim().is_empty() {
        return Err(AppError::BadRequest(msg::IDEMPOTENCY_KEY_REQUIRED.into()));
    }
    if input.reason.trim().is_empty() {
        return Err(AppError::BadRequest("reason is required".into()));
    }
    let key = manual_ledger_key(input.org_id, input.idempotency_key.trim());
    apply_delta(
        conn,
        audit,
        actor,
        &NewLedgerEntry {
            org_id: input.org_id,
            benefit_code: &input.benefit_code,
            delta: input.delta,
            reason: input.reason.trim(),
            order_no: None,
            attempt_id: None,
            idempotency_key: &key,
            meta: input.meta.as_ref(),
        },
    )
}

/// Projection read. Missing wallets have a zero balance.
pub fn balance_of(conn: &Connection, org_id: i64, benefit_code: &str) -> Result<i64> {
    queries::wallet_balance(conn, org_id, &normalize_benefit_code(benefit_code))
}

/// Projection next to the ledger sum, for callers that need to detect drift.
pub fn balance_with_ledger(conn: &Connection, org_id: i64, benefit_code: &str) -> Result<WalletBalance> {
    let code = normalize_benefit_code(benefit_code);
    Ok(WalletBalance {
        org_id,
        balance: queries::wallet_balance(conn, org_id, &code)?,
        ledger_sum: queries::ledger_sum(conn, org_id, &code)?,
        benefit_code: code,
    })
}
