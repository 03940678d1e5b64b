//! Refund application, shared by refund webhooks and operator refunds.
//!
//! One immediate transaction covers the replay marker, the bounded refund
//! update, grant revocation and the credit reversal. A rejected refund
//! leaves no trace in the ledger tables.

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::queries;
use crate::error::{AppError, ErrorCode, OptionExt, ProcessingFailure, Result, msg};
use crate::models::{
    AuditAction, BenefitGrant, NewLedgerEntry, Order, OrderStatus, RecordIdempotencyKey,
};
use crate::util::{Actor, AuditTrail, sha256_hex};

use super::{grants, idempotency, reversal_key, topup_key, wallet};

/// Who asked for the refund, and the key that makes the request replay-safe.
#[derive(Debug, Clone)]
pub struct RefundRequest<'a> {
    pub amount_cents: Option<i64>,
    pub reason: Option<&'a str>,
    /// Idempotency store namespace (`refund` for webhooks, `ops_refund` for operators)
    pub source: &'a str,
    pub external_id: &'a str,
    /// Digest of the request; a replay with another digest is still absorbed
    pub payload_hash: Option<&'a str>,
    /// Payment event that carried the refund, if any
    pub event_id: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundOutcome {
    pub order: Order,
    /// False for a replayed refund request
    pub applied: bool,
    pub amount_cents: i64,
    pub revoked_grants: Vec<String>,
    /// Credits taken back from the wallet by this refund
    pub reversed_credits: i64,
}

/// Apply a refund to an order.
///
/// A missing amount refunds whatever is still refundable. Created orders are
/// a retryable `INVALID_STATE_TRANSITION` (the paid event may still be on its
/// way); failed orders are a permanent one.
pub fn apply_refund(
    conn: &mut Connection,
    audit: &AuditTrail,
    actor: &Actor,
    order_id: &str,
    request: &RefundRequest,
) -> std::result::Result<RefundOutcome, ProcessingFailure> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let order = queries::get_order_by_id(&tx, order_id)
        .map_err(ProcessingFailure::from)?
        .ok_or_else(|| {
            ProcessingFailure::new(ErrorCode::OrderNotFound, format!("order {} not found", order_id))
        })?;

    match order.status {
        OrderStatus::Created => {
            return Err(ProcessingFailure::new(
                ErrorCode::InvalidStateTransition,
                format!("order {} is not paid yet", order.order_no),
            ));
        }
        OrderStatus::Failed => {
            return Err(ProcessingFailure::permanent(
                ErrorCode::InvalidStateTransition,
                format!("order {} failed and cannot be refunded", order.order_no),
            ));
        }
        OrderStatus::Paid | OrderStatus::Fulfilled | OrderStatus::Refunded => {}
    }

    let hash = match request.payload_hash {
        Some(hash) => hash.to_string(),
        None => sha256_hex(format!("{}:{:?}", order.order_no, request.amount_cents).as_bytes()),
    };
    let marker = RecordIdempotencyKey {
        provider: request.source.to_string(),
        external_id: request.external_id.to_string(),
        recorded_at: 0,
        hash,
        batch_id: Some(order.order_no.clone()),
    };
    if !idempotency::record(&tx, &marker).map_err(ProcessingFailure::from)?.is_new() {
        tracing::debug!(
            order_no = %order.order_no,
            source = request.source,
            external_id = request.external_id,
            "Refund replay absorbed"
        );
        return Ok(RefundOutcome {
            order,
            applied: false,
            amount_cents: 0,
            revoked_grants: Vec::new(),
            reversed_credits: 0,
        });
    }

    let amount = match request.amount_cents {
        Some(amount) if amount <= 0 => {
            return Err(ProcessingFailure::permanent(
                ErrorCode::PayloadInvalid,
                format!("refund amount must be positive, got {}", amount),
            ));
        }
        Some(amount) => amount,
        None => order.refundable_cents(),
    };
    if amount == 0 {
        // Nothing left to refund: an already fully refunded order.
        tx.commit()?;
        return Ok(RefundOutcome {
            order,
            applied: false,
            amount_cents: 0,
            revoked_grants: Vec::new(),
            reversed_credits: 0,
        });
    }

    if !queries::apply_order_refund(&tx, &order.id, amount, request.reason)
        .map_err(ProcessingFailure::from)?
    {
        let failure = ProcessingFailure::new(
            ErrorCode::RefundExceedsPaid,
            format!(
                "refund of {} exceeds remaining {} on order {}",
                amount,
                order.refundable_cents(),
                order.order_no
            ),
        );
        drop(tx);
        tracing::warn!(
            order_no = %order.order_no,
            org_id = order.org_id,
            amount_cents = amount,
            refundable_cents = order.refundable_cents(),
            error_code = %failure.code,
            "Refund rejected"
        );
        audit
            .entry(actor)
            .action(AuditAction::RejectRefund)
            .resource("order", &order.order_no)
            .details(json!({
                "amount_cents": amount,
                "refundable_cents": order.refundable_cents(),
                "event_id": request.event_id,
            }))
            .org(order.org_id)
            .record();
        return Err(failure);
    }

    // Entitlements are taken back once, on the refund that first moves the order to refunded.
    let mut revoked: Vec<BenefitGrant> = Vec::new();
    let mut reversal: Option<(String, i64, i64)> = None;
    if order.status != OrderStatus::Refunded {
        let reason = request.reason.unwrap_or("refund");
        revoked = grants::revoke_order_grants_in(&tx, &order.id, reason)
            .map_err(|e| ProcessingFailure::new(ErrorCode::GrantFailed, e.to_string()))?;

        let original_key = topup_key(&order.provider, &order.order_no);
        let topup =
            queries::get_ledger_entry_by_key(&tx, &original_key).map_err(ProcessingFailure::from)?;
        if let Some(topup) = topup {
            let key = reversal_key(&original_key);
            let meta = json!({ "reverses": original_key, "event_id": request.event_id });
            let applied = wallet::apply_delta_in(
                &tx,
                &NewLedgerEntry {
                    org_id: topup.org_id,
                    benefit_code: &topup.benefit_code,
                    delta: -topup.delta,
                    reason: "refund_reversal",
                    order_no: Some(&order.order_no),
                    attempt_id: None,
                    idempotency_key: &key,
                    meta: Some(&meta),
                },
            )
            .map_err(|e| ProcessingFailure::new(ErrorCode::LedgerFailed, e.to_string()))?;
            if applied.applied {
                reversal = Some((key, -topup.delta, applied.balance));
            }
        }
    }

    let refunded = queries::get_order_by_id(&tx, &order.id)
        .map_err(ProcessingFailure::from)?
        .ok_or_else(|| ProcessingFailure::new(ErrorCode::Internal, "order vanished during refund"))?;
    tx.commit()?;

    tracing::info!(
        order_no = %refunded.order_no,
        org_id = refunded.org_id,
        amount_cents = amount,
        refund_total_cents = refunded.refund_amount_cents,
        revoked_grants = revoked.len(),
        "Order refunded"
    );

    audit
        .entry(actor)
        .action(AuditAction::RefundOrder)
        .resource("order", &refunded.order_no)
        .details(json!({
            "amount_cents": amount,
            "refund_total_cents": refunded.refund_amount_cents,
            "reason": request.reason,
            "event_id": request.event_id,
        }))
        .org(refunded.org_id)
        .record();
    for grant in &revoked {
        audit
            .entry(actor)
            .action(AuditAction::RevokeGrant)
            .resource("benefit_grant", &grant.id)
            .details(json!({ "reason": "refund", "order_no": refunded.order_no }))
            .org(grant.org_id)
            .record();
    }
    let reversed_credits = match &reversal {
        Some((key, delta, balance)) => {
            audit
                .entry(actor)
                .action(AuditAction::AppendLedgerEntry)
                .resource("wallet_ledger", key)
                .details(json!({ "delta": delta, "reason": "refund_reversal", "balance": balance }))
                .org(refunded.org_id)
                .record();
            -delta
        }
        None => 0,
    };

    Ok(RefundOutcome {
        order: refunded,
        applied: true,
        amount_cents: amount,
        revoked_grants: revoked.into_iter().map(|g| g.id).collect(),
        reversed_credits,
    })
}

/// Operator refund request body.
#[derive(Debug, Clone, Deserialize)]
pub struct OpsRefund {
    pub org_id: i64,
    /// Defaults to the whole refundable remainder
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
    pub idempotency_key: String,
}

/// Operator refund. Replays with the same `idempotency_key` are absorbed; a
/// refund beyond the remaining amount is a 422 `REFUND_EXCEEDS_PAID`.
pub fn refund_order(
    conn: &mut Connection,
    audit: &AuditTrail,
    actor: &Actor,
    order_no: &str,
    input: &OpsRefund,
) -> Result<RefundOutcome> {
    let key = input.idempotency_key.trim();
    if key.is_empty() {
        return Err(AppError::BadRequest(msg::IDEMPOTENCY_KEY_REQUIRED.into()));
    }
    let order =
        queries::get_order_in_org(conn, input.org_id, order_no)?.or_not_found(msg::ORDER_NOT_FOUND)?;
    let external_id = format!("{}:{}", order.order_no, key);
    let hash = sha256_hex(
        format!("{}:{:?}:{:?}", order.order_no, input.amount_cents, input.reason).as_bytes(),
    );

    Ok(apply_refund(
        conn,
        audit,
        actor,
        &order.id,
        &RefundRequest {
            amount_cents: input.amount_cents,
            reason: input.reason.as_deref(),
            source: "ops_refund",
            external_id: &external_id,
            payload_hash: Some(&hash),
            event_id: None,
        },
    )?)
}
