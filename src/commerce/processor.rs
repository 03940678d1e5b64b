//! Payment event processor.
//!
//! Each run claims a verified event (compare-and-set on its status), applies
//! it to the referenced order, and records the outcome on the event row.
//! Every step is idempotent, so a failed run is simply retried from the top.

use std::sync::Arc;

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::json;

use crate::db::queries;
use crate::error::{AppError, ErrorCode, OptionExt, ProcessingFailure, Result, msg};
use crate::models::{
    AuditAction, GrantScope, NewGrant, NewLedgerEntry, NormalizedEvent, Order, OrderStatus,
    PaymentEvent, PaymentEventStatus, Sku, SkuKind,
};
use crate::payments::{PaymentProvider, PaymentProviders};
use crate::util::{Actor, AuditTrail};

use super::refunds::{self, RefundRequest};
use super::{RetryPolicy, grants, topup_key, wallet};

/// `processing` rows older than this are considered abandoned.
pub const STUCK_PROCESSING_SECS: i64 = 600;

/// `received` rows older than this were never processed inline.
pub const RECEIVED_GRACE_SECS: i64 = 60;

/// Events handled per sweep run.
pub const SWEEP_BATCH_SIZE: i64 = 100;

/// What a handled event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    Fulfilled {
        order_no: String,
        grants_created: usize,
        credited: i64,
    },
    Refunded {
        order_no: String,
        amount_cents: i64,
        revoked_grants: usize,
        reversed_credits: i64,
    },
    PaymentFailed {
        order_no: String,
    },
    /// The order already moved past what this event asks for
    AlreadyApplied {
        order_no: String,
    },
    /// Event type with no meaning for the ledger
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Handled(Effect),
    Failed {
        code: ErrorCode,
        message: String,
        escalated: bool,
    },
    /// Not claimable: unverified, already handled, or claimed by another run
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reset_stuck: usize,
    pub picked: usize,
    pub handled: usize,
    pub failed: usize,
    pub escalated: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Processor {
    providers: Arc<PaymentProviders>,
    retry: RetryPolicy,
    audit: AuditTrail,
}

impl Processor {
    pub fn new(providers: Arc<PaymentProviders>, retry: RetryPolicy, audit: AuditTrail) -> Self {
        Self {
            providers,
            retry,
            audit,
        }
    }

    /// Process one event. Genuine failures are recorded on the event and
    /// reported in the outcome; `Err` is reserved for infrastructure faults.
    pub fn process(&self, conn: &mut Connection, event_id: &str) -> Result<ProcessOutcome> {
        let Some(event) = queries::claim_event_for_processing(conn, event_id)? else {
            tracing::debug!(event_id, "Payment event not claimable, skipped");
            return Ok(ProcessOutcome::Skipped);
        };

        match self.apply(conn, &event) {
            Ok(effect) => {
                queries::mark_event_handled(conn, &event.id)?;
                tracing::info!(
                    provider = %event.provider,
                    provider_event_id = %event.provider_event_id,
                    attempts = event.attempts,
                    effect = ?effect,
                    "Payment event handled"
                );
                Ok(ProcessOutcome::Handled(effect))
            }
            Err(failure) => self.record_failure(conn, &event, failure),
        }
    }

    /// Retry due events and recover abandoned ones.
    pub fn sweep(&self, conn: &mut Connection) -> Result<SweepReport> {
        let now = queries::now();
        let mut report = SweepReport {
            reset_stuck: queries::reset_stuck_processing(conn, now - STUCK_PROCESSING_SECS)?,
            ..SweepReport::default()
        };
        if report.reset_stuck > 0 {
            tracing::warn!(count = report.reset_stuck, "Reset payment events stuck in processing");
        }

        let due = queries::list_due_events(
            conn,
            now,
            i64::from(self.retry.max_attempts),
            now - RECEIVED_GRACE_SECS,
            SWEEP_BATCH_SIZE,
        )?;
        report.picked = due.len();

        for event in due {
            match self.process(conn, &event.id) {
                Ok(ProcessOutcome::Handled(_)) => report.handled += 1,
                Ok(ProcessOutcome::Failed { escalated, .. }) => {
                    report.failed += 1;
                    if escalated {
                        report.escalated += 1;
                    }
                }
                Ok(ProcessOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(event_id = %event.id, "Retry sweep could not process event: {}", e);
                }
            }
        }

        if report.picked > 0 || report.reset_stuck > 0 {
            tracing::info!(
                picked = report.picked,
                handled = report.handled,
                failed = report.failed,
                escalated = report.escalated,
                "Retry sweep finished"
            );
        }
        Ok(report)
    }

    /// Operator reprocess: clear the escalation and run the event again.
    /// The attempt counter keeps counting.
    pub fn reprocess(&self, conn: &mut Connection, actor: &Actor, event_id: &str) -> Result<ProcessOutcome> {
        let event = queries::get_payment_event(conn, event_id)?.or_not_found(msg::EVENT_NOT_FOUND)?;
        if !queries::reset_event_for_reprocess(conn, &event.id)? {
            return Err(AppError::Conflict(format!(
                "Payment event is {} (signature_ok={}) and cannot be reprocessed",
                event.status, event.signature_ok
            )));
        }

        self.audit
            .entry(actor)
            .action(AuditAction::ReprocessEvent)
            .resource("payment_event", &event.id)
            .details(json!({
                "provider": event.provider,
                "provider_event_id": event.provider_event_id,
                "attempts": event.attempts,
                "last_error_code": event.last_error_code,
            }))
            .org(event.org_id)
            .record();

        self.process(conn, &event.id)
    }

    fn apply(&self, conn: &mut Connection, event: &PaymentEvent) -> std::result::Result<Effect, ProcessingFailure> {
        let provider = self.providers.get(&event.provider).ok_or_else(|| {
            ProcessingFailure::new(
                ErrorCode::Internal,
                format!("provider {} is not enabled", event.provider),
            )
        })?;
        let normalized = normalized_of(provider, event)?;

        let order = load_order(conn, &event.provider, &normalized)?;
        if order.provider != event.provider {
            return Err(ProcessingFailure::new(
                ErrorCode::ProviderMismatch,
                format!(
                    "order {} belongs to provider {}, event came from {}",
                    order.order_no, order.provider, event.provider
                ),
            ));
        }

        if normalized.is_refund() {
            self.refund(conn, event, &order, &normalized)
        } else if provider.is_success_event(&normalized.event_type) {
            self.fulfill(conn, event, order, &normalized)
        } else if provider.is_failure_event(&normalized.event_type) {
            payment_failed(conn, &order)
        } else {
            tracing::debug!(
                provider = %event.provider,
                event_type = %normalized.event_type,
                order_no = %order.order_no,
                "Payment event type has no ledger effect"
            );
            Ok(Effect::Ignored)
        }
    }

    /// created -> paid -> fulfilled, issuing the SKU's benefits on the way.
    fn fulfill(
        &self,
        conn: &mut Connection,
        event: &PaymentEvent,
        order: Order,
        normalized: &NormalizedEvent,
    ) -> std::result::Result<Effect, ProcessingFailure> {
        match order.status {
            OrderStatus::Failed => {
                return Err(ProcessingFailure::permanent(
                    ErrorCode::InvalidStateTransition,
                    format!("order {} is failed and cannot be paid", order.order_no),
                ));
            }
            status if status.is_past(OrderStatus::Paid) => {
                tracing::debug!(order_no = %order.order_no, status = %status, "Paid event replay absorbed");
                return Ok(Effect::AlreadyApplied {
                    order_no: order.order_no,
                });
            }
            _ => {}
        }

        if let Some(amount) = normalized.amount_cents {
            if amount != order.amount_cents {
                return Err(ProcessingFailure::new(
                    ErrorCode::AmountMismatch,
                    format!("event amount {} != order amount {}", amount, order.amount_cents),
                ));
            }
        }
        if let Some(currency) = normalized.currency.as_deref() {
            if !currency.eq_ignore_ascii_case(&order.currency) {
                return Err(ProcessingFailure::new(
                    ErrorCode::CurrencyMismatch,
                    format!("event currency {} != order currency {}", currency, order.currency),
                ));
            }
        }

        if queries::mark_order_paid(
            conn,
            &order.id,
            normalized.provider_order_id.as_deref(),
            normalized.paid_at,
        )? {
            tracing::info!(order_no = %order.order_no, org_id = order.org_id, "Order paid");
        }

        let sku = queries::resolve_sku(conn, order.org_id, &order.sku)?.ok_or_else(|| {
            ProcessingFailure::new(
                ErrorCode::SkuNotFound,
                format!("SKU {} is missing or inactive", order.sku),
            )
        })?;
        let plan = FulfillmentPlan::for_order(&order, &sku, event)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // A refund may have committed since the order was loaded.
        let current = queries::get_order_by_id(&tx, &order.id)?.ok_or_else(|| {
            ProcessingFailure::new(ErrorCode::OrderNotFound, format!("order {} not found", order.order_no))
        })?;
        if current.status != OrderStatus::Paid {
            drop(tx);
            tracing::info!(
                order_no = %order.order_no,
                status = %current.status,
                "Order moved on before fulfillment, nothing issued"
            );
            return Ok(Effect::AlreadyApplied {
                order_no: order.order_no,
            });
        }
        let granted = grants::grant_in(&tx, &plan.grant)
            .map_err(|e| ProcessingFailure::new(ErrorCode::GrantFailed, e.to_string()))?;
        let credit = match &plan.topup {
            Some(topup) => Some(
                wallet::apply_delta_in(&tx, &topup.entry())
                    .map_err(|e| ProcessingFailure::new(ErrorCode::LedgerFailed, e.to_string()))?,
            ),
            None => None,
        };
        let fulfilled = queries::mark_order_fulfilled(&tx, &order.id)?;
        tx.commit()?;

        let actor = Actor::provider(&event.provider);
        if granted.created {
            self.audit
                .entry(&actor)
                .action(AuditAction::IssueGrant)
                .resource("benefit_grant", &granted.grant.id)
                .details(json!({
                    "order_no": order.order_no,
                    "benefit_code": granted.grant.benefit_code,
                    "benefit_type": granted.grant.benefit_type,
                    "benefit_ref": granted.grant.benefit_ref,
                    "event_id": event.id,
                }))
                .org(order.org_id)
                .record();
        }
        let credited = match (&plan.topup, credit) {
            (Some(topup), Some(applied)) if applied.applied => {
                self.audit
                    .entry(&actor)
                    .action(AuditAction::AppendLedgerEntry)
                    .resource("wallet_ledger", &topup.key)
                    .details(json!({
                        "benefit_code": topup.benefit_code,
                        "delta": topup.delta,
                        "reason": "topup",
                        "order_no": order.order_no,
                        "balance": applied.balance,
                    }))
                    .org(order.org_id)
                    .record();
                topup.delta
            }
            _ => 0,
        };

        if fulfilled {
            tracing::info!(
                order_no = %order.order_no,
                org_id = order.org_id,
                benefit_code = %sku.benefit_code,
                credited,
                "Order fulfilled"
            );
        }
        Ok(Effect::Fulfilled {
            order_no: order.order_no,
            grants_created: usize::from(granted.created),
            credited,
        })
    }

    fn refund(
        &self,
        conn: &mut Connection,
        event: &PaymentEvent,
        order: &Order,
        normalized: &NormalizedEvent,
    ) -> std::result::Result<Effect, ProcessingFailure> {
        let actor = Actor::provider(&event.provider);
        let outcome = refunds::apply_refund(
            conn,
            &self.audit,
            &actor,
            &order.id,
            &RefundRequest {
                amount_cents: normalized.refund_amount_cents,
                reason: normalized.refund_reason.as_deref(),
                source: "refund",
                external_id: &event.id,
                payload_hash: Some(&event.payload_sha256),
                event_id: Some(&event.id),
            },
        )?;

        if !outcome.applied {
            return Ok(Effect::AlreadyApplied {
                order_no: outcome.order.order_no,
            });
        }
        Ok(Effect::Refunded {
            order_no: outcome.order.order_no,
            amount_cents: outcome.amount_cents,
            revoked_grants: outcome.revoked_grants.len(),
            reversed_credits: outcome.reversed_credits,
        })
    }

    fn record_failure(
        &self,
        conn: &Connection,
        event: &PaymentEvent,
        failure: ProcessingFailure,
    ) -> Result<ProcessOutcome> {
        let (code, message, escalate, next_attempt_at) = if !failure.retryable {
            (failure.code, failure.message, true, None)
        } else if self.retry.is_exhausted(event.attempts) {
            (
                ErrorCode::MaxRetriesExceeded,
                format!("{}: {}", failure.code, failure.message),
                true,
                None,
            )
        } else {
            let next = self.retry.next_attempt_at(queries::now(), event.attempts);
            (failure.code, failure.message, false, Some(next))
        };

        queries::mark_event_failed(conn, &event.id, code.as_ref(), &message, next_attempt_at, escalate)?;

        if escalate {
            tracing::error!(
                provider = %event.provider,
                provider_event_id = %event.provider_event_id,
                order_no = ?event.order_no,
                org_id = event.org_id,
                error_code = %code,
                attempts = event.attempts,
                "Payment event escalated to operators: {}",
                message
            );
            self.audit
                .entry(&Actor::system("payment_processor"))
                .action(AuditAction::EscalateEvent)
                .resource("payment_event", &event.id)
                .details(json!({
                    "error_code": code,
                    "error_message": message,
                    "attempts": event.attempts,
                }))
                .org(event.org_id)
                .record();
        } else {
            tracing::warn!(
                provider = %event.provider,
                provider_event_id = %event.provider_event_id,
                order_no = ?event.order_no,
                error_code = %code,
                attempts = event.attempts,
                next_attempt_at,
                "Payment event failed, will retry: {}",
                message
            );
        }

        Ok(ProcessOutcome::Failed {
            code,
            message,
            escalated: escalate,
        })
    }
}

/// The grant and optional credit a paid order produces.
struct FulfillmentPlan {
    grant: NewGrant,
    topup: Option<Topup>,
}

struct Topup {
    org_id: i64,
    benefit_code: String,
    delta: i64,
    key: String,
    order_no: String,
    meta: serde_json::Value,
}

impl Topup {
    fn entry(&self) -> NewLedgerEntry<'_> {
        NewLedgerEntry {
            org_id: self.org_id,
            benefit_code: &self.benefit_code,
            delta: self.delta,
            reason: "topup",
            order_no: Some(&self.order_no),
            attempt_id: None,
            idempotency_key: &self.key,
            meta: Some(&self.meta),
        }
    }
}

impl FulfillmentPlan {
    fn for_order(
        order: &Order,
        sku: &Sku,
        event: &PaymentEvent,
    ) -> std::result::Result<Self, ProcessingFailure> {
        let expires_at = sku
            .meta
            .duration_days
            .map(|days| queries::now() + days * 86_400);

        match sku.kind {
            SkuKind::CreditPack => {
                let delta = sku.unit_qty.checked_mul(order.quantity).ok_or_else(|| {
                    ProcessingFailure::permanent(ErrorCode::LedgerFailed, "credit amount overflows")
                })?;
                Ok(Self {
                    grant: NewGrant {
                        org_id: order.org_id,
                        source_order_id: order.id.clone(),
                        source_event_id: Some(event.id.clone()),
                        benefit_type: SkuKind::CreditPack.to_string(),
                        benefit_code: sku.benefit_code.clone(),
                        benefit_ref: order.benefit_ref(),
                        user_id: order.user_id.clone(),
                        scope: GrantScope::Account,
                        attempt_id: None,
                        expires_at,
                    },
                    topup: Some(Topup {
                        org_id: order.org_id,
                        benefit_code: sku.benefit_code.clone(),
                        delta,
                        key: topup_key(&order.provider, &order.order_no),
                        order_no: order.order_no.clone(),
                        meta: json!({ "sku": sku.sku, "quantity": order.quantity, "event_id": event.id }),
                    }),
                })
            }
            SkuKind::ReportUnlock => {
                let attempt_id = order.target_attempt_id.clone().ok_or_else(|| {
                    ProcessingFailure::new(
                        ErrorCode::AttemptRequired,
                        format!("order {} unlocks a report but names no attempt", order.order_no),
                    )
                })?;
                Ok(Self {
                    grant: NewGrant {
                        org_id: order.org_id,
                        source_order_id: order.id.clone(),
                        source_event_id: Some(event.id.clone()),
                        benefit_type: SkuKind::ReportUnlock.to_string(),
                        benefit_code: sku.benefit_code.clone(),
                        benefit_ref: order.benefit_ref(),
                        user_id: order.user_id.clone(),
                        scope: sku.scope,
                        attempt_id: Some(attempt_id),
                        expires_at,
                    },
                    topup: None,
                })
            }
        }
    }
}

fn normalized_of(
    provider: &dyn PaymentProvider,
    event: &PaymentEvent,
) -> std::result::Result<NormalizedEvent, ProcessingFailure> {
    if let Some(normalized) = &event.normalized {
        return Ok(normalized.clone());
    }
    let payload = event.payload_json.as_deref().ok_or_else(|| {
        ProcessingFailure::new(ErrorCode::PayloadInvalid, "event has neither normalized data nor payload")
    })?;
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| ProcessingFailure::new(ErrorCode::PayloadInvalid, e.to_string()))?;
    Ok(provider.normalize(&value))
}

fn load_order(
    conn: &Connection,
    provider: &str,
    normalized: &NormalizedEvent,
) -> std::result::Result<Order, ProcessingFailure> {
    let (order, key) = match (&normalized.order_no, &normalized.provider_order_id) {
        (Some(order_no), _) => (queries::get_order_by_no(conn, order_no)?, order_no),
        (None, Some(provider_order_id)) => (
            queries::get_order_by_provider_order_id(conn, provider, provider_order_id)?,
            provider_order_id,
        ),
        (None, None) => {
            return Err(ProcessingFailure::new(
                ErrorCode::PayloadInvalid,
                "payload references no order_no or provider order id",
            ));
        }
    };
    order.ok_or_else(|| ProcessingFailure::new(ErrorCode::OrderNotFound, format!("order {} not found", key)))
}

/// created -> failed on a payment-failure event. Later states ignore it.
fn payment_failed(conn: &Connection, order: &Order) -> std::result::Result<Effect, ProcessingFailure> {
    if queries::mark_order_failed(conn, &order.id)? {
        tracing::info!(order_no = %order.order_no, org_id = order.org_id, "Order payment failed");
        return Ok(Effect::PaymentFailed {
            order_no: order.order_no.clone(),
        });
    }
    tracing::debug!(order_no = %order.order_no, status = %order.status, "Payment failure ignored for order");
    Ok(Effect::AlreadyApplied {
        order_no: order.order_no.clone(),
    })
}

impl ProcessOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, ProcessOutcome::Handled(_))
    }

    /// Event status after this outcome, when the run changed it.
    pub fn event_status(&self) -> Option<PaymentEventStatus> {
        match self {
            ProcessOutcome::Handled(_) => Some(PaymentEventStatus::Handled),
            ProcessOutcome::Failed { .. } => Some(PaymentEventStatus::Failed),
            ProcessOutcome::Skipped => None,
        }
    }
}
