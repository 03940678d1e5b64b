use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::id::EntityType;
use crate::models::*;
use crate::pagination::PageWindow;

use super::from_row::{
    AUDIT_LOG_COLS, CONSUMPTION_COLS, FromRow, GRANT_COLS, IDEMPOTENCY_KEY_COLS, LEDGER_COLS,
    ORDER_COLS, PAYMENT_EVENT_COLS, SKU_COLS, SNAPSHOT_COLS, WALLET_COLS, query_all, query_one,
};

pub(crate) fn now() -> i64 {
    Utc::now().timestamp()
}

// ============ SKUs ============

pub fn upsert_sku(conn: &Connection, input: &UpsertSku) -> Result<Sku> {
    let now = now();
    let scope = input.scope.unwrap_or(match input.kind {
        SkuKind::CreditPack => GrantScope::Account,
        SkuKind::ReportUnlock => GrantScope::Attempt,
    });
    let currency = input
        .currency
        .as_deref()
        .unwrap_or("USD")
        .trim()
        .to_uppercase();
    let meta_json = serde_json::to_string(&input.meta)?;

    let sku = conn.query_row(
        &format!(
            "INSERT INTO skus (org_id, sku, kind, unit_qty, benefit_code, scope, price_cents, currency, is_active, meta_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(org_id, sku) DO UPDATE SET
                 kind = excluded.kind,
                 unit_qty = excluded.unit_qty,
                 benefit_code = excluded.benefit_code,
                 scope = excluded.scope,
                 price_cents = excluded.price_cents,
                 currency = excluded.currency,
                 is_active = excluded.is_active,
                 meta_json = excluded.meta_json,
                 updated_at = excluded.updated_at
             RETURNING {}",
            SKU_COLS
        ),
        params![
            input.org_id,
            input.sku.trim(),
            input.kind.as_ref(),
            input.unit_qty,
            input.benefit_code.trim().to_uppercase(),
            scope.as_ref(),
            input.price_cents,
            currency,
            input.is_active as i32,
            meta_json,
            now
        ],
        Sku::from_row,
    )?;
    Ok(sku)
}

/// Active SKU for an org, falling back to the legacy org 0 catalog.
pub fn resolve_sku(conn: &Connection, org_id: i64, sku: &str) -> Result<Option<Sku>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM skus WHERE sku = ?1 AND is_active = 1 AND org_id IN (?2, 0)
             ORDER BY CASE WHEN org_id = ?2 THEN 0 ELSE 1 END LIMIT 1",
            SKU_COLS
        ),
        &[&sku, &org_id],
    )
}

pub fn list_skus(conn: &Connection, org_id: i64) -> Result<Vec<Sku>> {
    query_all(
        conn,
        &format!("SELECT {} FROM skus WHERE org_id = ?1 ORDER BY sku", SKU_COLS),
        &[&org_id],
    )
}

// ============ Orders ============

/// Insert an order unless `(org_id, provider, idempotency_key)` already exists.
/// Returns false on conflict; the caller re-reads the stored row.
pub fn insert_order(conn: &Connection, order: &Order) -> Result<bool> {
    let affected = conn.execute(
        "INSERT INTO orders (id, order_no, org_id, user_id, anon_id, sku, quantity, target_attempt_id, amount_cents, currency, status, provider, idempotency_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
         ON CONFLICT(org_id, provider, idempotency_key) DO NOTHING",
        params![
            &order.id,
            &order.order_no,
            order.org_id,
            &order.user_id,
            &order.anon_id,
            &order.sku,
            order.quantity,
            &order.target_attempt_id,
            order.amount_cents,
            &order.currency,
            order.status.as_ref(),
            &order.provider,
            &order.idempotency_key,
            order.created_at
        ],
    )?;
    Ok(affected > 0)
}

pub fn get_order_by_id(conn: &Connection, id: &str) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLS),
        &[&id],
    )
}

pub fn get_order_by_no(conn: &Connection, order_no: &str) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!("SELECT {} FROM orders WHERE order_no = ?1", ORDER_COLS),
        &[&order_no],
    )
}

/// Org-scoped lookup for read APIs; an order in another org is reported as missing.
pub fn get_order_in_org(conn: &Connection, org_id: i64, order_no: &str) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE order_no = ?1 AND org_id = ?2",
            ORDER_COLS
        ),
        &[&order_no, &org_id],
    )
}

pub fn get_order_by_idempotency_key(
    conn: &Connection,
    org_id: i64,
    provider: &str,
    idempotency_key: &str,
) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE org_id = ?1 AND provider = ?2 AND idempotency_key = ?3",
            ORDER_COLS
        ),
        &[&org_id, &provider, &idempotency_key],
    )
}

pub fn get_order_by_provider_order_id(
    conn: &Connection,
    provider: &str,
    provider_order_id: &str,
) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE provider = ?1 AND provider_order_id = ?2
             ORDER BY created_at DESC LIMIT 1",
            ORDER_COLS
        ),
        &[&provider, &provider_order_id],
    )
}

/// created -> paid. Conditional on the source state so concurrent processors
/// cannot both win.
pub fn mark_order_paid(
    conn: &Connection,
    id: &str,
    provider_order_id: Option<&str>,
    paid_at: Option<i64>,
) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "UPDATE orders SET status = 'paid', paid_at = COALESCE(?1, ?2),
             provider_order_id = COALESCE(provider_order_id, ?3), updated_at = ?2
         WHERE id = ?4 AND status = 'created'",
        params![paid_at, now, provider_order_id, id],
    )?;
    Ok(affected > 0)
}

/// paid -> fulfilled.
pub fn mark_order_fulfilled(conn: &Connection, id: &str) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "UPDATE orders SET status = 'fulfilled', fulfilled_at = ?1, updated_at = ?1
         WHERE id = ?2 AND status = 'paid'",
        params![now, id],
    )?;
    Ok(affected > 0)
}

/// created -> failed.
pub fn mark_order_failed(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE orders SET status = 'failed', updated_at = ?1 WHERE id = ?2 AND status = 'created'",
        params![now(), id],
    )?;
    Ok(affected > 0)
}

/// Add a refund to the order and move it to `refunded`.
///
/// The bound `refund_amount_cents + amount <= amount_cents` is part of the
/// WHERE clause; zero rows means the refund was rejected or the order is not
/// refundable from its current state.
pub fn apply_order_refund(
    conn: &Connection,
    id: &str,
    amount_cents: i64,
    reason: Option<&str>,
) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "UPDATE orders SET
             refund_amount_cents = refund_amount_cents + ?1,
             refund_reason = COALESCE(?2, refund_reason),
             refunded_at = COALESCE(refunded_at, ?3),
             status = 'refunded',
             updated_at = ?3
         WHERE id = ?4
           AND status IN ('paid', 'fulfilled', 'refunded')
           AND refund_amount_cents + ?1 <= amount_cents",
        params![amount_cents, reason, now, id],
    )?;
    Ok(affected > 0)
}

// ============ Payment Events ============

/// Insert a new event unless `(provider, provider_event_id)` already exists.
/// Returns the new row id, or None for a duplicate delivery.
pub fn insert_payment_event(conn: &Connection, event: &NewPaymentEvent) -> Result<Option<String>> {
    let id = EntityType::PaymentEvent.gen_id();
    let affected = conn.execute(
        "INSERT INTO payment_events (id, org_id, provider, provider_event_id, order_no, event_type, payload_json, payload_sha256, payload_size_bytes, payload_excerpt, normalized_json, signature_ok, status, last_error_code, last_error_message, request_id, ip_address, user_agent, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
         ON CONFLICT(provider, provider_event_id) DO NOTHING",
        params![
            &id,
            event.org_id,
            event.provider,
            event.provider_event_id,
            event.order_no,
            event.event_type,
            event.payload_json,
            event.payload_sha256,
            event.payload_size_bytes,
            event.payload_excerpt,
            event.normalized_json,
            event.signature_ok as i32,
            event.status.as_ref(),
            event.error_code,
            event.error_message,
            &event.meta.request_id,
            &event.meta.ip_address,
            &event.meta.user_agent,
            now()
        ],
    )?;
    Ok((affected > 0).then_some(id))
}

pub fn get_payment_event(conn: &Connection, id: &str) -> Result<Option<PaymentEvent>> {
    query_one(
        conn,
        &format!("SELECT {} FROM payment_events WHERE id = ?1", PAYMENT_EVENT_COLS),
        &[&id],
    )
}

pub fn get_payment_event_by_provider_id(
    conn: &Connection,
    provider: &str,
    provider_event_id: &str,
) -> Result<Option<PaymentEvent>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_events WHERE provider = ?1 AND provider_event_id = ?2",
            PAYMENT_EVENT_COLS
        ),
        &[&provider, &provider_event_id],
    )
}

pub fn list_events_for_order(conn: &Connection, order_no: &str) -> Result<Vec<PaymentEvent>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_events WHERE order_no = ?1 ORDER BY received_at, id",
            PAYMENT_EVENT_COLS
        ),
        &[&order_no],
    )
}

pub fn record_duplicate_delivery(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE payment_events SET duplicate_count = duplicate_count + 1, last_duplicate_at = ?1
         WHERE id = ?2",
        params![now(), id],
    )?;
    Ok(())
}

/// Replace an unverified row with a delivery that verified.
/// Only rows with `signature_ok = 0` are touched.
pub fn upgrade_event_signature(
    conn: &Connection,
    id: &str,
    event: &NewPaymentEvent,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE payment_events SET
             signature_ok = 1, status = 'received', org_id = ?1, order_no = ?2, event_type = ?3,
             payload_json = ?4, payload_sha256 = ?5, payload_size_bytes = ?6, payload_excerpt = ?7,
             normalized_json = ?8, last_error_code = NULL, last_error_message = NULL,
             request_id = ?9, ip_address = ?10, user_agent = ?11,
             duplicate_count = duplicate_count + 1, last_duplicate_at = ?12
         WHERE id = ?13 AND signature_ok = 0",
        params![
            event.org_id,
            event.order_no,
            event.event_type,
            event.payload_json,
            event.payload_sha256,
            event.payload_size_bytes,
            event.payload_excerpt,
            event.normalized_json,
            &event.meta.request_id,
            &event.meta.ip_address,
            &event.meta.user_agent,
            now(),
            id
        ],
    )?;
    Ok(affected > 0)
}

/// Claim a verified event for one processing attempt.
///
/// Compare-and-set on status: two processors racing on the same event see
/// exactly one winner. The attempt counter is bumped by the winner.
pub fn claim_event_for_processing(conn: &Connection, id: &str) -> Result<Option<PaymentEvent>> {
    let event = conn
        .query_row(
            &format!(
                "UPDATE payment_events SET status = 'processing', attempts = attempts + 1,
                     processed_at = ?1, next_attempt_at = NULL
                 WHERE id = ?2 AND signature_ok = 1 AND status IN ('received', 'failed')
                 RETURNING {}",
                PAYMENT_EVENT_COLS
            ),
            params![now(), id],
            PaymentEvent::from_row,
        )
        .optional()?;
    Ok(event)
}

pub fn mark_event_handled(conn: &Connection, id: &str) -> Result<()> {
    let now = now();
    conn.execute(
        "UPDATE payment_events SET status = 'handled', handled_at = ?1, next_attempt_at = NULL
         WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

/// Record a failed attempt. `escalate` moves the event to the operator queue.
pub fn mark_event_failed(
    conn: &Connection,
    id: &str,
    error_code: &str,
    error_message: &str,
    next_attempt_at: Option<i64>,
    escalate: bool,
) -> Result<()> {
    let now = now();
    conn.execute(
        "UPDATE payment_events SET status = 'failed', last_error_code = ?1, last_error_message = ?2,
             next_attempt_at = ?3, escalated_at = CASE WHEN ?4 THEN ?5 ELSE escalated_at END
         WHERE id = ?6",
        params![error_code, error_message, next_attempt_at, escalate, now, id],
    )?;
    Ok(())
}

/// Events the retry sweep should pick up: failed ones that are due and below
/// the attempt threshold, plus received ones nobody processed within the grace period.
pub fn list_due_events(
    conn: &Connection,
    now: i64,
    max_attempts: i64,
    received_before: i64,
    limit: i64,
) -> Result<Vec<PaymentEvent>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_events
             WHERE signature_ok = 1 AND escalated_at IS NULL AND (
                 (status = 'failed' AND attempts < ?2 AND COALESCE(next_attempt_at, 0) <= ?1)
                 OR (status = 'received' AND received_at <= ?3)
             )
             ORDER BY COALESCE(next_attempt_at, received_at), id
             LIMIT ?4",
            PAYMENT_EVENT_COLS
        ),
        &[&now, &max_attempts, &received_before, &limit],
    )
}

/// Move events abandoned mid-processing back to `failed` so the sweep retries them.
pub fn reset_stuck_processing(conn: &Connection, started_before: i64) -> Result<usize> {
    let now = now();
    let affected = conn.execute(
        "UPDATE payment_events SET status = 'failed', last_error_code = 'INTERNAL',
             last_error_message = 'processing interrupted', next_attempt_at = ?1
         WHERE status = 'processing' AND processed_at < ?2",
        params![now, started_before],
    )?;
    Ok(affected)
}

/// Failed events that are still below the escalation threshold.
pub fn list_failed_events_paginated(
    conn: &Connection,
    org_id: Option<i64>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<PaymentEvent>, i64)> {
    list_events_where(
        conn,
        "status = 'failed' AND escalated_at IS NULL",
        org_id,
        limit,
        offset,
    )
}

/// The operator queue.
pub fn list_escalated_events_paginated(
    conn: &Connection,
    org_id: Option<i64>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<PaymentEvent>, i64)> {
    list_events_where(conn, "escalated_at IS NOT NULL", org_id, limit, offset)
}

fn list_events_where(
    conn: &Connection,
    condition: &str,
    org_id: Option<i64>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<PaymentEvent>, i64)> {
    let org_clause = if org_id.is_some() { " AND org_id = ?1" } else { " AND ?1 IS NULL" };

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM payment_events WHERE {}{}",
            condition, org_clause
        ),
        params![org_id],
        |row| row.get(0),
    )?;

    let events = query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_events WHERE {}{} ORDER BY received_at DESC, id LIMIT ?2 OFFSET ?3",
            PAYMENT_EVENT_COLS, condition, org_clause
        ),
        &[&org_id, &limit, &offset],
    )?;

    Ok((events, total))
}

/// Clear `escalated_at` and make the event immediately due again.
/// The attempt counter is left alone.
pub fn reset_event_for_reprocess(conn: &Connection, id: &str) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "UPDATE payment_events SET escalated_at = NULL, next_attempt_at = ?1
         WHERE id = ?2 AND signature_ok = 1 AND status IN ('received', 'failed')",
        params![now, id],
    )?;
    Ok(affected > 0)
}

/// Drop stored bodies of handled events older than the cutoff.
/// Digest, size and excerpt stay; rows are never deleted.
pub fn prune_event_payloads(conn: &Connection, retention_days: i64) -> Result<usize> {
    let cutoff = now() - (retention_days * 86400);
    let affected = conn.execute(
        "UPDATE payment_events SET payload_json = NULL
         WHERE status = 'handled' AND payload_json IS NOT NULL AND received_at < ?1",
        params![cutoff],
    )?;
    Ok(affected)
}

// ============ Benefit Grants ============

/// Insert a grant unless its identity already exists. Returns the new row.
pub fn insert_grant(conn: &Connection, grant: &NewGrant) -> Result<Option<BenefitGrant>> {
    let now = now();
    let created = conn
        .query_row(
            &format!(
                "INSERT INTO benefit_grants (id, org_id, user_id, benefit_ref, benefit_code, benefit_type, scope, attempt_id, status, source_order_id, source_event_id, expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10, ?11, ?12, ?12)
                 ON CONFLICT(source_order_id, benefit_type, benefit_ref) DO NOTHING
                 RETURNING {}",
                GRANT_COLS
            ),
            params![
                EntityType::BenefitGrant.gen_id(),
                grant.org_id,
                &grant.user_id,
                &grant.benefit_ref,
                &grant.benefit_code,
                &grant.benefit_type,
                grant.scope.as_ref(),
                &grant.attempt_id,
                &grant.source_order_id,
                &grant.source_event_id,
                grant.expires_at,
                now
            ],
            BenefitGrant::from_row,
        )
        .optional()?;
    Ok(created)
}

pub fn get_grant(conn: &Connection, id: &str) -> Result<Option<BenefitGrant>> {
    query_one(
        conn,
        &format!("SELECT {} FROM benefit_grants WHERE id = ?1", GRANT_COLS),
        &[&id],
    )
}

pub fn get_grant_by_identity(
    conn: &Connection,
    source_order_id: &str,
    benefit_type: &str,
    benefit_ref: &str,
) -> Result<Option<BenefitGrant>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM benefit_grants
             WHERE source_order_id = ?1 AND benefit_type = ?2 AND benefit_ref = ?3",
            GRANT_COLS
        ),
        &[&source_order_id, &benefit_type, &benefit_ref],
    )
}

pub fn list_grants_for_order(conn: &Connection, source_order_id: &str) -> Result<Vec<BenefitGrant>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM benefit_grants WHERE source_order_id = ?1 ORDER BY created_at, id",
            GRANT_COLS
        ),
        &[&source_order_id],
    )
}

/// active -> revoked. Returns false if the grant was already revoked or missing.
pub fn revoke_grant(conn: &Connection, id: &str, reason: &str) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "UPDATE benefit_grants SET status = 'revoked', revoked_at = ?1, revoke_reason = ?2, updated_at = ?1
         WHERE id = ?3 AND status = 'active'",
        params![now, reason, id],
    )?;
    Ok(affected > 0)
}

/// Active, unexpired grant for a benefit.
///
/// Attempt-scoped grants match on `attempt_id`; account-scoped grants match on
/// the holder (`user_id` or `benefit_ref`).
pub fn find_active_grant(
    conn: &Connection,
    org_id: i64,
    benefit_code: &str,
    attempt_id: Option<&str>,
    holder: Option<&str>,
) -> Result<Option<BenefitGrant>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM benefit_grants
             WHERE org_id = ?1 AND benefit_code = ?2 AND status = 'active'
               AND (expires_at IS NULL OR expires_at > ?3)
               AND (
                   (scope = 'attempt' AND ?4 IS NOT NULL AND attempt_id = ?4)
                   OR (scope = 'account' AND ?5 IS NOT NULL AND (user_id = ?5 OR benefit_ref = ?5))
               )
             ORDER BY CASE scope WHEN 'attempt' THEN 0 ELSE 1 END, created_at
             LIMIT 1",
            GRANT_COLS
        ),
        &[&org_id, &benefit_code, &now(), &attempt_id, &holder],
    )
}

// ============ Wallet + Ledger ============

/// Append a ledger row unless its idempotency key was already used.
pub fn insert_ledger_entry(conn: &Connection, entry: &NewLedgerEntry) -> Result<bool> {
    let meta_json = entry.meta.map(|m| m.to_string());
    let affected = conn.execute(
        "INSERT INTO benefit_wallet_ledgers (org_id, benefit_code, delta, reason, order_no, attempt_id, idempotency_key, meta_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            entry.org_id,
            entry.benefit_code,
            entry.delta,
            entry.reason,
            entry.order_no,
            entry.attempt_id,
            entry.idempotency_key,
            meta_json,
            now()
        ],
    )?;
    Ok(affected > 0)
}

pub fn get_ledger_entry_by_key(conn: &Connection, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM benefit_wallet_ledgers WHERE idempotency_key = ?1",
            LEDGER_COLS
        ),
        &[&idempotency_key],
    )
}

pub fn list_ledger_entries_for_order(conn: &Connection, order_no: &str) -> Result<Vec<LedgerEntry>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM benefit_wallet_ledgers WHERE order_no = ?1 ORDER BY id",
            LEDGER_COLS
        ),
        &[&order_no],
    )
}

pub fn list_ledger_entries_paginated(
    conn: &Connection,
    org_id: i64,
    benefit_code: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<LedgerEntry>, i64)> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM benefit_wallet_ledgers WHERE org_id = ?1 AND benefit_code = ?2",
        params![org_id, benefit_code],
        |row| row.get(0),
    )?;
    let entries = query_all(
        conn,
        &format!(
            "SELECT {} FROM benefit_wallet_ledgers WHERE org_id = ?1 AND benefit_code = ?2
             ORDER BY id DESC LIMIT ?3 OFFSET ?4",
            LEDGER_COLS
        ),
        &[&org_id, &benefit_code, &limit, &offset],
    )?;
    Ok((entries, total))
}

/// Add `delta` to the wallet projection, creating the row on first use.
/// Returns the new balance.
pub fn add_to_wallet(conn: &Connection, org_id: i64, benefit_code: &str, delta: i64) -> Result<i64> {
    let now = now();
    let balance = conn.query_row(
        "INSERT INTO benefit_wallets (org_id, benefit_code, balance, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(org_id, benefit_code) DO UPDATE SET
             balance = balance + excluded.balance,
             updated_at = excluded.updated_at
         RETURNING balance",
        params![org_id, benefit_code, delta, now],
        |row| row.get(0),
    )?;
    Ok(balance)
}

pub fn get_wallet(conn: &Connection, org_id: i64, benefit_code: &str) -> Result<Option<BenefitWallet>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM benefit_wallets WHERE org_id = ?1 AND benefit_code = ?2",
            WALLET_COLS
        ),
        &[&org_id, &benefit_code],
    )
}

pub fn wallet_balance(conn: &Connection, org_id: i64, benefit_code: &str) -> Result<i64> {
    let balance: Option<i64> = conn
        .query_row(
            "SELECT balance FROM benefit_wallets WHERE org_id = ?1 AND benefit_code = ?2",
            params![org_id, benefit_code],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

pub fn ledger_sum(conn: &Connection, org_id: i64, benefit_code: &str) -> Result<i64> {
    let sum = conn.query_row(
        "SELECT COALESCE(SUM(delta), 0) FROM benefit_wallet_ledgers WHERE org_id = ?1 AND benefit_code = ?2",
        params![org_id, benefit_code],
        |row| row.get(0),
    )?;
    Ok(sum)
}

/// Benefit codes of the org whose projection disagrees with the ledger sum,
/// including ledger codes that never got a wallet row.
pub fn list_drifted_wallets(conn: &Connection, org_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT w.benefit_code FROM benefit_wallets w
         WHERE w.org_id = ?1 AND w.balance != COALESCE(
             (SELECT SUM(l.delta) FROM benefit_wallet_ledgers l
              WHERE l.org_id = w.org_id AND l.benefit_code = w.benefit_code), 0)
         UNION
         SELECT l.benefit_code FROM benefit_wallet_ledgers l
         WHERE l.org_id = ?1 AND NOT EXISTS (
             SELECT 1 FROM benefit_wallets w WHERE w.org_id = l.org_id AND w.benefit_code = l.benefit_code)
         GROUP BY l.benefit_code HAVING SUM(l.delta) != 0
         ORDER BY 1",
    )?;
    let codes = stmt
        .query_map(params![org_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(codes)
}

// ============ Consumption ============

pub fn insert_consumption(
    conn: &Connection,
    org_id: i64,
    benefit_code: &str,
    attempt_id: &str,
    grant_id: Option<&str>,
    order_no: Option<&str>,
) -> Result<Option<BenefitConsumption>> {
    let created = conn
        .query_row(
            &format!(
                "INSERT INTO benefit_consumptions (id, org_id, benefit_code, attempt_id, grant_id, order_no, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(org_id, benefit_code, attempt_id) DO NOTHING
                 RETURNING {}",
                CONSUMPTION_COLS
            ),
            params![
                EntityType::Consumption.gen_id(),
                org_id,
                benefit_code,
                attempt_id,
                grant_id,
                order_no,
                now()
            ],
            BenefitConsumption::from_row,
        )
        .optional()?;
    Ok(created)
}

pub fn get_consumption(
    conn: &Connection,
    org_id: i64,
    benefit_code: &str,
    attempt_id: &str,
) -> Result<Option<BenefitConsumption>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM benefit_consumptions WHERE org_id = ?1 AND benefit_code = ?2 AND attempt_id = ?3",
            CONSUMPTION_COLS
        ),
        &[&org_id, &benefit_code, &attempt_id],
    )
}

// ============ Idempotency Keys ============

pub fn insert_idempotency_key(
    conn: &Connection,
    input: &RecordIdempotencyKey,
) -> Result<Option<IdempotencyKey>> {
    let now = now();
    let created = conn
        .query_row(
            &format!(
                "INSERT INTO idempotency_keys (id, provider, external_id, recorded_at, hash, batch_id, first_seen_at, last_seen_at, hit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1)
                 ON CONFLICT(provider, external_id, recorded_at) DO NOTHING
                 RETURNING {}",
                IDEMPOTENCY_KEY_COLS
            ),
            params![
                EntityType::IdempotencyKey.gen_id(),
                &input.provider,
                &input.external_id,
                input.recorded_at,
                &input.hash,
                &input.batch_id,
                now
            ],
            IdempotencyKey::from_row,
        )
        .optional()?;
    Ok(created)
}

/// Bump `hit_count`/`last_seen_at` on a key that was seen before.
pub fn touch_idempotency_key(
    conn: &Connection,
    provider: &str,
    external_id: &str,
    recorded_at: i64,
) -> Result<Option<IdempotencyKey>> {
    let touched = conn
        .query_row(
            &format!(
                "UPDATE idempotency_keys SET hit_count = hit_count + 1, last_seen_at = ?1
                 WHERE provider = ?2 AND external_id = ?3 AND recorded_at = ?4
                 RETURNING {}",
                IDEMPOTENCY_KEY_COLS
            ),
            params![now(), provider, external_id, recorded_at],
            IdempotencyKey::from_row,
        )
        .optional()?;
    Ok(touched)
}

pub fn get_idempotency_key(
    conn: &Connection,
    provider: &str,
    external_id: &str,
    recorded_at: i64,
) -> Result<Option<IdempotencyKey>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM idempotency_keys WHERE provider = ?1 AND external_id = ?2 AND recorded_at = ?3",
            IDEMPOTENCY_KEY_COLS
        ),
        &[&provider, &external_id, &recorded_at],
    )
}

// ============ Reconciliation ============

pub fn count_paid_orders(conn: &Connection, org_id: i64, from: i64, to: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM orders
         WHERE org_id = ?1 AND status IN ('paid', 'fulfilled', 'refunded')
           AND paid_at >= ?2 AND paid_at < ?3",
        params![org_id, from, to],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Order numbers paid in the window that hold no active grant.
pub fn list_paid_without_benefit(conn: &Connection, org_id: i64, from: i64, to: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT o.order_no FROM orders o
         WHERE o.org_id = ?1 AND o.status IN ('paid', 'fulfilled')
           AND o.paid_at >= ?2 AND o.paid_at < ?3
           AND NOT EXISTS (
               SELECT 1 FROM benefit_grants g WHERE g.source_order_id = o.id AND g.status = 'active')
         ORDER BY o.paid_at, o.order_no",
    )?;
    let order_nos = stmt
        .query_map(params![org_id, from, to], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(order_nos)
}

/// Attempt-scoped grants created in the window whose attempt never consumed the benefit.
pub fn list_benefit_without_report(
    conn: &Connection,
    org_id: i64,
    from: i64,
    to: i64,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT g.id FROM benefit_grants g
         WHERE g.org_id = ?1 AND g.status = 'active' AND g.scope = 'attempt'
           AND g.created_at >= ?2 AND g.created_at < ?3
           AND NOT EXISTS (
               SELECT 1 FROM benefit_consumptions c
               WHERE c.org_id = g.org_id AND c.benefit_code = g.benefit_code AND c.attempt_id = g.attempt_id)
         ORDER BY g.created_at, g.id",
    )?;
    let ids = stmt
        .query_map(params![org_id, from, to], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

pub fn sum_duplicate_deliveries(conn: &Connection, org_id: i64, from: i64, to: i64) -> Result<i64> {
    let sum = conn.query_row(
        "SELECT COALESCE(SUM(duplicate_count), 0) FROM payment_events
         WHERE org_id = ?1 AND received_at >= ?2 AND received_at < ?3",
        params![org_id, from, to],
        |row| row.get(0),
    )?;
    Ok(sum)
}

/// Write the snapshot for `(org_id, snapshot_date)`, replacing an earlier run of the same day.
pub fn upsert_snapshot(conn: &Connection, snapshot: &ReconcileSnapshot) -> Result<ReconcileSnapshot> {
    let meta_json = snapshot.meta.as_ref().map(|m| m.to_string());
    let stored = conn.query_row(
        &format!(
            "INSERT INTO payment_reconcile_snapshots (id, org_id, snapshot_date, paid_orders_count, paid_without_benefit_count, benefit_without_report_count, webhook_replay_count, ledger_drift_count, meta_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(org_id, snapshot_date) DO UPDATE SET
                 paid_orders_count = excluded.paid_orders_count,
                 paid_without_benefit_count = excluded.paid_without_benefit_count,
                 benefit_without_report_count = excluded.benefit_without_report_count,
                 webhook_replay_count = excluded.webhook_replay_count,
                 ledger_drift_count = excluded.ledger_drift_count,
                 meta_json = excluded.meta_json,
                 created_at = excluded.created_at
             RETURNING {}",
            SNAPSHOT_COLS
        ),
        params![
            &snapshot.id,
            snapshot.org_id,
            &snapshot.snapshot_date,
            snapshot.paid_orders_count,
            snapshot.paid_without_benefit_count,
            snapshot.benefit_without_report_count,
            snapshot.webhook_replay_count,
            snapshot.ledger_drift_count,
            meta_json,
            snapshot.created_at
        ],
        ReconcileSnapshot::from_row,
    )?;
    Ok(stored)
}

pub fn list_snapshots(conn: &Connection, org_id: i64, limit: i64) -> Result<Vec<ReconcileSnapshot>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_reconcile_snapshots WHERE org_id = ?1
             ORDER BY snapshot_date DESC LIMIT ?2",
            SNAPSHOT_COLS
        ),
        &[&org_id, &limit],
    )
}

// ============ Audit Logs ============

#[allow(clippy::too_many_arguments)]
pub fn create_audit_log(
    conn: &Connection,
    actor_type: ActorType,
    actor_id: Option<&str>,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    details: Option<&serde_json::Value>,
    org_id: Option<i64>,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> Result<AuditLog> {
    let log = AuditLog {
        id: EntityType::AuditLog.gen_id(),
        timestamp: now(),
        actor_type,
        actor_id: actor_id.map(String::from),
        action: action.to_string(),
        resource_type: resource_type.to_string(),
        resource_id: resource_id.to_string(),
        details: details.cloned(),
        org_id,
        ip_address: ip_address.map(String::from),
        user_agent: user_agent.map(String::from),
    };

    conn.execute(
        &format!(
            "INSERT INTO audit_logs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            AUDIT_LOG_COLS
        ),
        params![
            &log.id,
            log.timestamp,
            log.actor_type.as_ref(),
            &log.actor_id,
            &log.action,
            &log.resource_type,
            &log.resource_id,
            details.map(|d| d.to_string()),
            log.org_id,
            &log.ip_address,
            &log.user_agent
        ],
    )?;

    Ok(log)
}

pub fn query_audit_logs(conn: &Connection, query: &AuditLogQuery) -> Result<(Vec<AuditLog>, i64)> {
    let mut where_clause = String::from("WHERE 1=1");
    let mut filter_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(v) = query.actor_type {
        where_clause.push_str(" AND actor_type = ?");
        filter_params.push(Box::new(v.as_ref().to_string()));
    }
    if let Some(ref v) = query.action {
        where_clause.push_str(" AND action = ?");
        filter_params.push(Box::new(v.clone()));
    }
    if let Some(ref v) = query.resource_type {
        where_clause.push_str(" AND resource_type = ?");
        filter_params.push(Box::new(v.clone()));
    }
    if let Some(ref v) = query.resource_id {
        where_clause.push_str(" AND resource_id = ?");
        filter_params.push(Box::new(v.clone()));
    }
    if let Some(v) = query.org_id {
        where_clause.push_str(" AND org_id = ?");
        filter_params.push(Box::new(v));
    }
    if let Some(v) = query.from_timestamp {
        where_clause.push_str(" AND timestamp >= ?");
        filter_params.push(Box::new(v));
    }
    if let Some(v) = query.to_timestamp {
        where_clause.push_str(" AND timestamp <= ?");
        filter_params.push(Box::new(v));
    }

    let filter_refs: Vec<&dyn rusqlite::ToSql> = filter_params.iter().map(|b| b.as_ref()).collect();
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM audit_logs {}", where_clause),
        filter_refs.as_slice(),
        |row| row.get(0),
    )?;

    let PageWindow { limit, offset } = query.window();
    let mut select_refs = filter_refs;
    select_refs.push(&limit);
    select_refs.push(&offset);

    let logs = query_all(
        conn,
        &format!(
            "SELECT {} FROM audit_logs {} ORDER BY timestamp DESC, id LIMIT ? OFFSET ?",
            AUDIT_LOG_COLS, where_clause
        ),
        select_refs.as_slice(),
    )?;

    Ok((logs, total))
}

/// Purge audit rows older than the retention window. Returns the number deleted.
pub fn purge_old_audit_logs(conn: &Connection, retention_days: i64) -> Result<usize> {
    let cutoff = now() - (retention_days * 86400);
    let deleted = conn.execute(
        "DELETE FROM audit_logs WHERE timestamp < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
