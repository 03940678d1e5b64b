//! Row mapping trait and helpers for reducing boilerplate in queries.
//!
//! Models implement `FromRow` against the column order of their `*_COLS`
//! constant, so every SELECT uses the constant instead of spelling columns out.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use serde::de::DeserializeOwned;

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors.
///
/// A corrupt status value surfaces as a query error instead of a panic.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Parse an optional JSON text column.
fn parse_json<T: DeserializeOwned>(row: &Row, col: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(col)? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                col,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
        None => Ok(None),
    }
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const SKU_COLS: &str = "org_id, sku, kind, unit_qty, benefit_code, scope, price_cents, currency, is_active, meta_json, created_at, updated_at";

pub const ORDER_COLS: &str = "id, order_no, org_id, user_id, anon_id, sku, quantity, target_attempt_id, amount_cents, currency, status, provider, provider_order_id, idempotency_key, paid_at, fulfilled_at, refunded_at, refund_amount_cents, refund_reason, created_at, updated_at";

pub const PAYMENT_EVENT_COLS: &str = "id, org_id, provider, provider_event_id, order_no, event_type, payload_json, payload_sha256, payload_size_bytes, payload_excerpt, normalized_json, signature_ok, status, attempts, duplicate_count, last_duplicate_at, last_error_code, last_error_message, request_id, ip_address, user_agent, received_at, processed_at, handled_at, next_attempt_at, escalated_at";

pub const GRANT_COLS: &str = "id, org_id, user_id, benefit_ref, benefit_code, benefit_type, scope, attempt_id, status, source_order_id, source_event_id, expires_at, revoked_at, revoke_reason, created_at, updated_at";

pub const WALLET_COLS: &str = "org_id, benefit_code, balance, created_at, updated_at";

pub const LEDGER_COLS: &str =
    "id, org_id, benefit_code, delta, reason, order_no, attempt_id, idempotency_key, meta_json, created_at";

pub const CONSUMPTION_COLS: &str =
    "id, org_id, benefit_code, attempt_id, grant_id, order_no, created_at";

pub const IDEMPOTENCY_KEY_COLS: &str =
    "id, provider, external_id, recorded_at, hash, batch_id, first_seen_at, last_seen_at, hit_count";

pub const SNAPSHOT_COLS: &str = "id, org_id, snapshot_date, paid_orders_count, paid_without_benefit_count, benefit_without_report_count, webhook_replay_count, ledger_drift_count, meta_json, created_at";

pub const AUDIT_LOG_COLS: &str = "id, timestamp, actor_type, actor_id, action, resource_type, resource_id, details, org_id, ip_address, user_agent";

// ============ FromRow Implementations ============

impl FromRow for Sku {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Sku {
            org_id: row.get(0)?,
            sku: row.get(1)?,
            kind: parse_enum(row, 2, "kind")?,
            unit_qty: row.get(3)?,
            benefit_code: row.get(4)?,
            scope: parse_enum(row, 5, "scope")?,
            price_cents: row.get(6)?,
            currency: row.get(7)?,
            is_active: row.get::<_, i32>(8)? != 0,
            meta: parse_json(row, 9)?.unwrap_or_default(),
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl FromRow for Order {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get(0)?,
            order_no: row.get(1)?,
            org_id: row.get(2)?,
            user_id: row.get(3)?,
            anon_id: row.get(4)?,
            sku: row.get(5)?,
            quantity: row.get(6)?,
            target_attempt_id: row.get(7)?,
            amount_cents: row.get(8)?,
            currency: row.get(9)?,
            status: parse_enum(row, 10, "status")?,
            provider: row.get(11)?,
            provider_order_id: row.get(12)?,
            idempotency_key: row.get(13)?,
            paid_at: row.get(14)?,
            fulfilled_at: row.get(15)?,
            refunded_at: row.get(16)?,
            refund_amount_cents: row.get(17)?,
            refund_reason: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }
}

impl FromRow for PaymentEvent {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PaymentEvent {
            id: row.get(0)?,
            org_id: row.get(1)?,
            provider: row.get(2)?,
            provider_event_id: row.get(3)?,
            order_no: row.get(4)?,
            event_type: row.get(5)?,
            payload_json: row.get(6)?,
            payload_sha256: row.get(7)?,
            payload_size_bytes: row.get(8)?,
            payload_excerpt: row.get(9)?,
            normalized: parse_json(row, 10)?,
            signature_ok: row.get::<_, i32>(11)? != 0,
            status: parse_enum(row, 12, "status")?,
            attempts: row.get(13)?,
            duplicate_count: row.get(14)?,
            last_duplicate_at: row.get(15)?,
            last_error_code: row.get(16)?,
            last_error_message: row.get(17)?,
            request_id: row.get(18)?,
            ip_address: row.get(19)?,
            user_agent: row.get(20)?,
            received_at: row.get(21)?,
            processed_at: row.get(22)?,
            handled_at: row.get(23)?,
            next_attempt_at: row.get(24)?,
            escalated_at: row.get(25)?,
        })
    }
}

impl FromRow for BenefitGrant {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(BenefitGrant {
            id: row.get(0)?,
            org_id: row.get(1)?,
            user_id: row.get(2)?,
            benefit_ref: row.get(3)?,
            benefit_code: row.get(4)?,
            benefit_type: row.get(5)?,
            scope: parse_enum(row, 6, "scope")?,
            attempt_id: row.get(7)?,
            status: parse_enum(row, 8, "status")?,
            source_order_id: row.get(9)?,
            source_event_id: row.get(10)?,
            expires_at: row.get(11)?,
            revoked_at: row.get(12)?,
            revoke_reason: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }
}

impl FromRow for BenefitWallet {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(BenefitWallet {
            org_id: row.get(0)?,
            benefit_code: row.get(1)?,
            balance: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

impl FromRow for LedgerEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LedgerEntry {
            id: row.get(0)?,
            org_id: row.get(1)?,
            benefit_code: row.get(2)?,
            delta: row.get(3)?,
            reason: row.get(4)?,
            order_no: row.get(5)?,
            attempt_id: row.get(6)?,
            idempotency_key: row.get(7)?,
            meta: parse_json(row, 8)?,
            created_at: row.get(9)?,
        })
    }
}

impl FromRow for BenefitConsumption {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(BenefitConsumption {
            id: row.get(0)?,
            org_id: row.get(1)?,
            benefit_code: row.get(2)?,
            attempt_id: row.get(3)?,
            grant_id: row.get(4)?,
            order_no: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl FromRow for IdempotencyKey {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(IdempotencyKey {
            id: row.get(0)?,
            provider: row.get(1)?,
            external_id: row.get(2)?,
            recorded_at: row.get(3)?,
            hash: row.get(4)?,
            batch_id: row.get(5)?,
            first_seen_at: row.get(6)?,
            last_seen_at: row.get(7)?,
            hit_count: row.get(8)?,
        })
    }
}

impl FromRow for ReconcileSnapshot {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ReconcileSnapshot {
            id: row.get(0)?,
            org_id: row.get(1)?,
            snapshot_date: row.get(2)?,
            paid_orders_count: row.get(3)?,
            paid_without_benefit_count: row.get(4)?,
            benefit_without_report_count: row.get(5)?,
            webhook_replay_count: row.get(6)?,
            ledger_drift_count: row.get(7)?,
            meta: parse_json(row, 8)?,
            created_at: row.get(9)?,
        })
    }
}

impl FromRow for AuditLog {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(AuditLog {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            actor_type: parse_enum(row, 2, "actor_type")?,
            actor_id: row.get(3)?,
            action: row.get(4)?,
            resource_type: row.get(5)?,
            resource_id: row.get(6)?,
            details: parse_json(row, 7)?,
            org_id: row.get(8)?,
            ip_address: row.get(9)?,
            user_agent: row.get(10)?,
        })
    }
}
