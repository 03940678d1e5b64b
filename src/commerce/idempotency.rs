//! Generic ingestion dedup: one row per `(provider, external_id, recorded_at)`.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;

use crate::db::queries;
use crate::error::{AppError, Result};
use crate::models::RecordIdempotencyKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Inserted,
    /// Seen before. `hash_mismatch` means the same identity arrived with a
    /// different payload.
    Existing {
        hash_mismatch: bool,
        first_seen_at: i64,
        hit_count: i64,
    },
}

impl RecordOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, RecordOutcome::Inserted)
    }
}

fn validate(input: &RecordIdempotencyKey) -> Result<()> {
    if input.provider.trim().is_empty() || input.external_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "provider and external_id are required".into(),
        ));
    }
    Ok(())
}

/// Record a key once. Works on a plain connection or inside a transaction.
pub fn record(conn: &Connection, input: &RecordIdempotencyKey) -> Result<RecordOutcome> {
    validate(input)?;

    if queries::insert_idempotency_key(conn, input)?.is_some() {
        return Ok(RecordOutcome::Inserted);
    }

    let existing = queries::touch_idempotency_key(
        conn,
        &input.provider,
        &input.external_id,
        input.recorded_at,
    )?
    .ok_or_else(|| AppError::Internal("idempotency key vanished after conflict".into()))?;

    let hash_mismatch = existing.hash != input.hash;
    if hash_mismatch {
        tracing::warn!(
            provider = %input.provider,
            external_id = %input.external_id,
            "Idempotency key replayed with a different payload hash"
        );
    } else {
        tracing::debug!(
            provider = %input.provider,
            external_id = %input.external_id,
            hit_count = existing.hit_count,
            "Idempotency key replay absorbed"
        );
    }

    Ok(RecordOutcome::Existing {
        hash_mismatch,
        first_seen_at: existing.first_seen_at,
        hit_count: existing.hit_count,
    })
}

/// Record many keys in one transaction. Returns how many were new.
pub fn record_batch(conn: &mut Connection, inputs: &[RecordIdempotencyKey]) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut inserted = 0;
    for input in inputs {
        if record(&tx, input)?.is_new() {
            inserted += 1;
        }
    }
    tx.commit()?;
    Ok(inserted)
}
