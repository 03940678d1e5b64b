//! Daily drift report. Reads the ledger tables and writes one snapshot row;
//! nothing is repaired automatically.

use chrono::{Days, NaiveDate, TimeZone, Utc};
use rusqlite::Connection;
use serde_json::json;

use crate::db::queries;
use crate::error::{AppError, Result};
use crate::id::EntityType;
use crate::models::{AuditAction, ReconcileSnapshot};
use crate::util::{Actor, AuditTrail};

/// Flagged ids kept in the snapshot meta, per category.
pub const SAMPLE_LIMIT: usize = 20;

/// `[day 00:00, day+1 00:00)` in UTC, as unix seconds.
pub fn day_window(day: NaiveDate) -> Result<(i64, i64)> {
    let next = day
        .checked_add_days(Days::new(1))
        .ok_or_else(|| AppError::BadRequest("day out of range".into()))?;
    let start = Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN));
    let end = Utc.from_utc_datetime(&next.and_time(chrono::NaiveTime::MIN));
    Ok((start.timestamp(), end.timestamp()))
}

pub fn reconcile(
    conn: &Connection,
    audit: &AuditTrail,
    actor: &Actor,
    org_id: i64,
    day: NaiveDate,
) -> Result<ReconcileSnapshot> {
    let (from, to) = day_window(day)?;

    let paid_orders_count = queries::count_paid_orders(conn, org_id, from, to)?;
    let paid_without_benefit = queries::list_paid_without_benefit(conn, org_id, from, to)?;
    let benefit_without_report = queries::list_benefit_without_report(conn, org_id, from, to)?;
    let webhook_replay_count = queries::sum_duplicate_deliveries(conn, org_id, from, to)?;
    let drifted_wallets = queries::list_drifted_wallets(conn, org_id)?;

    let sample = |ids: &[String]| ids.iter().take(SAMPLE_LIMIT).cloned().collect::<Vec<_>>();
    let snapshot = ReconcileSnapshot {
        id: EntityType::ReconcileSnapshot.gen_id(),
        org_id,
        snapshot_date: day.format("%Y-%m-%d").to_string(),
        paid_orders_count,
        paid_without_benefit_count: paid_without_benefit.len() as i64,
        benefit_without_report_count: benefit_without_report.len() as i64,
        webhook_replay_count,
        ledger_drift_count: drifted_wallets.len() as i64,
        meta: Some(json!({
            "window": { "from": from, "to": to },
            "paid_without_benefit": sample(&paid_without_benefit),
            "benefit_without_report": sample(&benefit_without_report),
            "drifted_wallets": sample(&drifted_wallets),
        })),
        created_at: queries::now(),
    };
    let stored = queries::upsert_snapshot(conn, &snapshot)?;

    if stored.paid_without_benefit_count > 0 || stored.ledger_drift_count > 0 {
        tracing::warn!(
            org_id,
            day = %stored.snapshot_date,
            paid_without_benefit = stored.paid_without_benefit_count,
            ledger_drift = stored.ledger_drift_count,
            "Reconciliation found drift"
        );
    } else {
        tracing::info!(
            org_id,
            day = %stored.snapshot_date,
            paid_orders = stored.paid_orders_count,
            benefit_without_report = stored.benefit_without_report_count,
            webhook_replays = stored.webhook_replay_count,
            "Reconciliation complete"
        );
    }

    audit
        .entry(actor)
        .action(AuditAction::ReconcileDay)
        .resource("reconcile_snapshot", &stored.id)
        .details(json!({
            "day": stored.snapshot_date,
            "paid_orders_count": stored.paid_orders_count,
            "paid_without_benefit_count": stored.paid_without_benefit_count,
            "benefit_without_report_count": stored.benefit_without_report_count,
            "webhook_replay_count": stored.webhook_replay_count,
            "ledger_drift_count": stored.ledger_drift_count,
        }))
        .org(org_id)
        .record();

    Ok(stored)
}
