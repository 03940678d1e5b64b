//! Daily reconciliation snapshots

#[path = "../common/mod.rs"]
mod common;

use chrono::{NaiveDate, Utc};
use common::*;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn run(conn: &Connection, org_id: i64) -> ReconcileSnapshot {
    commerce::reconcile::reconcile(
        conn,
        &AuditTrail::disabled(),
        &Actor::system("test"),
        org_id,
        today(),
    )
    .expect("reconcile failed")
}

#[test]
fn test_clean_day_has_no_drift() {
    let mut conn = setup_test_db();
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    deliver_stub(&mut conn, &stub_payload("evt_1", &order.order_no, "paid", 1000));

    let snapshot = run(&conn, 0);

    assert_eq!(snapshot.snapshot_date, today().format("%Y-%m-%d").to_string());
    assert_eq!(snapshot.paid_orders_count, 1);
    assert_eq!(snapshot.paid_without_benefit_count, 0);
    assert_eq!(snapshot.ledger_drift_count, 0);
    assert_eq!(snapshot.webhook_replay_count, 0);
}

#[test]
fn test_counts_replays_and_unconsumed_unlocks() {
    let mut conn = setup_test_db();
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 0, "stub", UNLOCK_SKU, 1, "k");
    let body = stub_payload("evt_1", &order.order_no, "paid", 1990);
    deliver_stub(&mut conn, &body);
    deliver_stub(&mut conn, &body);
    deliver_stub(&mut conn, &body);

    let snapshot = run(&conn, 0);

    assert_eq!(snapshot.webhook_replay_count, 2);
    assert_eq!(snapshot.benefit_without_report_count, 1, "unlock granted but report not produced");

    commerce::consumption::consume(
        &conn,
        &AuditTrail::disabled(),
        &Actor::collaborator("report-service"),
        0,
        UNLOCK_CODE,
        "attempt-1",
    )
    .unwrap();
    assert_eq!(run(&conn, 0).benefit_without_report_count, 0);
}

#[test]
fn test_paid_order_without_grant_is_flagged() {
    let mut conn = setup_test_db();
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    conn.execute("UPDATE skus SET is_active = 0", []).unwrap();
    deliver_stub(&mut conn, &stub_payload("evt_1", &order.order_no, "paid", 1000));
    assert_eq!(get_order(&conn, &order.order_no).status, OrderStatus::Paid);

    let snapshot = run(&conn, 0);

    assert_eq!(snapshot.paid_orders_count, 1);
    assert_eq!(snapshot.paid_without_benefit_count, 1);
    let meta = snapshot.meta.expect("meta");
    assert_eq!(meta["paid_without_benefit"][0], order.order_no.as_str());
}

#[test]
fn test_wallet_drift_is_flagged() {
    let mut conn = setup_test_db();
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    deliver_stub(&mut conn, &stub_payload("evt_1", &order.order_no, "paid", 1000));
    conn.execute(
        "UPDATE benefit_wallets SET balance = balance + 5 WHERE benefit_code = ?1",
        [CREDIT_CODE],
    )
    .unwrap();

    let snapshot = run(&conn, 0);

    assert_eq!(snapshot.ledger_drift_count, 1);
    assert_eq!(snapshot.meta.expect("meta")["drifted_wallets"][0], CREDIT_CODE);
}

#[test]
fn test_rerun_replaces_snapshot_for_the_day() {
    let mut conn = setup_test_db();
    seed_catalog(&conn, 0);

    let first = run(&conn, 0);
    assert_eq!(first.paid_orders_count, 0);

    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    deliver_stub(&mut conn, &stub_payload("evt_1", &order.order_no, "paid", 1000));
    let second = run(&conn, 0);

    assert_eq!(second.id, first.id, "one snapshot row per org and day");
    assert_eq!(second.paid_orders_count, 1);
    assert_eq!(queries::list_snapshots(&conn, 0, 30).unwrap().len(), 1);
}

#[test]
fn test_snapshots_are_per_org() {
    let mut conn = setup_test_db();
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 4, "stub", CREDIT_SKU, 1, "k");
    deliver_stub(&mut conn, &stub_payload("evt_1", &order.order_no, "paid", 1000));

    assert_eq!(run(&conn, 4).paid_orders_count, 1);
    assert_eq!(run(&conn, 0).paid_orders_count, 0);
}

#[test]
fn test_other_days_are_excluded() {
    let mut conn = setup_test_db();
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    deliver_stub(&mut conn, &stub_payload("evt_1", &order.order_no, "paid", 1000));

    let yesterday = today().pred_opt().unwrap();
    let snapshot = commerce::reconcile::reconcile(
        &conn,
        &AuditTrail::disabled(),
        &Actor::system("test"),
        0,
        yesterday,
    )
    .unwrap();

    assert_eq!(snapshot.paid_orders_count, 0);
    assert_eq!(snapshot.snapshot_date, yesterday.format("%Y-%m-%d").to_string());
}
