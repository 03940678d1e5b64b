//! Exactly-once guarantees under concurrent writers.
//!
//! Each thread opens its own connection to a shared file database and waits
//! on a barrier so the calls overlap.

#[path = "../common/mod.rs"]
mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use serde_json::json;

const THREADS: usize = 8;

fn run_concurrently<T, F>(path: &str, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&mut Connection, usize) -> T + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(THREADS));
    let f = Arc::new(f);
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let f = Arc::clone(&f);
            let path = path.to_string();
            thread::spawn(move || {
                let mut conn = open_thread_conn(&path);
                barrier.wait();
                f(&mut conn, i)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_concurrent_processing_fulfills_once() {
    let (_dir, path) = setup_file_db();
    let conn = open_thread_conn(&path);
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    let intake = ingest(&conn, "stub", &stub_payload("evt_1", &order.order_no, "paid", 1000), Some(""));

    let event_id = intake.event_id.clone();
    let outcomes = run_concurrently(&path, move |conn, _| {
        test_processor()
            .process(conn, &event_id)
            .expect("processing should not error")
    });

    let handled = outcomes.iter().filter(|o| o.is_handled()).count();
    let skipped = outcomes
        .iter()
        .filter(|o| **o == ProcessOutcome::Skipped)
        .count();
    assert_eq!(handled, 1, "exactly one processor wins the claim");
    assert_eq!(skipped, THREADS - 1);

    assert_eq!(balance(&conn, 0, CREDIT_CODE), 10);
    assert_eq!(ledger_sum(&conn, 0, CREDIT_CODE), 10);
    assert_eq!(queries::list_grants_for_order(&conn, &order.id).unwrap().len(), 1);
    assert_eq!(get_event(&conn, &intake.event_id).attempts, 1);
}

#[test]
fn test_concurrent_deliveries_record_one_event() {
    let (_dir, path) = setup_file_db();
    let conn = open_thread_conn(&path);
    seed_catalog(&conn, 0);
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    let body = stub_payload("evt_burst", &order.order_no, "paid", 1000);

    let outcomes = run_concurrently(&path, move |conn, _| {
        let (intake, processed) = deliver_stub(conn, &body);
        (intake, processed)
    });

    let event_ids: std::collections::HashSet<_> =
        outcomes.iter().map(|(intake, _)| intake.event_id.clone()).collect();
    assert_eq!(event_ids.len(), 1, "one row per provider event id");
    assert_eq!(outcomes.iter().filter(|(intake, _)| !intake.duplicate).count(), 1);

    let event_id = event_ids.into_iter().next().unwrap();
    assert_eq!(get_event(&conn, &event_id).duplicate_count, (THREADS - 1) as i64);
    assert_eq!(balance(&conn, 0, CREDIT_CODE), 10, "credited once");
}

#[test]
fn test_concurrent_order_creation_with_same_key() {
    let (_dir, path) = setup_file_db();
    let conn = open_thread_conn(&path);
    seed_catalog(&conn, 0);

    let outcomes = run_concurrently(&path, |conn, _| {
        commerce::orders::create_order(
            conn,
            &test_providers(),
            &AuditTrail::disabled(),
            &Actor::collaborator("test"),
            &order_input(0, "stub", CREDIT_SKU, 1, "shared-key"),
        )
        .expect("create should succeed")
    });

    assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
    let order_nos: std::collections::HashSet<_> =
        outcomes.iter().map(|o| o.order.order_no.clone()).collect();
    assert_eq!(order_nos.len(), 1, "every caller sees the same order");
}

#[test]
fn test_concurrent_consumption_never_overdraws() {
    let (_dir, path) = setup_file_db();
    let mut conn = open_thread_conn(&path);
    commerce::wallet::manual_adjustment(
        &mut conn,
        &AuditTrail::disabled(),
        &Actor::operator(None),
        &commerce::ManualAdjustment {
            org_id: 1,
            benefit_code: CREDIT_CODE.into(),
            delta: 3,
            reason: "seed".into(),
            idempotency_key: "seed".into(),
            meta: None,
        },
    )
    .unwrap();

    let results = run_concurrently(&path, |conn, i| {
        commerce::consumption::consume_and_debit(
            conn,
            &AuditTrail::disabled(),
            &Actor::collaborator("report-service"),
            1,
            CREDIT_CODE,
            &format!("attempt-{}", i),
        )
    });

    let consumed = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::PaymentRequired(_))))
        .count();
    assert_eq!(consumed, 3, "one consumption per credit");
    assert_eq!(refused, THREADS - 3);
    assert_eq!(balance(&conn, 1, CREDIT_CODE), 0);
    assert_eq!(ledger_sum(&conn, 1, CREDIT_CODE), 0);
}

#[test]
fn test_concurrent_consumption_of_same_attempt_debits_once() {
    let (_dir, path) = setup_file_db();
    let mut conn = open_thread_conn(&path);
    commerce::wallet::manual_adjustment(
        &mut conn,
        &AuditTrail::disabled(),
        &Actor::operator(None),
        &commerce::ManualAdjustment {
            org_id: 1,
            benefit_code: CREDIT_CODE.into(),
            delta: 5,
            reason: "seed".into(),
            idempotency_key: "seed".into(),
            meta: None,
        },
    )
    .unwrap();

    let results = run_concurrently(&path, |conn, _| {
        commerce::consumption::consume_and_debit(
            conn,
            &AuditTrail::disabled(),
            &Actor::collaborator("report-service"),
            1,
            CREDIT_CODE,
            "attempt-1",
        )
        .expect("consume should succeed")
    });

    assert_eq!(results.iter().filter(|r| r.consumed).count(), 1);
    assert_eq!(balance(&conn, 1, CREDIT_CODE), 4);
}

#[test]
fn test_paid_and_refund_race_never_leaves_entitlements() {
    const ROUNDS: usize = 100;
    let (_dir, path) = setup_file_db();
    let conn = open_thread_conn(&path);
    seed_catalog(&conn, 0);

    for round in 0..ROUNDS {
        let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, &format!("race-{}", round));
        let paid = ingest(
            &conn,
            "stub",
            &stub_payload(&format!("evt_paid_{}", round), &order.order_no, "paid", 1000),
            Some(""),
        );
        let refund = ingest(
            &conn,
            "stub",
            &stub_payload_with(&format!("evt_refund_{}", round), &order.order_no, "refund", json!({})),
            Some(""),
        );
        conn.execute("UPDATE orders SET status = 'paid' WHERE id = ?1", [&order.id])
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [paid.event_id, refund.event_id]
            .into_iter()
            .map(|event_id| {
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    let mut conn = open_thread_conn(&path);
                    barrier.wait();
                    test_processor()
                        .process(&mut conn, &event_id)
                        .expect("processing should not error")
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(get_order(&conn, &order.order_no).status, OrderStatus::Refunded);
        let active = queries::list_grants_for_order(&conn, &order.id)
            .unwrap()
            .into_iter()
            .filter(|g| g.status == GrantStatus::Active)
            .count();
        assert_eq!(active, 0, "round {}: refunded order kept an active grant", round);
        assert_eq!(balance(&conn, 0, CREDIT_CODE), 0, "round {}: credits survived the refund", round);
    }
    assert_eq!(ledger_sum(&conn, 0, CREDIT_CODE), 0);
}

#[test]
fn test_concurrent_consume_of_same_attempt_records_once() {
    let (_dir, path) = setup_file_db();
    let conn = open_thread_conn(&path);

    let results = run_concurrently(&path, |conn, _| {
        commerce::consumption::consume(
            conn,
            &AuditTrail::disabled(),
            &Actor::collaborator("report-service"),
            5,
            UNLOCK_CODE,
            "A1",
        )
        .expect("consume should succeed")
    });

    assert_eq!(results.iter().filter(|r| r.consumed).count(), 1);
    let rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM benefit_consumptions WHERE org_id = 5 AND attempt_id = 'A1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rows, 1);
}
