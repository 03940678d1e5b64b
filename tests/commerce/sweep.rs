//! Retry sweep, escalation and operator reprocessing

#[path = "../common/mod.rs"]
mod common;

use commerce::SweepReport;
use common::*;

fn setup() -> Connection {
    let conn = setup_test_db();
    seed_catalog(&conn, 0);
    conn
}

fn sweep(conn: &mut Connection) -> SweepReport {
    test_processor().sweep(conn).expect("sweep failed")
}

/// Failed event for an order that does not exist yet.
fn orphan_event(conn: &mut Connection, order_no: &str) -> String {
    let (intake, _) = deliver_stub(conn, &stub_payload("evt_orphan", order_no, "payment_succeeded", 1000));
    intake.event_id
}

#[test]
fn test_sweep_retries_until_escalation() {
    let mut conn = setup();
    let event_id = orphan_event(&mut conn, "ORD-LATE");

    let second = sweep(&mut conn);
    assert_eq!(second.picked, 1);
    assert_eq!(second.failed, 1);
    assert_eq!(second.escalated, 0);

    let third = sweep(&mut conn);
    assert_eq!(third.escalated, 1);

    let event = get_event(&conn, &event_id);
    assert_eq!(event.attempts, 3);
    assert_eq!(event.last_error_code.as_deref(), Some("MAX_RETRIES_EXCEEDED"));
    assert!(event.escalated_at.is_some());

    assert_eq!(sweep(&mut conn), SweepReport::default(), "escalated events wait for an operator");
}

#[test]
fn test_failed_and_escalated_queues() {
    let mut conn = setup();
    let event_id = orphan_event(&mut conn, "ORD-LATE");

    let (failed, total) = queries::list_failed_events_paginated(&conn, None, 50, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(failed[0].id, event_id);
    let (_, escalated) = queries::list_escalated_events_paginated(&conn, None, 50, 0).unwrap();
    assert_eq!(escalated, 0);

    sweep(&mut conn);
    sweep(&mut conn);

    let (_, failed) = queries::list_failed_events_paginated(&conn, None, 50, 0).unwrap();
    assert_eq!(failed, 0, "escalated events leave the retry queue");
    let (escalated, total) = queries::list_escalated_events_paginated(&conn, Some(0), 50, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(escalated[0].id, event_id);

    let (_, other_org) = queries::list_escalated_events_paginated(&conn, Some(9), 50, 0).unwrap();
    assert_eq!(other_org, 0);
}

#[test]
fn test_reprocess_escalated_event_keeps_attempt_count() {
    let mut conn = setup();
    let event_id = orphan_event(&mut conn, "ORD-LATE");
    sweep(&mut conn);
    sweep(&mut conn);

    // The order turns up under the referenced number
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    conn.execute(
        "UPDATE orders SET order_no = 'ORD-LATE' WHERE id = ?1",
        [&order.id],
    )
    .unwrap();

    let outcome = test_processor()
        .reprocess(&mut conn, &Actor::operator(Some("op-1")), &event_id)
        .unwrap();

    assert!(outcome.is_handled(), "got {:?}", outcome);
    let event = get_event(&conn, &event_id);
    assert_eq!(event.status, PaymentEventStatus::Handled);
    assert_eq!(event.attempts, 4, "reprocessing does not reset the counter");
    assert!(event.escalated_at.is_none());
    assert_eq!(balance(&conn, 0, CREDIT_CODE), 10);
}

#[test]
fn test_reprocess_rejects_handled_and_unknown_events() {
    let mut conn = setup();
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    let (intake, _) = deliver_stub(&mut conn, &stub_payload("evt_1", &order.order_no, "paid", 1000));
    let processor = test_processor();
    let actor = Actor::operator(None);

    let err = processor.reprocess(&mut conn, &actor, &intake.event_id).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "got {:?}", err);

    let err = processor.reprocess(&mut conn, &actor, "evt_missing").unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {:?}", err);
}

#[test]
fn test_sweep_recovers_stuck_processing() {
    let mut conn = setup();
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    let intake = ingest(&conn, "stub", &stub_payload("evt_1", &order.order_no, "paid", 1000), Some(""));
    let long_ago = chrono::Utc::now().timestamp() - 3600;
    conn.execute(
        "UPDATE payment_events SET status = 'processing', attempts = 1, processed_at = ?1 WHERE id = ?2",
        rusqlite::params![long_ago, intake.event_id],
    )
    .unwrap();

    let report = sweep(&mut conn);

    assert_eq!(report.reset_stuck, 1);
    assert_eq!(report.handled, 1);
    assert_eq!(get_order(&conn, &order.order_no).status, OrderStatus::Fulfilled);
    assert_eq!(get_event(&conn, &intake.event_id).attempts, 2);
}

#[test]
fn test_recent_processing_is_left_alone() {
    let mut conn = setup();
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    let intake = ingest(&conn, "stub", &stub_payload("evt_1", &order.order_no, "paid", 1000), Some(""));
    conn.execute(
        "UPDATE payment_events SET status = 'processing', processed_at = ?1 WHERE id = ?2",
        rusqlite::params![chrono::Utc::now().timestamp(), intake.event_id],
    )
    .unwrap();

    let report = sweep(&mut conn);

    assert_eq!(report.reset_stuck, 0);
    assert_eq!(get_event(&conn, &intake.event_id).status, PaymentEventStatus::Processing);
}

#[test]
fn test_sweep_picks_up_unprocessed_received_events() {
    let mut conn = setup();
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    let old = ingest(&conn, "stub", &stub_payload("evt_old", &order.order_no, "paid", 1000), Some(""));
    let other = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k2");
    let fresh = ingest(&conn, "stub", &stub_payload("evt_new", &other.order_no, "paid", 1000), Some(""));
    conn.execute(
        "UPDATE payment_events SET received_at = received_at - 600 WHERE id = ?1",
        [&old.event_id],
    )
    .unwrap();

    let report = sweep(&mut conn);

    assert_eq!(report.picked, 1, "only events past the grace period");
    assert_eq!(report.handled, 1);
    assert_eq!(get_event(&conn, &old.event_id).status, PaymentEventStatus::Handled);
    assert_eq!(get_event(&conn, &fresh.event_id).status, PaymentEventStatus::Received);
}

#[test]
fn test_sweep_respects_backoff() {
    let mut conn = setup();
    let event_id = orphan_event(&mut conn, "ORD-LATE");
    let later = chrono::Utc::now().timestamp() + 3600;
    conn.execute(
        "UPDATE payment_events SET next_attempt_at = ?1 WHERE id = ?2",
        rusqlite::params![later, event_id],
    )
    .unwrap();

    assert_eq!(sweep(&mut conn).picked, 0, "not due yet");
}
