//! Rows with values outside their enum or JSON shape must surface as errors,
//! never as panics. CHECK constraints are switched off to plant them.

#[path = "../common/mod.rs"]
mod common;

use common::*;

fn corruptible_db() -> Connection {
    let conn = setup_test_db();
    conn.execute_batch("PRAGMA ignore_check_constraints = ON;")
        .expect("pragma");
    seed_catalog(&conn, 0);
    conn
}

#[test]
fn test_unknown_order_status_is_an_error() {
    let conn = corruptible_db();
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    conn.execute("UPDATE orders SET status = 'shipped' WHERE id = ?1", [&order.id])
        .unwrap();

    let result = queries::get_order_by_no(&conn, &order.order_no);
    assert!(matches!(result, Err(AppError::Database(_))), "got {:?}", result);
}

#[test]
fn test_unknown_sku_kind_is_an_error() {
    let conn = corruptible_db();
    conn.execute("UPDATE skus SET kind = 'subscription' WHERE sku = ?1", [CREDIT_SKU])
        .unwrap();

    assert!(queries::resolve_sku(&conn, 0, CREDIT_SKU).is_err());
    assert!(queries::list_skus(&conn, 0).is_err());
    assert!(
        queries::resolve_sku(&conn, 0, UNLOCK_SKU).unwrap().is_some(),
        "healthy rows still load one by one"
    );
}

#[test]
fn test_malformed_sku_meta_is_an_error() {
    let conn = corruptible_db();
    conn.execute("UPDATE skus SET meta_json = '{not json' WHERE sku = ?1", [UNLOCK_SKU])
        .unwrap();

    assert!(queries::resolve_sku(&conn, 0, UNLOCK_SKU).is_err());
}

#[test]
fn test_corrupt_event_fails_processing_without_panicking() {
    let mut conn = corruptible_db();
    let order = create_test_order(&conn, 0, "stub", CREDIT_SKU, 1, "k");
    let intake = ingest(&conn, "stub", &stub_payload("evt_1", &order.order_no, "paid", 1000), Some(""));
    conn.execute(
        "UPDATE payment_events SET normalized_json = '[' WHERE id = ?1",
        [&intake.event_id],
    )
    .unwrap();

    assert!(queries::get_payment_event(&conn, &intake.event_id).is_err());
    assert!(test_processor().process(&mut conn, &intake.event_id).is_err());
    assert_eq!(balance(&conn, 0, CREDIT_CODE), 0);
}
