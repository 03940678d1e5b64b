//! Webhook intake: dedup, signature handling and forensic capture

#[path = "../common/mod.rs"]
mod common;

use common::*;
use serde_json::json;

fn event_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM payment_events", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_first_delivery_is_recorded_and_accepted() {
    let conn = setup_test_db();
    seed_catalog(&conn, 7);
    let order = create_test_order(&conn, 7, "stub", CREDIT_SKU, 1, "k");
    let body = stub_payload("evt_1", &order.order_no, "payment_succeeded", 1000);

    let outcome = ingest(&conn, "stub", &body, Some(""));

    assert!(outcome.accepted);
    assert!(outcome.process, "a fresh verified event should be processed");
    assert!(!outcome.duplicate);

    let event = get_event(&conn, &outcome.event_id);
    assert_eq!(event.status, PaymentEventStatus::Received);
    assert_eq!(event.org_id, 7, "event inherits the order's org");
    assert_eq!(event.provider_event_id, "evt_1");
    assert_eq!(event.order_no.as_deref(), Some(order.order_no.as_str()));
    assert_eq!(event.payload_size_bytes, body.len() as i64);
    assert_eq!(event.payload_sha256.len(), 64, "hex sha256 digest");
    assert!(event.signature_ok);
    assert_eq!(event.attempts, 0);
    let normalized = event.normalized.expect("normalized payload stored");
    assert_eq!(normalized.amount_cents, Some(1000));
    assert_eq!(normalized.currency.as_deref(), Some("USD"));
}

#[test]
fn test_unknown_order_lands_in_org_zero() {
    let conn = setup_test_db();
    let body = stub_payload("evt_1", "ORD-UNKNOWN", "payment_succeeded", 1000);

    let outcome = ingest(&conn, "stub", &body, Some(""));
    assert_eq!(get_event(&conn, &outcome.event_id).org_id, 0);
}

#[test]
fn test_duplicate_delivery_counted_not_reprocessed() {
    let conn = setup_test_db();
    let body = stub_payload("evt_dup", "ORD-1", "payment_succeeded", 1000);

    let first = ingest(&conn, "stub", &body, Some(""));
    let second = ingest(&conn, "stub", &body, Some(""));
    let third = ingest(&conn, "stub", &body, Some(""));

    assert_eq!(first.event_id, second.event_id);
    assert_eq!(first.event_id, third.event_id);
    assert!(second.duplicate && third.duplicate);
    assert!(!second.process, "duplicates never trigger processing");
    assert!(second.accepted, "duplicate of a verified event is still accepted");

    let event = get_event(&conn, &first.event_id);
    assert_eq!(event.duplicate_count, 2);
    assert!(event.last_duplicate_at.is_some());
    assert_eq!(event_count(&conn), 1);
}

#[test]
fn test_same_event_id_from_different_providers_is_distinct() {
    let conn = setup_test_db();
    let body = stub_payload("evt_shared", "ORD-1", "payment_succeeded", 1000);
    let signature = billing_intake_signature(&body, BILLING_SECRET);

    let stub = ingest(&conn, "stub", &body, Some(""));
    let billing = ingest(&conn, "billing", &body, Some(&signature));

    assert_ne!(stub.event_id, billing.event_id);
    assert!(!billing.duplicate);
    assert_eq!(event_count(&conn), 2);
}

#[test]
fn test_invalid_signature_recorded_as_rejected() {
    let conn = setup_test_db();
    let body = stub_payload("evt_forged", "ORD-1", "payment_succeeded", 1000);
    let forged = billing_intake_signature(&body, "wrong_secret");

    let outcome = ingest(&conn, "billing", &body, Some(&forged));

    assert!(!outcome.accepted);
    assert!(!outcome.process);
    let event = get_event(&conn, &outcome.event_id);
    assert_eq!(event.status, PaymentEventStatus::Rejected);
    assert!(!event.signature_ok);
    assert_eq!(event.last_error_code.as_deref(), Some("INVALID_SIGNATURE"));
}

#[test]
fn test_missing_signature_recorded_as_rejected() {
    let conn = setup_test_db();
    let body = stub_payload("evt_nosig", "ORD-1", "payment_succeeded", 1000);

    let outcome = ingest(&conn, "billing", &body, None);

    assert!(!outcome.accepted);
    assert_eq!(get_event(&conn, &outcome.event_id).status, PaymentEventStatus::Rejected);
}

#[test]
fn test_verified_delivery_upgrades_forged_first_delivery() {
    let conn = setup_test_db();
    let forged_body = stub_payload("evt_x", "ORD-ATTACKER", "payment_succeeded", 1);
    let genuine_body = stub_payload("evt_x", "ORD-1", "payment_succeeded", 1000);

    let forged = ingest(&conn, "billing", &forged_body, Some("deadbeef"));
    assert!(!forged.accepted);

    let genuine_sig = billing_intake_signature(&genuine_body, BILLING_SECRET);
    let genuine = ingest(&conn, "billing", &genuine_body, Some(&genuine_sig));

    assert_eq!(genuine.event_id, forged.event_id, "same provider event id, same row");
    assert!(genuine.accepted);
    assert!(genuine.process, "the upgraded event must be processed");

    let event = get_event(&conn, &genuine.event_id);
    assert!(event.signature_ok);
    assert_eq!(event.status, PaymentEventStatus::Received);
    assert_eq!(event.order_no.as_deref(), Some("ORD-1"), "genuine payload replaces forged one");
    assert!(event.last_error_code.is_none());
}

#[test]
fn test_forged_delivery_does_not_downgrade_verified_event() {
    let conn = setup_test_db();
    let body = stub_payload("evt_y", "ORD-1", "payment_succeeded", 1000);
    let sig = billing_intake_signature(&body, BILLING_SECRET);

    let genuine = ingest(&conn, "billing", &body, Some(&sig));
    let forged = ingest(&conn, "billing", &body, Some("deadbeef"));

    assert_eq!(genuine.event_id, forged.event_id);
    assert!(forged.duplicate);
    assert!(!forged.process);
    let event = get_event(&conn, &genuine.event_id);
    assert!(event.signature_ok);
    assert_eq!(event.status, PaymentEventStatus::Received);
}

#[test]
fn test_stripe_signature_accepted() {
    let conn = setup_test_db();
    let body = serde_json::to_vec(&json!({
        "id": "evt_stripe_1",
        "type": "checkout.session.completed",
        "data": { "object": { "metadata": { "order_no": "ORD-1" }, "amount_total": 1000, "currency": "usd" } }
    }))
    .unwrap();
    let sig = stripe_signature(&body, STRIPE_SECRET, chrono::Utc::now().timestamp());

    let outcome = ingest(&conn, "stripe", &body, Some(&sig));

    assert!(outcome.accepted, "a correctly signed stripe event is accepted");
    let event = get_event(&conn, &outcome.event_id);
    assert_eq!(event.provider_event_id, "evt_stripe_1");
    assert_eq!(event.order_no.as_deref(), Some("ORD-1"));
}

#[test]
fn test_invalid_json_recorded_with_synthetic_id() {
    let conn = setup_test_db();
    let body = b"{not json";

    let err = try_ingest(&conn, "stub", body, Some("")).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "got {:?}", err);

    let (provider_event_id, status, code): (String, String, Option<String>) = conn
        .query_row(
            "SELECT provider_event_id, status, last_error_code FROM payment_events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("rejected row should exist");
    assert!(provider_event_id.starts_with("sha256:"));
    assert_eq!(status, "rejected");
    assert_eq!(code.as_deref(), Some("PAYLOAD_INVALID"));

    // The same garbage again is a duplicate of the forensic row
    try_ingest(&conn, "stub", body, Some("")).unwrap_err();
    assert_eq!(event_count(&conn), 1);
    let dups: i64 = conn
        .query_row("SELECT duplicate_count FROM payment_events", [], |row| row.get(0))
        .unwrap();
    assert_eq!(dups, 1);
}

#[test]
fn test_missing_event_id_is_bad_request() {
    let conn = setup_test_db();
    let body = serde_json::to_vec(&json!({ "order_no": "ORD-1", "event_type": "paid" })).unwrap();

    let err = try_ingest(&conn, "stub", &body, Some("")).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "got {:?}", err);
    assert_eq!(event_count(&conn), 1, "kept for forensics");
}

#[test]
fn test_oversized_payload_refused_without_row() {
    let conn = setup_test_db();
    let body = vec![b' '; benefit_ledger::config::DEFAULT_WEBHOOK_MAX_BYTES + 1];

    let err = try_ingest(&conn, "stub", &body, Some("")).unwrap_err();
    assert!(matches!(err, AppError::PayloadTooLarge(_)), "got {:?}", err);
    assert_eq!(event_count(&conn), 0);
}

#[test]
fn test_unknown_provider_is_not_found() {
    let conn = setup_test_db();
    let body = stub_payload("evt_1", "ORD-1", "paid", 1000);

    let err = try_ingest(&conn, "paypal", &body, Some("")).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {:?}", err);
    assert_eq!(event_count(&conn), 0);
}
