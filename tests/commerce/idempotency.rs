//! Generic ingestion dedup store

#[path = "../common/mod.rs"]
mod common;

use commerce::RecordOutcome;
use commerce::idempotency::{record, record_batch};
use common::*;

fn key(external_id: &str, recorded_at: i64, hash: &str) -> RecordIdempotencyKey {
    RecordIdempotencyKey {
        provider: "usage_feed".into(),
        external_id: external_id.into(),
        recorded_at,
        hash: hash.into(),
        batch_id: Some("batch-1".into()),
    }
}

#[test]
fn test_first_record_is_inserted() {
    let conn = setup_test_db();
    assert_eq!(record(&conn, &key("e1", 100, "h1")).unwrap(), RecordOutcome::Inserted);
}

#[test]
fn test_replay_counts_hits() {
    let conn = setup_test_db();
    record(&conn, &key("e1", 100, "h1")).unwrap();
    record(&conn, &key("e1", 100, "h1")).unwrap();

    match record(&conn, &key("e1", 100, "h1")).unwrap() {
        RecordOutcome::Existing {
            hash_mismatch,
            hit_count,
            ..
        } => {
            assert!(!hash_mismatch);
            assert_eq!(hit_count, 3);
        }
        other => panic!("expected a replay, got {:?}", other),
    }
}

#[test]
fn test_replay_with_different_hash_is_flagged() {
    let conn = setup_test_db();
    record(&conn, &key("e1", 100, "h1")).unwrap();

    let outcome = record(&conn, &key("e1", 100, "h2")).unwrap();
    assert!(matches!(outcome, RecordOutcome::Existing { hash_mismatch: true, .. }));

    let stored = queries::get_idempotency_key(&conn, "usage_feed", "e1", 100)
        .unwrap()
        .expect("stored key");
    assert_eq!(stored.hash, "h1", "first payload wins");
}

#[test]
fn test_recorded_at_is_part_of_identity() {
    let conn = setup_test_db();
    record(&conn, &key("e1", 100, "h1")).unwrap();
    assert!(record(&conn, &key("e1", 200, "h1")).unwrap().is_new());
}

#[test]
fn test_blank_identity_rejected() {
    let conn = setup_test_db();
    let err = record(&conn, &key(" ", 100, "h1")).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "got {:?}", err);
}

#[test]
fn test_batch_counts_only_new_keys() {
    let mut conn = setup_test_db();
    record(&conn, &key("e1", 100, "h1")).unwrap();

    let inserted = record_batch(
        &mut conn,
        &[key("e1", 100, "h1"), key("e2", 100, "h2"), key("e3", 100, "h3"), key("e2", 100, "h2")],
    )
    .unwrap();

    assert_eq!(inserted, 2);
}

#[test]
fn test_batch_is_all_or_nothing() {
    let mut conn = setup_test_db();

    let err = record_batch(&mut conn, &[key("e1", 100, "h1"), key("", 100, "h2")]).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    assert!(
        queries::get_idempotency_key(&conn, "usage_feed", "e1", 100)
            .unwrap()
            .is_none(),
        "the valid key is rolled back with the batch"
    );
}
