//! Audit trail storage: what money-affecting calls leave behind

#[path = "../common/mod.rs"]
mod common;

use common::*;
use serde_json::json;

fn trail() -> (AuditTrail, benefit_ledger::db::DbPool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.db").to_string_lossy().into_owned();
    let pool = create_pool(&path).unwrap();
    init_audit_db(&pool.get().unwrap()).unwrap();
    (AuditTrail::new(pool.clone(), true), pool, dir)
}

#[test]
fn test_order_creation_is_audited() {
    let (audit, pool, _dir) = trail();
    let conn = setup_test_db();
    seed_catalog(&conn, 0);

    let outcome = commerce::orders::create_order(
        &conn,
        &test_providers(),
        &audit,
        &Actor::collaborator("checkout"),
        &order_input(3, "stub", CREDIT_SKU, 1, "k"),
    )
    .unwrap();

    let query = AuditLogQuery {
        resource_id: Some(outcome.order.order_no.clone()),
        ..Default::default()
    };
    let (logs, total) = queries::query_audit_logs(&pool.get().unwrap(), &query).unwrap();
    assert_eq!(total, 1);
    assert_eq!(logs[0].action, "create_order");
    assert_eq!(logs[0].actor_type, ActorType::Collaborator);
    assert_eq!(logs[0].actor_id.as_deref(), Some("checkout"));
    assert_eq!(logs[0].org_id, Some(3));
}

#[test]
fn test_replayed_order_is_not_audited_twice() {
    let (audit, pool, _dir) = trail();
    let conn = setup_test_db();
    seed_catalog(&conn, 0);
    let actor = Actor::collaborator("checkout");
    let input = order_input(0, "stub", CREDIT_SKU, 1, "k");

    commerce::orders::create_order(&conn, &test_providers(), &audit, &actor, &input).unwrap();
    commerce::orders::create_order(&conn, &test_providers(), &audit, &actor, &input).unwrap();

    let query = AuditLogQuery {
        action: Some("create_order".into()),
        ..Default::default()
    };
    let (_, total) = queries::query_audit_logs(&pool.get().unwrap(), &query).unwrap();
    assert_eq!(total, 1);
}

#[test]
fn test_disabled_trail_records_nothing() {
    let (_, pool, _dir) = trail();
    let disabled = AuditTrail::new(pool.clone(), false);

    let log = disabled
        .entry(&Actor::system("test"))
        .action(AuditAction::ReconcileDay)
        .resource("reconcile_snapshot", "rcs_1")
        .record();

    assert!(log.is_none());
    let (_, total) = queries::query_audit_logs(&pool.get().unwrap(), &AuditLogQuery::default()).unwrap();
    assert_eq!(total, 0);
}

#[test]
fn test_failed_audit_write_does_not_undo_ledger_work() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no-schema.db").to_string_lossy().into_owned();
    let audit = AuditTrail::new(create_pool(&path).unwrap(), true);
    let mut conn = setup_test_db();

    let applied = commerce::wallet::manual_adjustment(
        &mut conn,
        &audit,
        &Actor::operator(Some("op-1")),
        &commerce::ManualAdjustment {
            org_id: 1,
            benefit_code: CREDIT_CODE.into(),
            delta: 4,
            reason: "goodwill".into(),
            idempotency_key: "ticket-1".into(),
            meta: Some(json!({ "ticket": 1 })),
        },
    )
    .unwrap();

    assert!(applied.applied);
    assert_eq!(balance(&conn, 1, CREDIT_CODE), 4);
}

#[test]
fn test_query_filters_by_actor_and_org() {
    let (audit, pool, _dir) = trail();
    let operator = Actor::operator(Some("op-1"));
    let system = Actor::system("reconcile");

    for org in [1, 2] {
        audit
            .entry(&operator)
            .action(AuditAction::AppendLedgerEntry)
            .resource("benefit_wallet", CREDIT_CODE)
            .org(org)
            .record()
            .expect("audit write");
    }
    audit
        .entry(&system)
        .action(AuditAction::ReconcileDay)
        .resource("reconcile_snapshot", "rcs_1")
        .details(json!({ "drift": 0 }))
        .org(1)
        .record()
        .expect("audit write");

    let conn = pool.get().unwrap();
    let by_org = AuditLogQuery {
        org_id: Some(1),
        ..Default::default()
    };
    assert_eq!(queries::query_audit_logs(&conn, &by_org).unwrap().1, 2);

    let by_actor = AuditLogQuery {
        actor_type: Some(ActorType::Operator),
        ..Default::default()
    };
    assert_eq!(queries::query_audit_logs(&conn, &by_actor).unwrap().1, 2);

    let paged = AuditLogQuery {
        limit: Some(1),
        ..Default::default()
    };
    let (logs, total) = queries::query_audit_logs(&conn, &paged).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(total, 3);
}

#[test]
fn test_formatted_line() {
    let (audit, _pool, _dir) = trail();
    let log = audit
        .entry(&Actor::operator(Some("op-1")))
        .action(AuditAction::RevokeGrant)
        .resource("benefit_grant", "grt_1")
        .org(7)
        .record()
        .expect("audit write");

    let line = log.formatted();
    assert!(line.contains("[Operator]"), "{}", line);
    assert!(line.contains("op-1"), "{}", line);
    assert!(line.contains("grt_1"), "{}", line);
}
