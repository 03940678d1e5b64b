//! Benefit grants: identity, manual issuance, revocation and access checks

#[path = "../common/mod.rs"]
mod common;

use commerce::ManualGrant;
use common::*;

fn manual(key: &str, scope: GrantScope) -> ManualGrant {
    ManualGrant {
        org_id: 2,
        benefit_code: "full_report".into(),
        benefit_type: None,
        benefit_ref: None,
        user_id: Some("user-1".into()),
        scope,
        attempt_id: match scope {
            GrantScope::Attempt => Some("attempt-9".into()),
            GrantScope::Account => None,
        },
        expires_at: None,
        idempotency_key: key.into(),
        reason: Some("support ticket".into()),
    }
}

fn issue(conn: &mut Connection, input: &ManualGrant) -> Result<commerce::GrantOutcome, AppError> {
    commerce::grants::issue_manual_grant(conn, &AuditTrail::disabled(), &Actor::operator(Some("op-1")), input)
}

#[test]
fn test_grant_identity_is_unique() {
    let conn = setup_test_db();
    let new = NewGrant {
        org_id: 0,
        source_order_id: "ord_1".into(),
        source_event_id: None,
        benefit_type: "report_unlock".into(),
        benefit_code: UNLOCK_CODE.into(),
        benefit_ref: "anon-1".into(),
        user_id: None,
        scope: GrantScope::Attempt,
        attempt_id: Some("attempt-1".into()),
        expires_at: None,
    };

    let first = commerce::grants::grant_in(&conn, &new).unwrap();
    let second = commerce::grants::grant_in(&conn, &new).unwrap();

    assert!(first.created);
    assert!(!second.created, "same identity returns the existing grant");
    assert_eq!(first.grant.id, second.grant.id);
    assert_eq!(first.grant.status, GrantStatus::Active);
}

#[test]
fn test_manual_grant_is_idempotent() {
    let mut conn = setup_test_db();

    let first = issue(&mut conn, &manual("ticket-1", GrantScope::Account)).unwrap();
    let replay = issue(&mut conn, &manual("ticket-1", GrantScope::Account)).unwrap();

    assert!(first.created);
    assert!(!replay.created);
    assert_eq!(first.grant.id, replay.grant.id);
    assert_eq!(first.grant.source_order_id, "manual:2:ticket-1");
    assert_eq!(first.grant.benefit_code, UNLOCK_CODE, "code normalized");
    assert_eq!(first.grant.benefit_type, "manual");
    assert_eq!(first.grant.benefit_ref, "user-1");
}

#[test]
fn test_manual_attempt_grant_requires_attempt() {
    let mut conn = setup_test_db();
    let mut input = manual("ticket-1", GrantScope::Attempt);
    input.attempt_id = None;

    let err = issue(&mut conn, &input).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "got {:?}", err);
}

#[test]
fn test_manual_grant_requires_key() {
    let mut conn = setup_test_db();
    let err = issue(&mut conn, &manual(" ", GrantScope::Account)).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "got {:?}", err);
}

#[test]
fn test_account_grant_matches_holder() {
    let mut conn = setup_test_db();
    issue(&mut conn, &manual("ticket-1", GrantScope::Account)).unwrap();

    let found = commerce::grants::has_access(&conn, 2, UNLOCK_CODE, None, Some("user-1")).unwrap();
    assert!(found.is_some());

    let other_holder = commerce::grants::has_access(&conn, 2, UNLOCK_CODE, None, Some("user-2")).unwrap();
    assert!(other_holder.is_none());

    let other_org = commerce::grants::has_access(&conn, 3, UNLOCK_CODE, None, Some("user-1")).unwrap();
    assert!(other_org.is_none(), "grants never leak across orgs");
}

#[test]
fn test_attempt_grant_matches_attempt() {
    let mut conn = setup_test_db();
    issue(&mut conn, &manual("ticket-1", GrantScope::Attempt)).unwrap();

    assert!(
        commerce::grants::has_access(&conn, 2, UNLOCK_CODE, Some("attempt-9"), None)
            .unwrap()
            .is_some()
    );
    assert!(
        commerce::grants::has_access(&conn, 2, UNLOCK_CODE, None, Some("user-1"))
            .unwrap()
            .is_none(),
        "attempt grants are not account-wide"
    );
}

#[test]
fn test_expired_grant_gives_no_access() {
    let mut conn = setup_test_db();
    let mut input = manual("ticket-1", GrantScope::Account);
    input.expires_at = Some(chrono::Utc::now().timestamp() - 10);
    issue(&mut conn, &input).unwrap();

    let found = commerce::grants::has_access(&conn, 2, UNLOCK_CODE, None, Some("user-1")).unwrap();
    assert!(found.is_none());
}

#[test]
fn test_revoke_is_idempotent_and_keeps_row() {
    let mut conn = setup_test_db();
    let grant = issue(&mut conn, &manual("ticket-1", GrantScope::Account)).unwrap().grant;
    let audit = AuditTrail::disabled();
    let actor = Actor::operator(Some("op-1"));

    let first = commerce::grants::revoke(&conn, &audit, &actor, &grant.id, "abuse").unwrap();
    let again = commerce::grants::revoke(&conn, &audit, &actor, &grant.id, "abuse").unwrap();

    assert!(first.revoked);
    assert!(!again.revoked);
    assert_eq!(first.grant.status, GrantStatus::Revoked);
    assert_eq!(first.grant.revoke_reason.as_deref(), Some("abuse"));
    assert!(
        commerce::grants::has_access(&conn, 2, UNLOCK_CODE, None, Some("user-1"))
            .unwrap()
            .is_none()
    );
    assert!(queries::get_grant(&conn, &grant.id).unwrap().is_some(), "revoked rows stay");
}

#[test]
fn test_revoke_unknown_grant_is_not_found() {
    let conn = setup_test_db();
    let err = commerce::grants::revoke(
        &conn,
        &AuditTrail::disabled(),
        &Actor::operator(None),
        "grt_missing",
        "x",
    )
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {:?}", err);
}

#[test]
fn test_manual_grant_keys_are_scoped_per_org() {
    let mut conn = setup_test_db();
    let mut first_org = manual("comp-1", GrantScope::Account);
    first_org.org_id = 1;
    let mut second_org = manual("comp-1", GrantScope::Account);
    second_org.org_id = 2;

    let first = issue(&mut conn, &first_org).unwrap();
    let second = issue(&mut conn, &second_org).unwrap();

    assert!(first.created);
    assert!(second.created, "the same key in another org is a new grant");
    assert_ne!(first.grant.id, second.grant.id);
    assert_eq!(second.grant.org_id, 2);
    assert!(
        commerce::grants::has_access(&conn, 2, UNLOCK_CODE, None, Some("user-1"))
            .unwrap()
            .is_some()
    );
}
