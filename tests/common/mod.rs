//! Test utilities and fixtures for benefit-ledger integration tests

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use serde_json::{Value, json};
use tempfile::TempDir;

pub use benefit_ledger::commerce::{
    self, IntakeOutcome, Processor, ProcessOutcome, RetryPolicy, WebhookDelivery,
};
pub use benefit_ledger::db::{AppState, create_pool, init_audit_db, init_db, queries};
pub use benefit_ledger::error::{AppError, ErrorCode};
pub use benefit_ledger::models::*;
pub use benefit_ledger::payments::PaymentProviders;
pub use benefit_ledger::util::{Actor, AuditTrail};
pub use rusqlite::Connection;

pub const STRIPE_SECRET: &str = "whsec_test123secret456";
pub const BILLING_SECRET: &str = "billing_test_secret";
pub const OPS_TOKEN: &str = "ops-test-token";

/// Credit pack of the default test catalog: 10 credits for 10.00 USD.
pub const CREDIT_SKU: &str = "CREDITS_10";
pub const CREDIT_CODE: &str = "REPORT_CREDIT";
/// Report unlock of the default test catalog: 19.90 USD.
pub const UNLOCK_SKU: &str = "REPORT_UNLOCK";
pub const UNLOCK_CODE: &str = "FULL_REPORT";

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

/// Create an in-memory test audit database with schema initialized
pub fn setup_test_audit_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory audit database");
    init_audit_db(&conn).expect("Failed to initialize audit schema");
    conn
}

/// File database in a temp dir, for tests that need several connections.
/// Keep the `TempDir` alive for as long as the database is used.
pub fn setup_file_db() -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir
        .path()
        .join("ledger.db")
        .to_string_lossy()
        .into_owned();
    let conn = Connection::open(&path).expect("Failed to create test db");
    conn.execute_batch("PRAGMA journal_mode = WAL;")
        .expect("Failed to enable WAL");
    init_db(&conn).expect("Failed to init schema");
    (dir, path)
}

/// Connection for one thread of a concurrency test.
pub fn open_thread_conn(path: &str) -> Connection {
    let conn = Connection::open(path).expect("thread failed to open db");
    conn.busy_timeout(std::time::Duration::from_secs(10))
        .expect("failed to set busy timeout");
    conn
}

/// All three providers enabled with the test secrets.
pub fn test_providers() -> PaymentProviders {
    PaymentProviders::new(Some(STRIPE_SECRET), Some(BILLING_SECRET), true)
}

/// Retries are due immediately, escalation after three attempts.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_secs: 0,
        max_delay_secs: 0,
    }
}

pub fn test_processor() -> Processor {
    Processor::new(Arc::new(test_providers()), fast_retry(), AuditTrail::disabled())
}

pub fn create_test_sku(
    conn: &Connection,
    org_id: i64,
    sku: &str,
    kind: SkuKind,
    unit_qty: i64,
    benefit_code: &str,
    price_cents: i64,
) -> Sku {
    let input = UpsertSku {
        org_id,
        sku: sku.to_string(),
        kind,
        unit_qty,
        benefit_code: benefit_code.to_string(),
        scope: None,
        price_cents,
        currency: Some("USD".to_string()),
        is_active: true,
        meta: SkuMeta::default(),
    };
    queries::upsert_sku(conn, &input).expect("Failed to create test SKU")
}

/// The default test catalog for `org_id`.
pub fn seed_catalog(conn: &Connection, org_id: i64) {
    create_test_sku(conn, org_id, CREDIT_SKU, SkuKind::CreditPack, 10, CREDIT_CODE, 1000);
    create_test_sku(conn, org_id, UNLOCK_SKU, SkuKind::ReportUnlock, 1, UNLOCK_CODE, 1990);
}

pub fn order_input(org_id: i64, provider: &str, sku: &str, quantity: i64, key: &str) -> CreateOrder {
    CreateOrder {
        org_id,
        provider: provider.to_string(),
        idempotency_key: key.to_string(),
        sku: sku.to_string(),
        quantity,
        user_id: None,
        anon_id: Some("anon-1".to_string()),
        target_attempt_id: if sku == UNLOCK_SKU {
            Some("attempt-1".to_string())
        } else {
            None
        },
        amount_cents: None,
        currency: None,
    }
}

/// Create an order through the order service.
pub fn create_test_order(
    conn: &Connection,
    org_id: i64,
    provider: &str,
    sku: &str,
    quantity: i64,
    key: &str,
) -> Order {
    commerce::orders::create_order(
        conn,
        &test_providers(),
        &AuditTrail::disabled(),
        &Actor::collaborator("test"),
        &order_input(org_id, provider, sku, quantity, key),
    )
    .expect("Failed to create test order")
    .order
}

/// Flat stub-provider payload.
pub fn stub_payload(event_id: &str, order_no: &str, event_type: &str, amount_cents: i64) -> Vec<u8> {
    stub_payload_with(event_id, order_no, event_type, json!({ "amount_cents": amount_cents, "currency": "USD" }))
}

/// Flat stub-provider payload with extra fields merged in.
pub fn stub_payload_with(event_id: &str, order_no: &str, event_type: &str, extra: Value) -> Vec<u8> {
    let mut body = json!({
        "event_id": event_id,
        "order_no": order_no,
        "event_type": event_type,
    });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    serde_json::to_vec(&body).expect("payload serializes")
}

/// Record a delivery through intake.
pub fn ingest(conn: &Connection, provider: &str, body: &[u8], signature: Option<&str>) -> IntakeOutcome {
    try_ingest(conn, provider, body, signature).expect("intake should accept the delivery")
}

pub fn try_ingest(
    conn: &Connection,
    provider: &str,
    body: &[u8],
    signature: Option<&str>,
) -> Result<IntakeOutcome, AppError> {
    let meta = RequestMeta::default();
    commerce::intake::ingest(
        conn,
        &test_providers(),
        benefit_ledger::config::DEFAULT_WEBHOOK_MAX_BYTES,
        &WebhookDelivery {
            provider,
            body,
            signature,
            meta: &meta,
        },
    )
}

/// Ingest a stub delivery and process it right away, like the webhook handler.
pub fn deliver_stub(conn: &mut Connection, body: &[u8]) -> (IntakeOutcome, Option<ProcessOutcome>) {
    let outcome = ingest(conn, "stub", body, Some(""));
    let processed = if outcome.process {
        Some(
            test_processor()
                .process(conn, &outcome.event_id)
                .expect("processing should not hit an infrastructure error"),
        )
    } else {
        None
    };
    (outcome, processed)
}

pub fn get_order(conn: &Connection, order_no: &str) -> Order {
    queries::get_order_by_no(conn, order_no)
        .expect("query failed")
        .expect("order should exist")
}

pub fn get_event(conn: &Connection, event_id: &str) -> PaymentEvent {
    queries::get_payment_event(conn, event_id)
        .expect("query failed")
        .expect("event should exist")
}

pub fn balance(conn: &Connection, org_id: i64, code: &str) -> i64 {
    queries::wallet_balance(conn, org_id, code).expect("balance query failed")
}

pub fn ledger_sum(conn: &Connection, org_id: i64, code: &str) -> i64 {
    queries::ledger_sum(conn, org_id, code).expect("ledger sum query failed")
}

/// Stripe `stripe-signature` header value for a payload.
pub fn stripe_signature(payload: &[u8], secret: &str, timestamp: i64) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// `x-billing-signature` header value: hex HMAC-SHA256 of `"{timestamp}.{body}"`.
pub fn billing_signature(payload: &[u8], secret: &str, timestamp: i64) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Billing signature and timestamp as intake receives them, signed now.
pub fn billing_intake_signature(payload: &[u8], secret: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    format!("t={},v1={}", now, billing_signature(payload, secret, now))
}

/// App state on temp-dir file databases with every provider and the ops API enabled.
pub fn test_app_state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("ledger.db").to_string_lossy().into_owned();
    let audit_path = dir.path().join("audit.db").to_string_lossy().into_owned();

    let db = create_pool(&db_path).expect("Failed to create pool");
    let audit = create_pool(&audit_path).expect("Failed to create audit pool");
    init_db(&db.get().expect("connection")).expect("Failed to init schema");
    init_audit_db(&audit.get().expect("connection")).expect("Failed to init audit schema");

    let state = AppState {
        db,
        audit,
        audit_log_enabled: true,
        providers: Arc::new(test_providers()),
        retry: fast_retry(),
        webhook_max_bytes: 4096,
        ops_api_token: Some(OPS_TOKEN.to_string()),
    };
    (state, dir)
}

pub fn test_app(state: AppState) -> Router {
    benefit_ledger::handlers::router(state.clone()).with_state(state)
}

/// Send one request through the router and decode the JSON body (Null when empty).
pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("router should respond");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Request to the ops API carrying the test token and an operator id.
pub fn ops_request(method: &str, uri: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", OPS_TOKEN))
        .header("x-operator-id", "op-1");
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}
