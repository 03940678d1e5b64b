pub mod from_row;
pub mod migrations;
pub mod queries;
mod schema;

pub use schema::{init_audit_db, init_db};

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::commerce::{Processor, RetryPolicy};
use crate::payments::PaymentProviders;
use crate::util::AuditTrail;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state holding database pools and configuration
#[derive(Clone)]
pub struct AppState {
    /// Main ledger database pool
    pub db: DbPool,
    /// Audit log database pool (separate file to isolate growth)
    pub audit: DbPool,
    pub audit_log_enabled: bool,
    pub providers: Arc<PaymentProviders>,
    pub retry: RetryPolicy,
    /// Webhook bodies above this size are refused with 413
    pub webhook_max_bytes: usize,
    /// Bearer token for the /ops API
    pub ops_api_token: Option<String>,
}

impl AppState {
    pub fn audit_trail(&self) -> AuditTrail {
        AuditTrail::new(self.audit.clone(), self.audit_log_enabled)
    }

    pub fn processor(&self) -> Processor {
        Processor::new(self.providers.clone(), self.retry, self.audit_trail())
    }
}

/// Pool for a file database. Every connection waits on locks instead of failing
/// with SQLITE_BUSY, and enforces foreign keys.
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;",
        )
    });
    Pool::builder().max_size(10).build(manager)
}
