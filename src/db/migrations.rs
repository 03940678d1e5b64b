//! Schema versioning for the ledger databases.
//!
//! Each database (main, audit) tracks its own version via `PRAGMA user_version`.
//! Migrations run before `init_db`/`init_audit_db`, which then create whatever
//! is missing with `CREATE ... IF NOT EXISTS`.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use thiserror::Error;

/// Target database for a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationTarget {
    /// Main ledger database
    Main,
    /// Audit database
    Audit,
}

/// A database migration.
pub struct Migration {
    /// Version number (sequential per target, starting from 1).
    pub version: i32,
    pub description: &'static str,
    pub target: MigrationTarget,
    pub up: fn(&Connection) -> rusqlite::Result<()>,
}

/// All migrations in order. Append only.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "baseline ledger schema",
        target: MigrationTarget::Main,
        up: migration_001_baseline_main,
    },
    Migration {
        version: 2,
        description: "payment event retry scheduling",
        target: MigrationTarget::Main,
        up: migration_002_payment_event_retry_columns,
    },
    Migration {
        version: 1,
        description: "baseline audit schema",
        target: MigrationTarget::Audit,
        up: migration_001_baseline_audit,
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to create backup at {path}: {source}")]
    BackupFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Migration {version} failed: {message}. Backup at: {backup_path}")]
    MigrationFailed {
        version: i32,
        message: String,
        backup_path: PathBuf,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Latest version defined for a target.
pub fn latest_version(target: MigrationTarget) -> i32 {
    MIGRATIONS
        .iter()
        .filter(|m| m.target == target)
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

pub fn get_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn set_version(conn: &Connection, version: i32) -> rusqlite::Result<()> {
    conn.pragma_update(None, "user_version", version)
}

fn backup_database(db_path: &str, from_version: i32) -> Result<PathBuf, MigrationError> {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup_path = PathBuf::from(format!("{}.backup_v{}_{}", db_path, from_version, timestamp));

    fs::copy(db_path, &backup_path).map_err(|e| MigrationError::BackupFailed {
        path: backup_path.clone(),
        source: e,
    })?;

    Ok(backup_path)
}

/// Keep only the newest `keep_count` backups (-1 keeps all, 0 means none were made).
fn cleanup_old_backups(db_path: &str, keep_count: i32) -> Result<(), std::io::Error> {
    if keep_count < 1 {
        return Ok(());
    }
    let keep_count = keep_count as usize;

    let db_path = Path::new(db_path);
    let parent = db_path.parent().unwrap_or(Path::new("."));
    let prefix = format!(
        "{}.backup_v",
        db_path.file_name().and_then(|n| n.to_str()).unwrap_or("")
    );

    let mut backups: Vec<_> = fs::read_dir(parent)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix))
        })
        .collect();

    if backups.len() <= keep_count {
        return Ok(());
    }

    // Oldest first
    backups.sort_by_key(|entry| {
        entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    let to_remove = backups.len() - keep_count;
    for entry in backups.into_iter().take(to_remove) {
        tracing::info!("Removing old backup: {}", entry.path().display());
        fs::remove_file(entry.path())?;
    }

    Ok(())
}

/// Run pending migrations for one database.
///
/// A backup is taken before the first pending migration unless the database
/// is fresh (version 0) or `backup_keep_count` is 0. Each migration commits in
/// its own transaction together with its version bump.
pub fn run_migrations(
    conn: &mut Connection,
    db_path: &str,
    target: MigrationTarget,
    backup_keep_count: i32,
) -> Result<(), MigrationError> {
    let current_version = get_version(conn)?;

    let pending: Vec<_> = MIGRATIONS
        .iter()
        .filter(|m| m.target == target && m.version > current_version)
        .collect();

    if pending.is_empty() {
        tracing::debug!("{:?} database at version {} (up to date)", target, current_version);
        return Ok(());
    }

    tracing::info!(
        "{:?} database at version {}, {} migration(s) pending",
        target,
        current_version,
        pending.len()
    );

    let backup_path = if backup_keep_count == 0 {
        tracing::warn!("Migration backups disabled (MIGRATION_BACKUP_COUNT=0)");
        None
    } else if current_version == 0 || db_path == ":memory:" {
        None
    } else {
        let path = backup_database(db_path, current_version)?;
        tracing::info!("Backup created: {}", path.display());
        Some(path)
    };

    for migration in pending {
        tracing::info!("Running migration {}: {}", migration.version, migration.description);

        let tx = conn.transaction()?;
        if let Err(e) = (migration.up)(&tx) {
            tracing::error!(
                "Migration {} failed: {}. Database unchanged. Backup: {}",
                migration.version,
                e,
                backup_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            return Err(MigrationError::MigrationFailed {
                version: migration.version,
                message: e.to_string(),
                backup_path: backup_path.unwrap_or_default(),
            });
        }
        set_version(&tx, migration.version)?;
        tx.commit()?;
        tracing::info!("Migration {} completed", migration.version);
    }

    if let Err(e) = cleanup_old_backups(db_path, backup_keep_count) {
        tracing::warn!("Failed to clean up old backups: {}", e);
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

// ============================================================================
// Migration Functions
// ============================================================================

/// Baseline. Fresh databases get their tables from `init_db`.
fn migration_001_baseline_main(conn: &Connection) -> rusqlite::Result<()> {
    if table_exists(conn, "orders")? {
        tracing::debug!("Existing ledger database detected, baseline migration is no-op");
    } else {
        tracing::debug!("Fresh ledger database, schema will be created by init_db");
    }
    Ok(())
}

/// Adds the retry schedule columns that the sweep relies on.
fn migration_002_payment_event_retry_columns(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "payment_events")? {
        return Ok(());
    }
    if !column_exists(conn, "payment_events", "next_attempt_at")? {
        conn.execute_batch("ALTER TABLE payment_events ADD COLUMN next_attempt_at INTEGER;")?;
    }
    if !column_exists(conn, "payment_events", "escalated_at")? {
        conn.execute_batch("ALTER TABLE payment_events ADD COLUMN escalated_at INTEGER;")?;
        // Anything that already burned through its attempts goes straight to the operator queue.
        conn.execute(
            "UPDATE payment_events SET escalated_at = COALESCE(processed_at, received_at)
             WHERE status = 'failed' AND attempts >= 5",
            [],
        )?;
    }
    Ok(())
}

fn migration_001_baseline_audit(conn: &Connection) -> rusqlite::Result<()> {
    if table_exists(conn, "audit_logs")? {
        tracing::debug!("Existing audit database detected, baseline migration is no-op");
    } else {
        tracing::debug!("Fresh audit database, schema will be created by init_audit_db");
    }
    Ok(())
}
