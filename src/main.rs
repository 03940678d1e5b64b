use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use benefit_ledger::commerce::reconcile;
use benefit_ledger::config::Config;
use benefit_ledger::db::migrations::{MigrationTarget, run_migrations};
use benefit_ledger::db::{AppState, DbPool, create_pool, init_audit_db, init_db, queries};
use benefit_ledger::handlers;
use benefit_ledger::models::{AuditAction, SkuKind, SkuMeta, UpsertSku};
use benefit_ledger::util::Actor;

#[derive(Parser, Debug)]
#[command(name = "benefit-ledger")]
#[command(about = "Payment-to-entitlement ledger: webhooks in, exactly-once benefits out")]
struct Cli {
    /// Insert demo SKUs into the legacy catalog (dev mode only)
    #[arg(long, global = true)]
    seed: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Run one retry sweep over failed and unprocessed payment events, then exit
    Sweep,
    /// Write the reconciliation snapshot for one UTC day and print it as JSON
    Reconcile {
        #[arg(long, default_value_t = 0)]
        org: i64,
        /// Day to reconcile, YYYY-MM-DD
        #[arg(long)]
        day: NaiveDate,
    },
    /// Clear stored payloads of handled events older than N days
    PruneEvents {
        #[arg(long)]
        days: i64,
    },
}

/// Log a startup failure and exit.
fn or_exit<T, E: Display>(result: Result<T, E>, what: &str) -> T {
    result.unwrap_or_else(|e| {
        tracing::error!("{}: {}", what, e);
        eprintln!("ERROR: {}: {}", what, e);
        std::process::exit(1);
    })
}

fn open_pool(path: &str, target: MigrationTarget, backup_count: i32) -> DbPool {
    let pool = or_exit(create_pool(path), "Failed to create database pool");
    let mut conn = or_exit(pool.get(), "Failed to get connection");
    or_exit(
        run_migrations(&mut conn, path, target, backup_count),
        "Database migration failed",
    );
    let init = match target {
        MigrationTarget::Main => init_db(&conn),
        MigrationTarget::Audit => init_audit_db(&conn),
    };
    or_exit(init, "Failed to initialize database");
    pool
}

/// Demo catalog on org 0: a 10-credit pack and a report unlock.
fn seed_dev_skus(state: &AppState) {
    let conn = or_exit(state.db.get(), "Failed to get db connection for seeding");
    if !or_exit(queries::list_skus(&conn, 0), "Failed to list SKUs").is_empty() {
        tracing::info!("Legacy catalog already has SKUs, skipping seed");
        return;
    }

    let skus = [
        UpsertSku {
            org_id: 0,
            sku: "CREDITS_10".into(),
            kind: SkuKind::CreditPack,
            unit_qty: 10,
            benefit_code: "REPORT_CREDIT".into(),
            scope: None,
            price_cents: 990,
            currency: Some("USD".into()),
            is_active: true,
            meta: SkuMeta::default(),
        },
        UpsertSku {
            org_id: 0,
            sku: "REPORT_UNLOCK".into(),
            kind: SkuKind::ReportUnlock,
            unit_qty: 1,
            benefit_code: "FULL_REPORT".into(),
            scope: None,
            price_cents: 1990,
            currency: Some("USD".into()),
            is_active: true,
            meta: SkuMeta {
                duration_days: Some(365),
            },
        },
    ];
    for input in &skus {
        let sku = or_exit(queries::upsert_sku(&conn, input), "Failed to seed SKU");
        tracing::info!(sku = %sku.sku, kind = %sku.kind, price_cents = sku.price_cents, "Seeded SKU");
    }

    state
        .audit_trail()
        .entry(&Actor::system("seed"))
        .action(AuditAction::SeedSkus)
        .resource("sku", "legacy_catalog")
        .details(json!({ "skus": skus.iter().map(|s| s.sku.as_str()).collect::<Vec<_>>() }))
        .org(0)
        .record();
}

fn spawn_sweep_task(state: AppState, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::info!("Payment retry sweep disabled (PAYMENT_SWEEP_INTERVAL_SECS=0)");
        return;
    }

    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_secs);
        let processor = state.processor();

        loop {
            tokio::time::sleep(interval).await;

            match state.db.get() {
                Ok(mut conn) => {
                    if let Err(e) = processor.sweep(&mut conn) {
                        tracing::error!("Payment retry sweep failed: {}", e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to get db connection for retry sweep: {}", e);
                }
            }
        }
    });

    tracing::info!("Payment retry sweep started (runs every {}s)", interval_secs);
}

fn purge_on_startup(state: &AppState, config: &Config) {
    if config.audit_log_retention_days > 0 {
        let conn = or_exit(state.audit.get(), "Failed to get audit connection for purge");
        match queries::purge_old_audit_logs(&conn, config.audit_log_retention_days) {
            Ok(count) if count > 0 => {
                tracing::info!(
                    "Purged {} audit log entries older than {} days",
                    count,
                    config.audit_log_retention_days
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to purge old audit logs: {}", e),
        }
    }

    if config.event_retention_days > 0 {
        let conn = or_exit(state.db.get(), "Failed to get connection for event pruning");
        match queries::prune_event_payloads(&conn, config.event_retention_days) {
            Ok(count) if count > 0 => {
                tracing::info!(
                    "Cleared payloads of {} handled events older than {} days",
                    count,
                    config.event_retention_days
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to prune event payloads: {}", e),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "benefit_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = open_pool(
        &config.database_path,
        MigrationTarget::Main,
        config.migration_backup_count,
    );
    let audit_pool = open_pool(
        &config.audit_database_path,
        MigrationTarget::Audit,
        config.migration_backup_count,
    );

    let providers = config.payment_providers();
    if providers.names().is_empty() {
        tracing::warn!("No payment providers enabled; every webhook will be refused");
    } else {
        tracing::info!("Payment providers enabled: {}", providers.names().join(", "));
    }

    let state = AppState {
        db: db_pool,
        audit: audit_pool,
        audit_log_enabled: config.audit_log_enabled,
        providers: Arc::new(providers),
        retry: config.retry,
        webhook_max_bytes: config.webhook_max_bytes,
        ops_api_token: config.ops_api_token.clone(),
    };

    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set LEDGER_ENV=dev)");
        } else {
            seed_dev_skus(&state);
        }
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state, &config).await,
        Command::Sweep => {
            let mut conn = or_exit(state.db.get(), "Failed to get connection");
            let report = or_exit(state.processor().sweep(&mut conn), "Retry sweep failed");
            println!("{}", or_exit(serde_json::to_string_pretty(&report), "Failed to render report"));
        }
        Command::Reconcile { org, day } => {
            let conn = or_exit(state.db.get(), "Failed to get connection");
            let snapshot = or_exit(
                reconcile::reconcile(&conn, &state.audit_trail(), &Actor::system("reconcile_cli"), org, day),
                "Reconciliation failed",
            );
            println!(
                "{}",
                or_exit(serde_json::to_string_pretty(&snapshot), "Failed to render snapshot")
            );
        }
        Command::PruneEvents { days } => {
            if days <= 0 {
                eprintln!("ERROR: --days must be positive");
                std::process::exit(1);
            }
            let conn = or_exit(state.db.get(), "Failed to get connection");
            let count = or_exit(queries::prune_event_payloads(&conn, days), "Pruning failed");
            println!("Cleared payloads of {} handled events older than {} days", count, days);
        }
    }
}

async fn serve(state: AppState, config: &Config) {
    purge_on_startup(&state, config);
    spawn_sweep_task(state.clone(), config.sweep_interval_secs);

    if state.ops_api_token.is_none() {
        tracing::warn!("OPS_API_TOKEN not set; /ops routes will answer 404");
    }

    let app: Router = Router::new()
        .merge(handlers::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = or_exit(tokio::net::TcpListener::bind(&addr).await, "Failed to bind to address");

    tracing::info!("benefit-ledger listening on {}", addr);

    or_exit(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await,
        "Server error",
    );
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping server...");
}
