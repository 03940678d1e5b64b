use std::env;

use crate::commerce::RetryPolicy;
use crate::payments::PaymentProviders;

/// Default webhook body cap (256 KiB).
pub const DEFAULT_WEBHOOK_MAX_BYTES: usize = 262_144;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub audit_database_path: String,
    pub dev_mode: bool,
    pub audit_log_enabled: bool,
    /// Days to keep audit rows (0 = never purge)
    pub audit_log_retention_days: i64,
    /// Backups kept per database by migrations (-1 = all, 0 = none)
    pub migration_backup_count: i32,
    pub stripe_webhook_secret: Option<String>,
    pub billing_webhook_secret: Option<String>,
    pub stub_provider_enabled: bool,
    pub webhook_max_bytes: usize,
    pub retry: RetryPolicy,
    /// Background retry sweep period (0 = disabled)
    pub sweep_interval_secs: u64,
    /// Days after which handled event payload bodies are cleared (0 = keep)
    pub event_retention_days: i64,
    /// Bearer token for the /ops API; ops routes answer 404 without it
    pub ops_api_token: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_secret(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("LEDGER_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env_parse("PORT", 3000);

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env_parse("PAYMENT_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_delay_secs: env_parse("PAYMENT_RETRY_BASE_SECS", defaults.base_delay_secs),
            max_delay_secs: env_parse("PAYMENT_RETRY_MAX_SECS", defaults.max_delay_secs),
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "benefit_ledger.db".to_string()),
            audit_database_path: env::var("AUDIT_DATABASE_PATH")
                .unwrap_or_else(|_| "benefit_ledger_audit.db".to_string()),
            dev_mode,
            audit_log_enabled: env_bool("AUDIT_LOG_ENABLED", true),
            audit_log_retention_days: env_parse("AUDIT_LOG_RETENTION_DAYS", 0),
            migration_backup_count: env_parse("MIGRATION_BACKUP_COUNT", 3),
            stripe_webhook_secret: env_secret("STRIPE_WEBHOOK_SECRET"),
            billing_webhook_secret: env_secret("BILLING_WEBHOOK_SECRET"),
            stub_provider_enabled: env_bool("STUB_PROVIDER_ENABLED", dev_mode),
            webhook_max_bytes: env_parse("WEBHOOK_MAX_BYTES", DEFAULT_WEBHOOK_MAX_BYTES),
            retry,
            sweep_interval_secs: env_parse("PAYMENT_SWEEP_INTERVAL_SECS", 60),
            event_retention_days: env_parse("PAYMENT_EVENT_RETENTION_DAYS", 0),
            ops_api_token: env_secret("OPS_API_TOKEN"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the provider registry from the configured secrets.
    pub fn payment_providers(&self) -> PaymentProviders {
        PaymentProviders::new(
            self.stripe_webhook_secret.as_deref(),
            self.billing_webhook_secret.as_deref(),
            self.stub_provider_enabled,
        )
    }
}
