use rusqlite::Connection;

/// Initialize the main database schema (everything except audit logs)
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- org_id = 0 is the legacy tenant; it is scoped like any other org.

        -- SKU catalog (org 0 rows act as the shared fallback catalog)
        CREATE TABLE IF NOT EXISTS skus (
            org_id INTEGER NOT NULL DEFAULT 0,
            sku TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('credit_pack', 'report_unlock')),
            unit_qty INTEGER NOT NULL DEFAULT 1 CHECK (unit_qty > 0),
            benefit_code TEXT NOT NULL,
            scope TEXT NOT NULL CHECK (scope IN ('attempt', 'account')),
            price_cents INTEGER NOT NULL DEFAULT 0 CHECK (price_cents >= 0),
            currency TEXT NOT NULL DEFAULT 'USD',
            is_active INTEGER NOT NULL DEFAULT 1,
            meta_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, sku)
        );
        CREATE INDEX IF NOT EXISTS idx_skus_benefit_code ON skus(benefit_code);

        -- Orders: one row per buyer intent
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_no TEXT NOT NULL UNIQUE,
            org_id INTEGER NOT NULL DEFAULT 0,
            user_id TEXT,
            anon_id TEXT,
            sku TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1 CHECK (quantity BETWEEN 1 AND 1000),
            target_attempt_id TEXT,
            amount_cents INTEGER NOT NULL DEFAULT 0 CHECK (amount_cents >= 0),
            currency TEXT NOT NULL DEFAULT 'USD',
            status TEXT NOT NULL DEFAULT 'created'
                CHECK (status IN ('created', 'paid', 'fulfilled', 'refunded', 'failed')),
            provider TEXT NOT NULL,
            provider_order_id TEXT,
            idempotency_key TEXT NOT NULL,
            paid_at INTEGER,
            fulfilled_at INTEGER,
            refunded_at INTEGER,
            refund_amount_cents INTEGER NOT NULL DEFAULT 0
                CHECK (refund_amount_cents >= 0 AND refund_amount_cents <= amount_cents),
            refund_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(org_id, provider, idempotency_key)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_org_created ON orders(org_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_org_paid ON orders(org_id, paid_at);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_provider_order ON orders(provider, provider_order_id);

        -- Payment events: one row per (provider, provider_event_id), never deleted
        CREATE TABLE IF NOT EXISTS payment_events (
            id TEXT PRIMARY KEY,
            org_id INTEGER NOT NULL DEFAULT 0,
            provider TEXT NOT NULL,
            provider_event_id TEXT NOT NULL,
            order_no TEXT,
            event_type TEXT NOT NULL,
            payload_json TEXT,
            payload_sha256 TEXT NOT NULL,
            payload_size_bytes INTEGER NOT NULL,
            payload_excerpt TEXT,
            normalized_json TEXT,
            signature_ok INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'received'
                CHECK (status IN ('received', 'processing', 'handled', 'failed', 'rejected')),
            attempts INTEGER NOT NULL DEFAULT 0,
            duplicate_count INTEGER NOT NULL DEFAULT 0,
            last_duplicate_at INTEGER,
            last_error_code TEXT,
            last_error_message TEXT,
            request_id TEXT,
            ip_address TEXT,
            user_agent TEXT,
            received_at INTEGER NOT NULL,
            processed_at INTEGER,
            handled_at INTEGER,
            next_attempt_at INTEGER,
            escalated_at INTEGER,
            UNIQUE(provider, provider_event_id)
        );
        CREATE INDEX IF NOT EXISTS idx_payment_events_order ON payment_events(order_no);
        CREATE INDEX IF NOT EXISTS idx_payment_events_org_received ON payment_events(org_id, received_at);
        CREATE INDEX IF NOT EXISTS idx_payment_events_retry ON payment_events(status, next_attempt_at)
            WHERE escalated_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_payment_events_escalated ON payment_events(escalated_at)
            WHERE escalated_at IS NOT NULL;

        -- Benefit grants: exactly one per (order, benefit type, holder)
        CREATE TABLE IF NOT EXISTS benefit_grants (
            id TEXT PRIMARY KEY,
            org_id INTEGER NOT NULL DEFAULT 0,
            user_id TEXT,
            benefit_ref TEXT NOT NULL,
            benefit_code TEXT NOT NULL,
            benefit_type TEXT NOT NULL,
            scope TEXT NOT NULL CHECK (scope IN ('attempt', 'account')),
            attempt_id TEXT,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'revoked')),
            source_order_id TEXT NOT NULL,
            source_event_id TEXT,
            expires_at INTEGER,
            revoked_at INTEGER,
            revoke_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (scope = 'account' OR attempt_id IS NOT NULL),
            UNIQUE(source_order_id, benefit_type, benefit_ref)
        );
        CREATE INDEX IF NOT EXISTS idx_benefit_grants_org_code ON benefit_grants(org_id, benefit_code, status);
        CREATE INDEX IF NOT EXISTS idx_benefit_grants_attempt ON benefit_grants(attempt_id, benefit_code);
        CREATE INDEX IF NOT EXISTS idx_benefit_grants_org_created ON benefit_grants(org_id, created_at);

        -- Wallet projection; must always equal SUM(ledger.delta)
        CREATE TABLE IF NOT EXISTS benefit_wallets (
            org_id INTEGER NOT NULL DEFAULT 0,
            benefit_code TEXT NOT NULL,
            balance INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, benefit_code)
        );

        -- Append-only ledger; idempotency_key is the replay barrier
        CREATE TABLE IF NOT EXISTS benefit_wallet_ledgers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id INTEGER NOT NULL DEFAULT 0,
            benefit_code TEXT NOT NULL,
            delta INTEGER NOT NULL CHECK (delta != 0),
            reason TEXT NOT NULL,
            order_no TEXT,
            attempt_id TEXT,
            idempotency_key TEXT NOT NULL UNIQUE,
            meta_json TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledgers_org_code ON benefit_wallet_ledgers(org_id, benefit_code, created_at);
        CREATE INDEX IF NOT EXISTS idx_ledgers_order ON benefit_wallet_ledgers(order_no);

        CREATE TRIGGER IF NOT EXISTS benefit_wallet_ledgers_no_update
        BEFORE UPDATE ON benefit_wallet_ledgers
        BEGIN
            SELECT RAISE(ABORT, 'benefit_wallet_ledgers is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS benefit_wallet_ledgers_no_delete
        BEFORE DELETE ON benefit_wallet_ledgers
        BEGIN
            SELECT RAISE(ABORT, 'benefit_wallet_ledgers is append-only');
        END;

        -- Consumption: at most one spend per (org, benefit, attempt)
        CREATE TABLE IF NOT EXISTS benefit_consumptions (
            id TEXT PRIMARY KEY,
            org_id INTEGER NOT NULL DEFAULT 0,
            benefit_code TEXT NOT NULL,
            attempt_id TEXT NOT NULL,
            grant_id TEXT,
            order_no TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(org_id, benefit_code, attempt_id)
        );

        -- Generic ingestion dedup
        CREATE TABLE IF NOT EXISTS idempotency_keys (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            external_id TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            hash TEXT NOT NULL,
            batch_id TEXT,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 1,
            UNIQUE(provider, external_id, recorded_at)
        );
        CREATE INDEX IF NOT EXISTS idx_idempotency_keys_batch ON idempotency_keys(provider, batch_id);

        -- Reconciliation snapshots (one per org and day)
        CREATE TABLE IF NOT EXISTS payment_reconcile_snapshots (
            id TEXT PRIMARY KEY,
            org_id INTEGER NOT NULL DEFAULT 0,
            snapshot_date TEXT NOT NULL,
            paid_orders_count INTEGER NOT NULL DEFAULT 0,
            paid_without_benefit_count INTEGER NOT NULL DEFAULT 0,
            benefit_without_report_count INTEGER NOT NULL DEFAULT 0,
            webhook_replay_count INTEGER NOT NULL DEFAULT 0,
            ledger_drift_count INTEGER NOT NULL DEFAULT 0,
            meta_json TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(org_id, snapshot_date)
        );
        "#,
    )?;
    Ok(())
}

/// Initialize the audit log database schema.
/// Separate file so audit growth never competes with ledger writes.
pub fn init_audit_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 1000;
        PRAGMA journal_size_limit = 67108864;

        CREATE TABLE IF NOT EXISTS audit_logs (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            actor_type TEXT NOT NULL
                CHECK (actor_type IN ('provider', 'operator', 'collaborator', 'system')),
            actor_id TEXT,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            details TEXT,
            org_id INTEGER,
            ip_address TEXT,
            user_agent TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_logs_resource ON audit_logs(resource_type, resource_id);
        CREATE INDEX IF NOT EXISTS idx_audit_logs_org ON audit_logs(org_id, timestamp);
        "#,
    )?;
    Ok(())
}
