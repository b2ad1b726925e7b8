// Database connection and pool management
// SQLite through sqlx, WAL journal so readers never block the run writer

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, info};

use crate::infrastructure::config::DatabaseConfig;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_key TEXT NOT NULL UNIQUE,
        external_id TEXT NOT NULL,
        credential_ref TEXT,
        vendor_code TEXT NOT NULL,
        vendor_name TEXT,
        period_type TEXT NOT NULL,
        period_days INTEGER,
        median_gap_days INTEGER,
        last_invoice_date TEXT,
        next_due_date TEXT,
        window_start TEXT,
        window_end TEXT,
        is_missing INTEGER NOT NULL DEFAULT 0,
        is_manually_overridden INTEGER NOT NULL DEFAULT 0,
        overridden_by TEXT,
        overridden_at TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS account_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts (id),
        job_type TEXT NOT NULL,
        is_enabled INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 0,
        anchor_date TEXT,
        anchor_day_of_month INTEGER,
        next_run_date TEXT NOT NULL,
        next_range_start TEXT NOT NULL,
        next_range_end TEXT NOT NULL,
        window_days_before INTEGER,
        window_days_after INTEGER,
        is_manually_overridden INTEGER NOT NULL DEFAULT 0,
        overridden_by TEXT,
        overridden_at TEXT,
        last_advanced_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_account_rules_enabled
        ON account_rules (account_id, job_type) WHERE is_enabled = 1",
    "CREATE INDEX IF NOT EXISTS idx_account_rules_next_run ON account_rules (next_run_date)",
    r"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts (id),
        rule_id INTEGER REFERENCES account_rules (id),
        job_type TEXT NOT NULL,
        period_start TEXT NOT NULL,
        period_end TEXT NOT NULL,
        run_date TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'Pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        credential_failures INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TEXT,
        is_manual_request INTEGER NOT NULL DEFAULT 0,
        manual_request_reason TEXT,
        provider_index_id INTEGER,
        last_status_id INTEGER,
        last_status_description TEXT,
        credential_verified_at TEXT,
        scrape_requested_at TEXT,
        completed_at TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_jobs_live_period
        ON jobs (account_id, period_start, period_end) WHERE is_deleted = 0",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    r"
    CREATE TABLE IF NOT EXISTS job_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs (id),
        execution_type TEXT NOT NULL,
        request_payload TEXT NOT NULL,
        request_hash TEXT NOT NULL,
        response_body TEXT,
        http_status INTEGER,
        status_id INTEGER,
        index_id INTEGER,
        is_success INTEGER NOT NULL,
        is_error INTEGER NOT NULL,
        is_final INTEGER NOT NULL,
        error_message TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_job_executions_job_type
        ON job_executions (job_id, execution_type, id)",
    r"
    CREATE TRIGGER IF NOT EXISTS trg_job_executions_no_update
    BEFORE UPDATE ON job_executions
    BEGIN
        SELECT RAISE(ABORT, 'job_executions is append-only');
    END
    ",
    r"
    CREATE TRIGGER IF NOT EXISTS trg_job_executions_no_delete
    BEFORE DELETE ON job_executions
    BEGIN
        SELECT RAISE(ABORT, 'job_executions is append-only');
    END
    ",
    r"
    CREATE TABLE IF NOT EXISTS orchestration_runs (
        id TEXT PRIMARY KEY,
        requested_by TEXT NOT NULL,
        phase_flags TEXT NOT NULL,
        status TEXT NOT NULL,
        queued_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        current_phase TEXT,
        current_step TEXT,
        processed_items INTEGER NOT NULL DEFAULT 0,
        total_items INTEGER NOT NULL DEFAULT 0,
        phase_results TEXT NOT NULL DEFAULT '[]',
        error_message TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        last_heartbeat_at TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_orchestration_runs_queued ON orchestration_runs (queued_at)",
    r"
    CREATE TABLE IF NOT EXISTS active_run (
        slot INTEGER PRIMARY KEY CHECK (slot = 1),
        run_id TEXT NOT NULL REFERENCES orchestration_runs (id),
        claimed_at TEXT NOT NULL
    )
    ",
];

#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn new(path: &Path, config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        info!(path = %path.display(), "Database connected");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables, indexes and triggers. Safe to run on every start.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Schema statement failed: {}", statement.trim()))?;
        }
        debug!(statements = SCHEMA.len(), "Schema up to date");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
