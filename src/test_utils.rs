//! Test utilities
//!
//! Isolated file-backed databases, fixtures and scripted collaborators shared
//! by the unit tests and the integration tests under `tests/`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use reqwest::StatusCode;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::watch;

use crate::application::coordinator::StartRunRequest;
use crate::application::state::{AppState, Collaborators};
use crate::domain::billing_period::PeriodType;
use crate::domain::entities::{
    Account, AccountId, AccountSyncRow, ExecutionType, Job, JobId, JobType, NewJobExecution,
    SyncOutcome,
};
use crate::domain::job_state::JobStatus;
use crate::domain::run::{OrchestrationRun, PhaseFlags, RunSummaryNotification};
use crate::domain::services::{
    AccountSource, Clock, CredentialCheckRequest, NotificationSink, ProviderError, ProviderReply,
    ScrapeRequest, ScrapingProvider,
};
use crate::infrastructure::config::{AppConfig, DatabaseConfig};
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::provider_client::reply_from;

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid test timestamp")
}

/// Fresh migrated database in its own temporary directory
pub struct TestDatabase {
    pub connection: DatabaseConnection,
    _dir: TempDir,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let connection = DatabaseConnection::new(&dir.path().join("test.db"), &DatabaseConfig::default()).await?;
        connection.migrate().await?;
        Ok(Self {
            connection,
            _dir: dir,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        self.connection.pool()
    }

    /// Inserts a live monthly account directly, bypassing the feed sync.
    pub async fn seed_account(&self, source_key: &str) -> Result<AccountId> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO accounts (source_key, external_id, credential_ref, vendor_code, period_type, created_at, updated_at) \
             VALUES (?, ?, ?, 'VENDOR', 'Monthly', ?, ?)",
        )
        .bind(source_key)
        .bind(format!("EXT-{source_key}"))
        .bind(format!("cred-{source_key}"))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Inserts a job covering the 30 days up to `run_date`.
    pub async fn seed_job(&self, account_id: AccountId, run_date: NaiveDate, status: JobStatus) -> Result<JobId> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO jobs (account_id, job_type, period_start, period_end, run_date, status, created_at, updated_at) \
             VALUES (?, 'Adr', ?, ?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(run_date - Duration::days(30))
        .bind(run_date)
        .bind(run_date)
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }
}

pub fn sync_row(source_key: &str, external_id: &str) -> AccountSyncRow {
    AccountSyncRow {
        source_key: source_key.to_string(),
        external_id: external_id.to_string(),
        credential_ref: Some(format!("cred-{external_id}")),
        vendor_code: "VENDOR".to_string(),
        vendor_name: Some("Vendor".to_string()),
        period_type: PeriodType::Monthly,
        period_days: None,
        median_gap_days: None,
        last_invoice_date: None,
        next_due_date: None,
        is_missing: false,
    }
}

pub fn account_fixture(id: AccountId) -> Account {
    let now = Utc::now();
    Account {
        id,
        source_key: format!("K{id}"),
        external_id: format!("ACC-{id}"),
        credential_ref: Some(format!("cred-{id}")),
        vendor_code: "VENDOR".to_string(),
        vendor_name: None,
        period_type: PeriodType::Monthly,
        period_days: None,
        median_gap_days: None,
        last_invoice_date: None,
        next_due_date: None,
        window_start: None,
        window_end: None,
        is_missing: false,
        is_manually_overridden: false,
        overridden_by: None,
        overridden_at: None,
        is_deleted: false,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn job_fixture(id: JobId, account_id: AccountId, run_date: NaiveDate) -> Job {
    let now = Utc::now();
    Job {
        id,
        account_id,
        rule_id: None,
        job_type: JobType::Adr,
        period_start: run_date - Duration::days(30),
        period_end: run_date,
        run_date,
        status: JobStatus::Pending,
        retry_count: 0,
        credential_failures: 0,
        next_attempt_at: None,
        is_manual_request: false,
        manual_request_reason: None,
        provider_index_id: None,
        last_status_id: None,
        last_status_description: None,
        credential_verified_at: None,
        scrape_requested_at: None,
        completed_at: None,
        is_deleted: false,
        created_at: now,
        updated_at: now,
    }
}

/// A ledger row completed just now
pub fn new_execution(job_id: JobId, execution_type: ExecutionType, is_success: bool) -> NewJobExecution {
    let now = Utc::now();
    NewJobExecution {
        job_id,
        execution_type,
        request_payload: format!(r#"{{"JobId":{job_id}}}"#),
        response_body: Some(r#"{"StatusId":2,"IndexId":42}"#.to_string()),
        http_status: Some(200),
        status_id: is_success.then_some(2),
        index_id: is_success.then_some(42),
        is_success,
        is_error: !is_success,
        is_final: false,
        error_message: (!is_success).then(|| "provider call timed out".to_string()),
        started_at: now,
        completed_at: now,
    }
}

/// Clock that only moves when told to
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

type Reply = Result<ProviderReply, ProviderError>;

pub fn ok_reply(body: &str) -> Reply {
    reply_from(StatusCode::OK, body.to_string())
}

pub fn http_reply(status: u16, body: &str) -> Reply {
    reply_from(StatusCode::from_u16(status).expect("valid status"), body.to_string())
}

/// Provider double with queued replies per operation and call counters.
///
/// With nothing queued every call succeeds: credentials verify, scrapes are
/// accepted with index `1000 + job_id`, and status checks report completion.
pub struct ScriptedProvider {
    credential: Mutex<VecDeque<Reply>>,
    scrape: Mutex<VecDeque<Reply>>,
    status: Mutex<VecDeque<Reply>>,
    credential_calls: AtomicUsize,
    scrape_calls: AtomicUsize,
    status_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            credential: Mutex::new(VecDeque::new()),
            scrape: Mutex::new(VecDeque::new()),
            status: Mutex::new(VecDeque::new()),
            credential_calls: AtomicUsize::new(0),
            scrape_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            gate,
        }
    }
}

impl ScriptedProvider {
    pub fn push_credential(&self, reply: Reply) {
        self.credential.lock().expect("queue lock").push_back(reply);
    }

    pub fn push_scrape(&self, reply: Reply) {
        self.scrape.lock().expect("queue lock").push_back(reply);
    }

    pub fn push_status(&self, reply: Reply) {
        self.status.lock().expect("queue lock").push_back(reply);
    }

    pub fn credential_calls(&self) -> usize {
        self.credential_calls.load(Ordering::SeqCst)
    }

    pub fn scrape_calls(&self) -> usize {
        self.scrape_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were inside the provider at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Calls block after being counted until [`Self::open`] is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    async fn call(&self, counter: &AtomicUsize, queue: &Mutex<VecDeque<Reply>>, fallback: impl FnOnce() -> Reply) -> Reply {
        counter.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        tokio::task::yield_now().await;

        let reply = queue.lock().expect("queue lock").pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply.unwrap_or_else(fallback)
    }
}

#[async_trait]
impl ScrapingProvider for ScriptedProvider {
    async fn verify_credential(&self, _request: &CredentialCheckRequest) -> Reply {
        self.call(&self.credential_calls, &self.credential, || {
            ok_reply(r#"{"StatusId":4,"Status":"Login verified"}"#)
        })
        .await
    }

    async fn request_scrape(&self, request: &ScrapeRequest) -> Reply {
        let index_id = 1000 + request.job_id;
        self.call(&self.scrape_calls, &self.scrape, || {
            ok_reply(&format!(r#"{{"StatusId":2,"Status":"Queued","IndexId":{index_id}}}"#))
        })
        .await
    }

    async fn check_status(&self, index_id: i64) -> Reply {
        self.call(&self.status_calls, &self.status, || {
            ok_reply(&format!(
                r#"{{"StatusId":5,"Status":"Completed - invoice retrieved","IndexId":{index_id}}}"#
            ))
        })
        .await
    }
}

/// Feed double returning whatever rows were last set
#[derive(Default)]
pub struct StaticAccountSource {
    rows: Mutex<Vec<AccountSyncRow>>,
}

impl StaticAccountSource {
    pub fn set_rows(&self, rows: Vec<AccountSyncRow>) {
        *self.rows.lock().expect("rows lock") = rows;
    }
}

#[async_trait]
impl AccountSource for StaticAccountSource {
    async fn fetch_accounts(&self) -> Result<Vec<AccountSyncRow>> {
        Ok(self.rows.lock().expect("rows lock").clone())
    }
}

/// Sink that keeps every summary it is given
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<RunSummaryNotification>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<RunSummaryNotification> {
        self.sent.lock().expect("sink lock").clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, summary: &RunSummaryNotification) -> Result<()> {
        if self.fail {
            return Err(anyhow!("webhook unreachable"));
        }
        self.sent.lock().expect("sink lock").push(summary.clone());
        Ok(())
    }
}

/// Full application wired to scripted collaborators
pub struct TestHarness {
    pub db: TestDatabase,
    pub state: AppState,
    pub clock: Arc<FixedClock>,
    pub provider: Arc<ScriptedProvider>,
    pub source: Arc<StaticAccountSource>,
    pub sink: Arc<RecordingSink>,
}

impl TestHarness {
    /// Harness with default settings and the clock at 2025-03-10 09:00 UTC.
    pub async fn new() -> Result<Self> {
        Self::with_config(AppConfig::default()).await
    }

    pub async fn with_config(config: AppConfig) -> Result<Self> {
        let db = TestDatabase::new().await?;
        let clock = Arc::new(FixedClock::new(at(2025, 3, 10, 9)));
        let provider = Arc::new(ScriptedProvider::default());
        let source = Arc::new(StaticAccountSource::default());
        let sink = Arc::new(RecordingSink::default());

        let state = AppState::from_parts(
            config,
            db.connection.clone(),
            Collaborators {
                provider: provider.clone(),
                source: Some(source.clone()),
                sinks: vec![sink.clone()],
                clock: clock.clone(),
            },
        );

        Ok(Self {
            db,
            state,
            clock,
            provider,
            source,
            sink,
        })
    }

    /// Feeds `rows` to the source and applies them straight away.
    pub async fn sync(&self, rows: &[AccountSyncRow]) -> Result<SyncOutcome> {
        self.source.set_rows(rows.to_vec());
        self.state.accounts.sync_accounts(rows, self.clock.now()).await
    }

    pub async fn live_accounts(&self) -> Result<Vec<Account>> {
        self.state.accounts.find_live().await
    }

    pub async fn jobs_for(&self, account_id: AccountId) -> Result<Vec<Job>> {
        self.state.jobs.find_for_account(account_id).await
    }

    /// Runs the given phases to the end and returns the stored run.
    pub async fn run(&self, flags: PhaseFlags) -> Result<OrchestrationRun> {
        let started = self
            .state
            .coordinator
            .start_run(StartRunRequest {
                flags,
                requested_by: "test".to_string(),
            })
            .await?;
        let run_id = started.run_id;
        started.wait().await?;
        Ok(self.state.coordinator.find_run(run_id).await?)
    }
}
