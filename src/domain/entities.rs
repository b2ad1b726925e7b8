//! Domain entities
//!
//! Plain data for accounts, their scheduling rules, jobs and the execution
//! ledger. Behavior lives in the calculator, state machine and scheduler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::billing_period::PeriodType;
use crate::domain::job_state::JobStatus;

pub type AccountId = i64;
pub type RuleId = i64;
pub type JobId = i64;
pub type ExecutionId = i64;

/// Kind of retrieval a rule schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Automated invoice retrieval
    Adr,
}

impl JobType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Adr => "Adr",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Adr" | "ADR" => Ok(Self::Adr),
            other => Err(format!("Invalid JobType: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Stable key from the source-of-truth feed
    pub source_key: String,
    /// Account number at the vendor; may be reused or duplicated over time
    pub external_id: String,
    pub credential_ref: Option<String>,
    pub vendor_code: String,
    pub vendor_name: Option<String>,
    pub period_type: PeriodType,
    pub period_days: Option<i64>,
    pub median_gap_days: Option<i64>,
    pub last_invoice_date: Option<NaiveDate>,
    pub next_due_date: Option<NaiveDate>,
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub is_missing: bool,
    pub is_manually_overridden: bool,
    pub overridden_by: Option<String>,
    pub overridden_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row from the account source-of-truth feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSyncRow {
    pub source_key: String,
    pub external_id: String,
    #[serde(default)]
    pub credential_ref: Option<String>,
    pub vendor_code: String,
    #[serde(default)]
    pub vendor_name: Option<String>,
    pub period_type: PeriodType,
    #[serde(default)]
    pub period_days: Option<i64>,
    #[serde(default)]
    pub median_gap_days: Option<i64>,
    #[serde(default)]
    pub last_invoice_date: Option<NaiveDate>,
    #[serde(default)]
    pub next_due_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_missing: bool,
}

/// Result tallies of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub marked_deleted: u64,
    pub restored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRule {
    pub id: RuleId,
    pub account_id: AccountId,
    pub job_type: JobType,
    pub is_enabled: bool,
    pub priority: i64,
    pub anchor_date: Option<NaiveDate>,
    pub anchor_day_of_month: Option<u32>,
    pub next_run_date: NaiveDate,
    pub next_range_start: NaiveDate,
    pub next_range_end: NaiveDate,
    pub window_days_before: Option<i64>,
    pub window_days_after: Option<i64>,
    pub is_manually_overridden: bool,
    pub overridden_by: Option<String>,
    pub overridden_at: Option<DateTime<Utc>>,
    pub last_advanced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRule {
    /// Window widths, falling back to the cadence defaults.
    pub fn window_days(&self, period: PeriodType) -> (i64, i64) {
        let (before, after) = period.default_window_days();
        (
            self.window_days_before.unwrap_or(before),
            self.window_days_after.unwrap_or(after),
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewAccountRule {
    pub account_id: AccountId,
    pub job_type: JobType,
    pub priority: i64,
    pub anchor_date: Option<NaiveDate>,
    pub anchor_day_of_month: Option<u32>,
    pub next_run_date: NaiveDate,
    pub next_range_start: NaiveDate,
    pub next_range_end: NaiveDate,
}

/// New schedule position written by the rule scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleAdvance {
    pub anchor_date: NaiveDate,
    pub next_run_date: NaiveDate,
    pub next_range_start: NaiveDate,
    pub next_range_end: NaiveDate,
}

/// An enabled rule joined with the account it schedules
#[derive(Debug, Clone)]
pub struct ScheduledAccount {
    pub rule: AccountRule,
    pub account: Account,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub account_id: AccountId,
    pub rule_id: Option<RuleId>,
    pub job_type: JobType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub run_date: NaiveDate,
    pub status: JobStatus,
    /// Failed scrape attempts; bounds scraping only
    pub retry_count: u32,
    /// Failed credential checks; bounds early checks only
    pub credential_failures: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub is_manual_request: bool,
    pub manual_request_reason: Option<String>,
    pub provider_index_id: Option<i64>,
    pub last_status_id: Option<i64>,
    pub last_status_description: Option<String>,
    pub credential_verified_at: Option<DateTime<Utc>>,
    pub scrape_requested_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Date the retrieval actually went out, for anchoring the next cycle.
    pub fn actual_run_date(&self) -> Option<NaiveDate> {
        self.scrape_requested_at
            .or(self.completed_at)
            .map(|at| at.date_naive())
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub account_id: AccountId,
    pub rule_id: Option<RuleId>,
    pub job_type: JobType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub run_date: NaiveDate,
    pub is_manual_request: bool,
    pub manual_request_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateJobOutcome {
    Created(JobId),
    /// A live job already covers the same account and period
    Skipped,
}

/// Field changes that ride along with a status transition
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub retry_count: Option<u32>,
    pub credential_failures: Option<u32>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub provider_index_id: Option<i64>,
    pub last_status_id: Option<i64>,
    pub last_status_description: Option<String>,
    pub credential_verified_at: Option<DateTime<Utc>>,
    pub scrape_requested_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Billable (or at least externally visible) call kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionType {
    CredentialCheck,
    ScrapeRequest,
    StatusCheck,
}

impl ExecutionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CredentialCheck => "CredentialCheck",
            Self::ScrapeRequest => "ScrapeRequest",
            Self::StatusCheck => "StatusCheck",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CredentialCheck" => Ok(Self::CredentialCheck),
            "ScrapeRequest" => Ok(Self::ScrapeRequest),
            "StatusCheck" => Ok(Self::StatusCheck),
            other => Err(format!("Invalid ExecutionType: {other}")),
        }
    }
}

/// Immutable ledger row for one external attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub execution_type: ExecutionType,
    pub request_payload: String,
    pub request_hash: String,
    pub response_body: Option<String>,
    pub http_status: Option<u16>,
    pub status_id: Option<i64>,
    pub index_id: Option<i64>,
    pub is_success: bool,
    pub is_error: bool,
    pub is_final: bool,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJobExecution {
    pub job_id: JobId,
    pub execution_type: ExecutionType,
    pub request_payload: String,
    pub response_body: Option<String>,
    pub http_status: Option<u16>,
    pub status_id: Option<i64>,
    pub index_id: Option<i64>,
    pub is_success: bool,
    pub is_error: bool,
    pub is_final: bool,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl NewJobExecution {
    /// Content hash of the request, for spotting replays in the ledger.
    pub fn request_hash(&self) -> String {
        blake3::hash(self.request_payload.as_bytes()).to_hex().to_string()
    }
}

/// A job together with the account it belongs to
#[derive(Debug, Clone)]
pub struct JobCandidate {
    pub job: Job,
    pub account: Account,
}

/// Account-side fields written alongside a rule advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountScheduleUpdate {
    pub next_due_date: NaiveDate,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Set when a retrieval completed successfully
    pub last_invoice_date: Option<NaiveDate>,
}
