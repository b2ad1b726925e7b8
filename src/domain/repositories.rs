//! Repository interfaces
//!
//! Storage contracts for accounts, rules, jobs, the execution ledger and
//! orchestration runs. Status changes are compare-and-set so concurrent
//! workers never clobber each other.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::entities::{
    Account, AccountId, AccountRule, AccountScheduleUpdate, AccountSyncRow, CreateJobOutcome,
    ExecutionId, ExecutionType, Job, JobCandidate, JobExecution, JobId, JobType, JobUpdate,
    NewAccountRule, NewJob, NewJobExecution, RuleAdvance, RuleId, ScheduledAccount, SyncOutcome,
};
use crate::domain::job_state::{EligibilityPolicy, JobStatus};
use crate::domain::run::{OrchestrationRun, PhaseFlags, PhaseResult, RunProgress, RunStatus};

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Upserts the feed by `source_key`; absent accounts are soft-deleted and
    /// returning ones restored. Applying the same rows twice changes nothing.
    async fn sync_accounts(&self, rows: &[AccountSyncRow], now: DateTime<Utc>) -> Result<SyncOutcome>;
    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>>;
    async fn find_live(&self) -> Result<Vec<Account>>;
    /// Sets or clears the account override flag.
    async fn set_override(&self, id: AccountId, overridden_by: Option<&str>, now: DateTime<Utc>) -> Result<bool>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create_rule(&self, rule: &NewAccountRule, now: DateTime<Utc>) -> Result<RuleId>;
    async fn find_by_id(&self, id: RuleId) -> Result<Option<AccountRule>>;
    async fn find_enabled(&self, account_id: AccountId, job_type: JobType) -> Result<Option<AccountRule>>;
    async fn accounts_without_enabled_rule(&self, job_type: JobType) -> Result<Vec<Account>>;
    /// Enabled rules on live accounts with `next_run_date <= today`.
    async fn find_due(&self, today: NaiveDate, job_type: JobType) -> Result<Vec<ScheduledAccount>>;
    /// Enabled rules on live accounts with `today < next_run_date <= today + lead_days`.
    async fn find_upcoming(&self, today: NaiveDate, lead_days: i64, job_type: JobType) -> Result<Vec<ScheduledAccount>>;
    /// Moves the rule and the account schedule together.
    async fn apply_advance(
        &self,
        rule_id: RuleId,
        advance: &RuleAdvance,
        account: &AccountScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_override(&self, id: RuleId, overridden_by: Option<&str>, now: DateTime<Utc>) -> Result<bool>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Inserts unless a live job already covers (account, start, end).
    async fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<CreateJobOutcome>;
    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>>;
    async fn find_candidate(&self, id: JobId) -> Result<Option<JobCandidate>>;
    async fn find_for_account(&self, account_id: AccountId) -> Result<Vec<Job>>;
    async fn credential_check_candidates(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
        policy: &EligibilityPolicy,
    ) -> Result<Vec<JobCandidate>>;
    async fn scrape_candidates(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
        policy: &EligibilityPolicy,
    ) -> Result<Vec<JobCandidate>>;
    async fn status_check_candidates(&self) -> Result<Vec<JobCandidate>>;
    async fn stale_candidates(&self, today: NaiveDate, stale_grace_days: i64) -> Result<Vec<JobCandidate>>;
    /// Compare-and-set status change. Returns false when the job was no
    /// longer in `from`.
    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn append(&self, execution: &NewJobExecution) -> Result<ExecutionId>;
    async fn latest(&self, job_id: JobId, execution_type: ExecutionType) -> Result<Option<JobExecution>>;
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<JobExecution>>;
}

/// Result of trying to take the single active-run slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunClaim {
    Claimed,
    Conflict { active_run_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: Uuid,
    pub requested_by: String,
    pub phase_flags: PhaseFlags,
    pub queued_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Inserts the run as Queued and claims the active slot in one
    /// transaction. Nothing is written on conflict.
    async fn try_claim(&self, run: &NewRun) -> Result<RunClaim>;
    /// Moves a Queued run to Running. False if it is no longer Queued.
    async fn mark_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    /// Writes progress and bumps the heartbeat. False once the run is no
    /// longer active or no longer holds the slot.
    async fn update_progress(&self, id: Uuid, progress: &RunProgress, now: DateTime<Utc>) -> Result<bool>;
    async fn save_phase_results(&self, id: Uuid, results: &[PhaseResult], now: DateTime<Utc>) -> Result<()>;
    async fn request_cancel(&self, id: Uuid) -> Result<bool>;
    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool>;
    /// Writes the final status and releases the active slot together.
    /// False if the run had already been finished or failed elsewhere, in
    /// which case the stored status is left alone.
    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        results: &[PhaseResult],
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Fails active runs whose last sign of life is before `seen_before`
    /// and frees the slot. Returns the ids that were failed.
    async fn fail_abandoned(
        &self,
        seen_before: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<OrchestrationRun>>;
    async fn find_active(&self) -> Result<Option<OrchestrationRun>>;
    async fn find_recent(&self, limit: u32) -> Result<Vec<OrchestrationRun>>;
}
