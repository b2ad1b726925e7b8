//! Phase executor
//!
//! One method per unit of work in each pipeline phase. Every method takes a
//! single item, re-checks its guard, consults the ledger, makes at most one
//! provider call, records it and moves the job with a compare-and-set. The
//! coordinator decides how many of these run at once.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::application::idempotency::{IdempotencyLedger, LedgerDecision};
use crate::application::rule_scheduler::{AdvanceOutcome, RuleScheduler};
use crate::domain::entities::{
    Account, AccountRule, CreateJobOutcome, ExecutionType, Job, JobCandidate, JobUpdate, NewJob,
    NewJobExecution, ScheduledAccount,
};
use crate::domain::job_state::{
    EligibilityPolicy, FinalOutcome, JobEvent, JobStatus, credential_check_eligible, is_stale,
    scrape_eligible, status_check_eligible,
};
use crate::domain::provider_response::ParsedResponse;
use crate::domain::repositories::{AccountRepository, JobRepository};
use crate::domain::run::PhaseResult;
use crate::domain::services::{
    AccountSource, Clock, CredentialCheckRequest, ProviderError, ProviderReply, ScrapeRequest,
    ScrapingProvider,
};
use crate::domain::status_codes::{StatusCategory, StatusCodeTable};

/// Something a phase processes, with a label for logs and error lists.
pub trait WorkItem: Send + 'static {
    fn label(&self) -> String;
}

impl WorkItem for JobCandidate {
    fn label(&self) -> String {
        format!("job {} (account {})", self.job.id, self.account.external_id)
    }
}

impl WorkItem for ScheduledAccount {
    fn label(&self) -> String {
        format!("rule {} (account {})", self.rule.id, self.account.external_id)
    }
}

/// What happened to one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded { counter: &'static str },
    /// A recorded attempt stood in for the provider call
    Reused,
    Skipped { counter: &'static str },
    Failed { counter: &'static str, message: String },
}

/// Folds one item outcome into the phase tallies.
pub fn tally(result: &mut PhaseResult, label: &str, outcome: Result<ItemOutcome>, max_errors: usize) {
    match outcome {
        Ok(ItemOutcome::Succeeded { counter }) => {
            result.succeeded += 1;
            result.bump(counter);
        }
        Ok(ItemOutcome::Reused) => {
            result.reused += 1;
            result.bump("reused");
        }
        Ok(ItemOutcome::Skipped { counter }) => {
            result.skipped += 1;
            result.bump(counter);
        }
        Ok(ItemOutcome::Failed { counter, message }) => {
            result.failed += 1;
            result.bump(counter);
            result.push_error(format!("{label}: {message}"), max_errors);
        }
        Err(e) => {
            warn!(item = label, error = %e, "Item failed");
            result.failed += 1;
            result.bump("errors");
            result.push_error(format!("{label}: {e:#}"), max_errors);
        }
    }
}

const fn skipped(counter: &'static str) -> ItemOutcome {
    ItemOutcome::Skipped { counter }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialVerdict {
    Verified,
    Rejected(String),
    Transient(String),
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeVerdict {
    Accepted { index_id: Option<i64> },
    Final(FinalOutcome, String),
    Transient(String),
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusVerdict {
    Final(FinalOutcome),
    Waiting,
    Malformed(String),
}

/// 408, 429 and 5xx are worth retrying; so is anything outside 4xx.
const fn http_is_transient(http_status: u16) -> bool {
    !matches!(http_status, 400..=499) || http_status == 408 || http_status == 429
}

fn http_message(http_status: u16, message: &str) -> String {
    format!("HTTP {http_status}: {message}")
}

fn call_failure(error: &ProviderError) -> Result<String, String> {
    match error {
        ProviderError::UnexpectedFormat { body, .. } => Err(body.clone()),
        other => Ok(other.to_string()),
    }
}

pub fn interpret_credential(
    table: &StatusCodeTable,
    result: &Result<ProviderReply, ProviderError>,
) -> CredentialVerdict {
    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            return match call_failure(e) {
                Ok(message) => CredentialVerdict::Transient(message),
                Err(body) => CredentialVerdict::Malformed(body),
            };
        }
    };

    match &reply.parsed {
        ParsedResponse::Structured(status) => match table.classify(status.status_id) {
            Some(entry) => match entry.category {
                StatusCategory::Accepted | StatusCategory::Completed => CredentialVerdict::Verified,
                StatusCategory::CredentialError | StatusCategory::NeedsReview => {
                    CredentialVerdict::Rejected(entry.description.clone())
                }
                StatusCategory::ProviderError if entry.is_final => {
                    CredentialVerdict::Rejected(entry.description.clone())
                }
                StatusCategory::ProviderError => {
                    CredentialVerdict::Transient(entry.description.clone())
                }
            },
            None => CredentialVerdict::Transient(format!("unknown status {}", status.status_id)),
        },
        ParsedResponse::IndexOnly(_) | ParsedResponse::Empty => CredentialVerdict::Verified,
        ParsedResponse::Error {
            http_status,
            index_id,
            message,
        } => {
            let message = http_message(*http_status, message);
            if index_id.is_some() || http_is_transient(*http_status) {
                CredentialVerdict::Transient(message)
            } else {
                CredentialVerdict::Rejected(message)
            }
        }
    }
}

pub fn interpret_scrape(
    table: &StatusCodeTable,
    result: &Result<ProviderReply, ProviderError>,
) -> ScrapeVerdict {
    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            return match call_failure(e) {
                Ok(message) => ScrapeVerdict::Transient(message),
                Err(body) => ScrapeVerdict::Malformed(body),
            };
        }
    };

    match &reply.parsed {
        ParsedResponse::Structured(status) => match table.classify(status.status_id) {
            Some(entry) => match entry.category {
                StatusCategory::Accepted | StatusCategory::Completed => ScrapeVerdict::Accepted {
                    index_id: status.index_id,
                },
                StatusCategory::CredentialError | StatusCategory::NeedsReview => {
                    ScrapeVerdict::Final(FinalOutcome::NeedsReview, entry.description.clone())
                }
                StatusCategory::ProviderError if entry.is_final => {
                    ScrapeVerdict::Final(FinalOutcome::Failed, entry.description.clone())
                }
                StatusCategory::ProviderError => ScrapeVerdict::Transient(entry.description.clone()),
            },
            None => match status.index_id {
                Some(index_id) => ScrapeVerdict::Accepted {
                    index_id: Some(index_id),
                },
                None => ScrapeVerdict::Transient(format!("unknown status {}", status.status_id)),
            },
        },
        ParsedResponse::IndexOnly(index_id) => ScrapeVerdict::Accepted {
            index_id: Some(*index_id),
        },
        ParsedResponse::Empty => ScrapeVerdict::Accepted { index_id: None },
        ParsedResponse::Error {
            http_status,
            index_id: Some(index_id),
            ..
        } => {
            debug!(http_status, index_id, "Provider errored but kept the request");
            ScrapeVerdict::Accepted {
                index_id: Some(*index_id),
            }
        }
        ParsedResponse::Error {
            http_status,
            index_id: None,
            message,
        } => {
            let message = http_message(*http_status, message);
            if http_is_transient(*http_status) {
                ScrapeVerdict::Transient(message)
            } else {
                ScrapeVerdict::Final(FinalOutcome::Failed, message)
            }
        }
    }
}

pub fn interpret_status(
    table: &StatusCodeTable,
    result: &Result<ProviderReply, ProviderError>,
) -> StatusVerdict {
    let reply = match result {
        Ok(reply) => reply,
        Err(ProviderError::UnexpectedFormat { body, .. }) => {
            return StatusVerdict::Malformed(body.clone());
        }
        Err(_) => return StatusVerdict::Waiting,
    };

    let ParsedResponse::Structured(status) = &reply.parsed else {
        return StatusVerdict::Waiting;
    };
    match table.classify(status.status_id) {
        Some(entry) if entry.is_final => StatusVerdict::Final(match entry.category {
            StatusCategory::Accepted | StatusCategory::Completed => FinalOutcome::Completed,
            StatusCategory::CredentialError | StatusCategory::NeedsReview => {
                FinalOutcome::NeedsReview
            }
            StatusCategory::ProviderError => FinalOutcome::Failed,
        }),
        _ => StatusVerdict::Waiting,
    }
}

/// Collaborators the executor needs
pub struct PhaseDependencies {
    pub accounts: Arc<dyn AccountRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub ledger: IdempotencyLedger,
    pub scheduler: RuleScheduler,
    pub provider: Arc<dyn ScrapingProvider>,
    pub source: Option<Arc<dyn AccountSource>>,
    pub status_codes: StatusCodeTable,
    pub policy: EligibilityPolicy,
    pub clock: Arc<dyn Clock>,
}

pub struct PhaseExecutor {
    accounts: Arc<dyn AccountRepository>,
    jobs: Arc<dyn JobRepository>,
    ledger: IdempotencyLedger,
    scheduler: RuleScheduler,
    provider: Arc<dyn ScrapingProvider>,
    source: Option<Arc<dyn AccountSource>>,
    status_codes: StatusCodeTable,
    policy: EligibilityPolicy,
    clock: Arc<dyn Clock>,
}

/// Fields common to every ledger row of one call
struct CallContext {
    job_id: i64,
    execution_type: ExecutionType,
    payload: String,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl CallContext {
    fn execution(
        self,
        result: &Result<ProviderReply, ProviderError>,
        is_success: bool,
        is_final: bool,
        error_message: Option<String>,
    ) -> NewJobExecution {
        let (response_body, http_status, status_id, index_id) = match result {
            Ok(reply) => (
                Some(reply.raw_body.clone()),
                Some(reply.http_status),
                reply.parsed.status_id(),
                reply.parsed.index_id(),
            ),
            Err(ProviderError::UnexpectedFormat { http_status, body }) => {
                (Some(body.clone()), Some(*http_status), None, None)
            }
            Err(_) => (None, None, None, None),
        };

        NewJobExecution {
            job_id: self.job_id,
            execution_type: self.execution_type,
            request_payload: self.payload,
            response_body,
            http_status,
            status_id,
            index_id,
            is_success,
            is_error: error_message.is_some(),
            is_final,
            error_message,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Where an in-progress job goes back to when its call fails
fn rollback_target(prior: JobStatus) -> JobStatus {
    if prior.is_in_progress() {
        prior.default_rollback().unwrap_or(prior)
    } else {
        prior
    }
}

fn status_fields(table: &StatusCodeTable, result: &Result<ProviderReply, ProviderError>) -> JobUpdate {
    let Ok(ProviderReply {
        parsed: ParsedResponse::Structured(status),
        ..
    }) = result
    else {
        return JobUpdate::default();
    };
    JobUpdate {
        last_status_id: Some(status.status_id),
        last_status_description: Some(
            status
                .description
                .clone()
                .unwrap_or_else(|| table.describe(status.status_id)),
        ),
        ..JobUpdate::default()
    }
}

impl PhaseExecutor {
    pub fn new(deps: PhaseDependencies) -> Self {
        Self {
            accounts: deps.accounts,
            jobs: deps.jobs,
            ledger: deps.ledger,
            scheduler: deps.scheduler,
            provider: deps.provider,
            source: deps.source,
            status_codes: deps.status_codes,
            policy: deps.policy,
            clock: deps.clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn retry_update(&self, job: &Job, now: DateTime<Utc>, base: JobUpdate) -> JobUpdate {
        let attempt = job.retry_count + 1;
        JobUpdate {
            retry_count: Some(attempt),
            next_attempt_at: Some(Some(self.policy.retry.next_attempt_at(now, attempt))),
            ..base
        }
    }

    /// Credential failures count separately so they never eat into the
    /// scrape budget for the run date.
    fn credential_retry_update(&self, job: &Job, now: DateTime<Utc>, base: JobUpdate) -> JobUpdate {
        let attempt = job.credential_failures + 1;
        JobUpdate {
            credential_failures: Some(attempt),
            next_attempt_at: Some(Some(self.policy.retry.next_attempt_at(now, attempt))),
            ..base
        }
    }

    async fn move_job(&self, job: &Job, from: JobStatus, event: JobEvent, update: &JobUpdate) -> Result<bool> {
        let to = from.apply(event)?;
        self.jobs.transition(job.id, from, to, update, self.clock.now()).await
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Pulls the account feed, applies it, then backfills missing rules.
    pub async fn sync_accounts(&self, result: &mut PhaseResult, max_errors: usize) -> Result<()> {
        let Some(source) = &self.source else {
            warn!("No account feed configured, skipping sync");
            result.bump("no_feed");
            return Ok(());
        };

        let rows = source.fetch_accounts().await.context("Account feed unavailable")?;
        let now = self.clock.now();
        let outcome = self.accounts.sync_accounts(&rows, now).await?;
        result.total_items = rows.len() as u64;
        result.succeeded = rows.len() as u64;
        result.add("inserted", outcome.inserted);
        result.add("updated", outcome.updated);
        result.add("unchanged", outcome.unchanged);
        result.add("marked_deleted", outcome.marked_deleted);
        result.add("restored", outcome.restored);
        info!(
            rows = rows.len(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            marked_deleted = outcome.marked_deleted,
            restored = outcome.restored,
            "Accounts synced"
        );

        let today = now.date_naive();
        for account in self.scheduler.accounts_without_rule().await? {
            match self.scheduler.ensure_rule(&account, today, now).await {
                Ok(Some(_)) => result.bump("rules_created"),
                Ok(None) => {}
                Err(e) => {
                    warn!(account_id = account.id, error = %e, "Could not backfill rule");
                    result.failed += 1;
                    result.push_error(format!("account {}: {e:#}", account.external_id), max_errors);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // CreateJobs
    // ------------------------------------------------------------------

    pub async fn create_job_items(&self) -> Result<Vec<ScheduledAccount>> {
        self.scheduler
            .rules_within_horizon(self.clock.today(), self.policy.credential_lead_days)
            .await
    }

    pub async fn create_job(&self, scheduled: ScheduledAccount) -> Result<ItemOutcome> {
        let ScheduledAccount { rule, account } = scheduled;
        let job = NewJob {
            account_id: account.id,
            rule_id: Some(rule.id),
            job_type: rule.job_type,
            period_start: rule.next_range_start,
            period_end: rule.next_range_end,
            run_date: rule.next_run_date,
            is_manual_request: false,
            manual_request_reason: None,
        };

        match self.jobs.create_job(&job, self.clock.now()).await? {
            CreateJobOutcome::Created(job_id) => {
                debug!(job_id, account_id = account.id, run_date = %job.run_date, "Job created");
                Ok(ItemOutcome::Succeeded { counter: "created" })
            }
            CreateJobOutcome::Skipped => self.repair_finished_cycle(&rule, &account).await,
        }
    }

    /// A finished job for the rule's current period means the rule missed
    /// its advance (e.g. the process died in between); move it on now.
    async fn repair_finished_cycle(&self, rule: &AccountRule, account: &Account) -> Result<ItemOutcome> {
        let finished = self
            .jobs
            .find_for_account(account.id)
            .await?
            .into_iter()
            .find(|job| {
                !job.is_deleted
                    && job.period_start == rule.next_range_start
                    && job.period_end == rule.next_range_end
                    && job.status.is_terminal()
            });

        let Some(job) = finished else {
            return Ok(skipped("already_exists"));
        };

        let now = self.clock.now();
        let retrieved = job.status == JobStatus::Completed;
        self.advance_with_rule(rule, &job, account, retrieved, now).await?;
        info!(rule_id = rule.id, job_id = job.id, "Advanced rule left behind a finished job");
        Ok(skipped("rule_repaired"))
    }

    // ------------------------------------------------------------------
    // VerifyCredentials
    // ------------------------------------------------------------------

    pub async fn credential_items(&self) -> Result<Vec<JobCandidate>> {
        let now = self.clock.now();
        self.jobs
            .credential_check_candidates(now.date_naive(), now, &self.policy)
            .await
    }

    pub async fn verify_credential(&self, candidate: JobCandidate) -> Result<ItemOutcome> {
        let JobCandidate { job, account } = candidate;
        let now = self.clock.now();
        if !credential_check_eligible(&job, now.date_naive(), now, &self.policy) {
            return Ok(skipped("ineligible"));
        }

        match self.ledger.check(job.id, ExecutionType::CredentialCheck, now).await? {
            LedgerDecision::Reuse(execution) => {
                let verified = job
                    .status
                    .apply(JobEvent::BeginCredentialCheck)?
                    .apply(JobEvent::CredentialAccepted)?;
                let update = JobUpdate {
                    credential_verified_at: Some(execution.completed_at),
                    next_attempt_at: Some(None),
                    ..JobUpdate::default()
                };
                let moved = self.jobs.transition(job.id, job.status, verified, &update, now).await?;
                return Ok(if moved { ItemOutcome::Reused } else { skipped("contended") });
            }
            LedgerDecision::Proceed => {}
        }

        let rollback = rollback_target(job.status);
        if !self
            .move_job(&job, job.status, JobEvent::BeginCredentialCheck, &JobUpdate::default())
            .await?
        {
            return Ok(skipped("contended"));
        }
        let in_progress = JobStatus::CredentialCheckInProgress;

        let request = CredentialCheckRequest::for_job(&job, &account);
        let payload = serde_json::to_string(&request)?;
        let started_at = self.clock.now();
        let result = self.provider.verify_credential(&request).await;
        let completed_at = self.clock.now();

        let verdict = interpret_credential(&self.status_codes, &result);
        let call = CallContext {
            job_id: job.id,
            execution_type: ExecutionType::CredentialCheck,
            payload,
            started_at,
            completed_at,
        };
        let base = status_fields(&self.status_codes, &result);

        let (execution, event, update, outcome) = match verdict {
            CredentialVerdict::Verified => (
                call.execution(&result, true, false, None),
                JobEvent::CredentialAccepted,
                JobUpdate {
                    credential_verified_at: Some(completed_at),
                    next_attempt_at: Some(None),
                    ..base
                },
                ItemOutcome::Succeeded { counter: "verified" },
            ),
            CredentialVerdict::Rejected(message) => (
                call.execution(&result, false, true, None),
                JobEvent::CredentialRejected,
                self.credential_retry_update(&job, completed_at, base),
                ItemOutcome::Failed {
                    counter: "credential_failed",
                    message: format!("credential rejected: {message}"),
                },
            ),
            CredentialVerdict::Transient(message) => (
                call.execution(&result, false, false, Some(message.clone())),
                JobEvent::RollBack(rollback),
                self.credential_retry_update(&job, completed_at, base),
                ItemOutcome::Failed {
                    counter: "transient",
                    message: format!("credential check will be retried: {message}"),
                },
            ),
            CredentialVerdict::Malformed(body) => (
                call.execution(&result, false, false, Some("unexpected response format".into())),
                JobEvent::RollBack(rollback),
                self.credential_retry_update(&job, completed_at, base),
                ItemOutcome::Failed {
                    counter: "unexpected_format",
                    message: format!("unexpected credential response: {}", truncate(&body)),
                },
            ),
        };

        self.ledger.record(&execution).await?;
        if !self.move_job(&job, in_progress, event, &update).await? {
            warn!(job_id = job.id, "Job moved during credential check, result recorded only");
            return Ok(skipped("contended"));
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Scrape
    // ------------------------------------------------------------------

    pub async fn scrape_items(&self) -> Result<Vec<JobCandidate>> {
        let now = self.clock.now();
        self.jobs.scrape_candidates(now.date_naive(), now, &self.policy).await
    }

    pub async fn request_scrape(&self, candidate: JobCandidate) -> Result<ItemOutcome> {
        let JobCandidate { job, account } = candidate;
        let now = self.clock.now();
        let today = now.date_naive();
        if !scrape_eligible(&job, account.is_missing, today, now, &self.policy) {
            return Ok(skipped("ineligible"));
        }

        match self.ledger.check(job.id, ExecutionType::ScrapeRequest, now).await? {
            LedgerDecision::Reuse(execution) => {
                let requested = job
                    .status
                    .apply(JobEvent::BeginScrape)?
                    .apply(JobEvent::ScrapeAccepted)?;
                let update = JobUpdate {
                    provider_index_id: execution.index_id,
                    scrape_requested_at: Some(execution.completed_at),
                    next_attempt_at: Some(None),
                    ..JobUpdate::default()
                };
                let moved = self.jobs.transition(job.id, job.status, requested, &update, now).await?;
                return Ok(if moved { ItemOutcome::Reused } else { skipped("contended") });
            }
            LedgerDecision::Proceed => {}
        }

        let rollback = rollback_target(job.status);
        if !self
            .move_job(&job, job.status, JobEvent::BeginScrape, &JobUpdate::default())
            .await?
        {
            return Ok(skipped("contended"));
        }
        let in_progress = JobStatus::ScrapeInProgress;

        let request = ScrapeRequest::for_job(&job, &account);
        let payload = serde_json::to_string(&request)?;
        let started_at = self.clock.now();
        let result = self.provider.request_scrape(&request).await;
        let completed_at = self.clock.now();

        let verdict = interpret_scrape(&self.status_codes, &result);
        let call = CallContext {
            job_id: job.id,
            execution_type: ExecutionType::ScrapeRequest,
            payload,
            started_at,
            completed_at,
        };
        let base = status_fields(&self.status_codes, &result);

        match verdict {
            ScrapeVerdict::Accepted { index_id } => {
                self.ledger.record(&call.execution(&result, true, false, None)).await?;
                let update = JobUpdate {
                    provider_index_id: index_id,
                    scrape_requested_at: Some(completed_at),
                    next_attempt_at: Some(None),
                    ..base
                };
                if !self.move_job(&job, in_progress, JobEvent::ScrapeAccepted, &update).await? {
                    return Ok(skipped("contended"));
                }
                if index_id.is_none() {
                    warn!(job_id = job.id, "Scrape accepted without an index id");
                }
                Ok(ItemOutcome::Succeeded { counter: "requested" })
            }
            ScrapeVerdict::Final(outcome, message) => {
                self.ledger.record(&call.execution(&result, false, true, None)).await?;
                let update = JobUpdate {
                    completed_at: Some(completed_at),
                    ..base
                };
                if !self.move_job(&job, in_progress, JobEvent::Finalize(outcome), &update).await? {
                    return Ok(skipped("contended"));
                }
                self.advance_schedule(&job, &account, false, completed_at).await?;
                Ok(ItemOutcome::Failed {
                    counter: match outcome {
                        FinalOutcome::NeedsReview => "needs_review",
                        _ => "permanent_failure",
                    },
                    message: format!("scrape ended as {}: {message}", outcome.status()),
                })
            }
            ScrapeVerdict::Transient(message) => {
                self.ledger
                    .record(&call.execution(&result, false, false, Some(message.clone())))
                    .await?;
                let update = self.retry_update(&job, completed_at, base);
                if !self.move_job(&job, in_progress, JobEvent::RollBack(rollback), &update).await? {
                    return Ok(skipped("contended"));
                }
                Ok(ItemOutcome::Failed {
                    counter: "transient",
                    message: format!("scrape request will be retried: {message}"),
                })
            }
            ScrapeVerdict::Malformed(body) => {
                self.ledger
                    .record(&call.execution(&result, false, false, Some("unexpected response format".into())))
                    .await?;
                let update = self.retry_update(&job, completed_at, base);
                if !self.move_job(&job, in_progress, JobEvent::RollBack(rollback), &update).await? {
                    return Ok(skipped("contended"));
                }
                Ok(ItemOutcome::Failed {
                    counter: "unexpected_format",
                    message: format!("unexpected scrape response: {}", truncate(&body)),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // CheckStatuses
    // ------------------------------------------------------------------

    pub async fn stale_items(&self) -> Result<Vec<JobCandidate>> {
        self.jobs
            .stale_candidates(self.clock.today(), self.policy.stale_grace_days)
            .await
    }

    /// Cancels a job whose billing period is long gone and moves its rule on.
    pub async fn cancel_stale(&self, candidate: JobCandidate) -> Result<ItemOutcome> {
        let JobCandidate { job, account } = candidate;
        let now = self.clock.now();
        if !is_stale(&job, now.date_naive(), &self.policy) {
            return Ok(skipped("ineligible"));
        }

        if !self
            .move_job(&job, job.status, JobEvent::ForceCancel, &JobUpdate::default())
            .await?
        {
            return Ok(skipped("contended"));
        }
        self.advance_schedule(&job, &account, false, now).await?;
        info!(job_id = job.id, status = %job.status, period_end = %job.period_end, "Stale job cancelled");
        Ok(ItemOutcome::Failed {
            counter: "stale_cancelled",
            message: format!(
                "cancelled as stale in {} (period ended {})",
                job.status, job.period_end
            ),
        })
    }

    pub async fn status_items(&self) -> Result<Vec<JobCandidate>> {
        self.jobs.status_check_candidates().await
    }

    pub async fn check_status(&self, candidate: JobCandidate) -> Result<ItemOutcome> {
        let JobCandidate { job, account } = candidate;
        if !status_check_eligible(&job) {
            return Ok(skipped("ineligible"));
        }
        let Some(index_id) = job.provider_index_id else {
            debug!(job_id = job.id, "No provider index id to poll");
            return Ok(skipped("missing_index"));
        };

        if !self
            .move_job(&job, job.status, JobEvent::BeginStatusCheck, &JobUpdate::default())
            .await?
        {
            return Ok(skipped("contended"));
        }
        let in_progress = JobStatus::StatusCheckInProgress;

        let payload = serde_json::json!({ "IndexId": index_id }).to_string();
        let started_at = self.clock.now();
        let result = self.provider.check_status(index_id).await;
        let completed_at = self.clock.now();

        let verdict = interpret_status(&self.status_codes, &result);
        let call = CallContext {
            job_id: job.id,
            execution_type: ExecutionType::StatusCheck,
            payload,
            started_at,
            completed_at,
        };
        let base = status_fields(&self.status_codes, &result);

        match verdict {
            StatusVerdict::Final(outcome) => {
                self.ledger
                    .record(&call.execution(&result, outcome == FinalOutcome::Completed, true, None))
                    .await?;
                let update = JobUpdate {
                    completed_at: Some(completed_at),
                    ..base
                };
                if !self.move_job(&job, in_progress, JobEvent::Finalize(outcome), &update).await? {
                    return Ok(skipped("contended"));
                }

                let retrieved = outcome == FinalOutcome::Completed;
                let mut finished = job.clone();
                finished.completed_at = Some(completed_at);
                self.advance_schedule(&finished, &account, retrieved, completed_at).await?;

                Ok(match outcome {
                    FinalOutcome::Completed => ItemOutcome::Succeeded { counter: "completed" },
                    FinalOutcome::NeedsReview => ItemOutcome::Failed {
                        counter: "needs_review",
                        message: format!("needs review: {}", describe(&update)),
                    },
                    FinalOutcome::Failed => ItemOutcome::Failed {
                        counter: "failed",
                        message: format!("retrieval failed: {}", describe(&update)),
                    },
                })
            }
            StatusVerdict::Waiting => {
                let error = match &result {
                    Err(e) => Some(e.to_string()),
                    Ok(ProviderReply {
                        parsed: ParsedResponse::Error { http_status, message, .. },
                        ..
                    }) => Some(http_message(*http_status, message)),
                    Ok(_) => None,
                };
                self.ledger
                    .record(&call.execution(&result, error.is_none(), false, error))
                    .await?;
                if !self.move_job(&job, in_progress, JobEvent::StatusPending, &base).await? {
                    return Ok(skipped("contended"));
                }
                Ok(ItemOutcome::Succeeded { counter: "still_processing" })
            }
            StatusVerdict::Malformed(body) => {
                self.ledger
                    .record(&call.execution(&result, false, false, Some("unexpected response format".into())))
                    .await?;
                let back = JobEvent::RollBack(JobStatus::ScrapeRequested);
                if !self.move_job(&job, in_progress, back, &base).await? {
                    return Ok(skipped("contended"));
                }
                Ok(ItemOutcome::Failed {
                    counter: "unexpected_format",
                    message: format!("unexpected status response: {}", truncate(&body)),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Schedule bookkeeping
    // ------------------------------------------------------------------

    async fn advance_schedule(
        &self,
        job: &Job,
        account: &Account,
        retrieved: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<AdvanceOutcome>> {
        let Some(rule_id) = job.rule_id else {
            return Ok(None);
        };
        let Some(rule) = self.scheduler.find_rule(rule_id).await? else {
            warn!(job_id = job.id, rule_id, "Rule for finished job is gone");
            return Ok(None);
        };
        self.advance_with_rule(&rule, job, account, retrieved, now).await
    }

    async fn advance_with_rule(
        &self,
        rule: &AccountRule,
        job: &Job,
        account: &Account,
        retrieved: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<AdvanceOutcome>> {
        // Already past this job's cycle.
        if !rule.is_enabled || rule.next_run_date > job.run_date {
            return Ok(None);
        }

        let today = now.date_naive();
        let outcome = if retrieved {
            self.scheduler.advance_rule(rule, account, job, today, now).await?
        } else {
            self.scheduler.advance_without_run(rule, account, today, now).await?
        };
        Ok(Some(outcome))
    }
}

fn describe(update: &JobUpdate) -> String {
    match (&update.last_status_description, update.last_status_id) {
        (Some(description), Some(code)) => format!("{description} (status {code})"),
        (Some(description), None) => description.clone(),
        (None, Some(code)) => format!("status {code}"),
        (None, None) => "no status".to_string(),
    }
}

fn truncate(body: &str) -> &str {
    let end = body
        .char_indices()
        .map(|(i, _)| i)
        .nth(200)
        .unwrap_or(body.len());
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::provider_client::reply_from;
    use reqwest::StatusCode;
    use rstest::rstest;

    fn reply(status: u16, body: &str) -> Result<ProviderReply, ProviderError> {
        reply_from(StatusCode::from_u16(status).unwrap(), body.to_string())
    }

    #[rstest]
    #[case(200, r#"{"StatusId": 4}"#, CredentialVerdict::Verified)]
    #[case(200, "", CredentialVerdict::Verified)]
    #[case(200, "1234", CredentialVerdict::Verified)]
    #[case(200, r#"{"StatusId": 8}"#, CredentialVerdict::Rejected("Invalid credentials".into()))]
    #[case(200, r#"{"StatusId": 9}"#, CredentialVerdict::Rejected("Multi-factor authentication required".into()))]
    #[case(200, r#"{"StatusId": 11}"#, CredentialVerdict::Transient("Vendor site unavailable".into()))]
    #[case(200, r#"{"StatusId": 12}"#, CredentialVerdict::Rejected("Vendor site not supported".into()))]
    fn credential_outcomes(#[case] status: u16, #[case] body: &str, #[case] expected: CredentialVerdict) {
        let table = StatusCodeTable::default();
        assert_eq!(interpret_credential(&table, &reply(status, body)), expected);
    }

    #[rstest]
    #[case(503)]
    #[case(408)]
    fn credential_server_errors_are_transient(#[case] status: u16) {
        let table = StatusCodeTable::default();
        assert!(matches!(
            interpret_credential(&table, &reply(status, "busy")),
            CredentialVerdict::Transient(_)
        ));
    }

    #[test]
    fn credential_client_error_rejects() {
        let table = StatusCodeTable::default();
        assert!(matches!(
            interpret_credential(&table, &reply(401, "denied")),
            CredentialVerdict::Rejected(_)
        ));
        assert!(matches!(
            interpret_credential(&table, &reply(401, r#"{"IndexId": 5}"#)),
            CredentialVerdict::Transient(_)
        ));
    }

    #[test]
    fn scrape_outcomes() {
        let table = StatusCodeTable::default();
        assert_eq!(
            interpret_scrape(&table, &reply(200, r#"[{"StatusId": 1, "IndexId": 77}]"#)),
            ScrapeVerdict::Accepted { index_id: Some(77) }
        );
        assert_eq!(
            interpret_scrape(&table, &reply(200, "77")),
            ScrapeVerdict::Accepted { index_id: Some(77) }
        );
        assert_eq!(
            interpret_scrape(&table, &reply(500, r#"{"IndexId": 78}"#)),
            ScrapeVerdict::Accepted { index_id: Some(78) }
        );
        assert!(matches!(
            interpret_scrape(&table, &reply(200, r#"{"StatusId": 10}"#)),
            ScrapeVerdict::Final(FinalOutcome::NeedsReview, _)
        ));
        assert!(matches!(
            interpret_scrape(&table, &reply(200, r#"{"StatusId": 15}"#)),
            ScrapeVerdict::Final(FinalOutcome::Failed, _)
        ));
        assert!(matches!(
            interpret_scrape(&table, &reply(404, "no such vendor")),
            ScrapeVerdict::Final(FinalOutcome::Failed, _)
        ));
        assert!(matches!(
            interpret_scrape(&table, &reply(502, "bad gateway")),
            ScrapeVerdict::Transient(_)
        ));
        assert!(matches!(
            interpret_scrape(&table, &Err(ProviderError::Timeout)),
            ScrapeVerdict::Transient(_)
        ));
        assert_eq!(
            interpret_scrape(&table, &reply(200, "<html>")),
            ScrapeVerdict::Malformed("<html>".into())
        );
    }

    #[rstest]
    #[case(r#"{"StatusId": 5}"#, StatusVerdict::Final(FinalOutcome::Completed))]
    #[case(r#"{"StatusId": 6}"#, StatusVerdict::Final(FinalOutcome::Completed))]
    #[case(r#"{"StatusId": 7}"#, StatusVerdict::Final(FinalOutcome::NeedsReview))]
    #[case(r#"{"StatusId": 8}"#, StatusVerdict::Final(FinalOutcome::NeedsReview))]
    #[case(r#"{"StatusId": 15}"#, StatusVerdict::Final(FinalOutcome::Failed))]
    #[case(r#"{"StatusId": 3}"#, StatusVerdict::Waiting)]
    #[case(r#"{"StatusId": 13}"#, StatusVerdict::Waiting)]
    #[case(r#"{"StatusId": 999}"#, StatusVerdict::Waiting)]
    #[case("", StatusVerdict::Waiting)]
    fn status_outcomes(#[case] body: &str, #[case] expected: StatusVerdict) {
        let table = StatusCodeTable::default();
        assert_eq!(interpret_status(&table, &reply(200, body)), expected);
    }

    #[test]
    fn status_errors_wait() {
        let table = StatusCodeTable::default();
        assert_eq!(interpret_status(&table, &reply(500, "down")), StatusVerdict::Waiting);
        assert_eq!(
            interpret_status(&table, &Err(ProviderError::Transport("reset".into()))),
            StatusVerdict::Waiting
        );
    }

    #[test]
    fn rollback_from_recovered_states() {
        assert_eq!(rollback_target(JobStatus::CredentialFailed), JobStatus::CredentialFailed);
        assert_eq!(rollback_target(JobStatus::ScrapeInProgress), JobStatus::Pending);
        assert_eq!(
            rollback_target(JobStatus::StatusCheckInProgress),
            JobStatus::ScrapeRequested
        );
    }

    #[test]
    fn tally_counts_and_caps() {
        let mut result = PhaseResult::new(crate::domain::run::RunPhase::Scrape);
        tally(&mut result, "job 1", Ok(ItemOutcome::Succeeded { counter: "requested" }), 1);
        tally(&mut result, "job 2", Ok(ItemOutcome::Reused), 1);
        tally(&mut result, "job 3", Err(anyhow::anyhow!("db locked")), 1);
        tally(
            &mut result,
            "job 4",
            Ok(ItemOutcome::Failed {
                counter: "transient",
                message: "timeout".into(),
            }),
            1,
        );

        assert_eq!((result.succeeded, result.reused, result.failed), (1, 1, 2));
        assert_eq!(result.errors, vec!["job 3: db locked".to_string()]);
        assert_eq!(result.errors_dropped, 1);
        assert_eq!(result.counter("transient"), 1);
    }
}
