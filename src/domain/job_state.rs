//! Job state machine
//!
//! Pure transition table plus the eligibility guards each phase selects on.
//! The SQLite queries mirror these predicates; the in-memory versions are
//! re-checked by the phase executor before any outbound call.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::Job;

/// Lifecycle status of a retrieval job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    CredentialCheckInProgress,
    CredentialVerified,
    /// Not terminal: scraping may still be attempted once the run date arrives
    CredentialFailed,
    ScrapeInProgress,
    ScrapeRequested,
    StatusCheckInProgress,
    Completed,
    NeedsReview,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [Self; 11] = [
        Self::Pending,
        Self::CredentialCheckInProgress,
        Self::CredentialVerified,
        Self::CredentialFailed,
        Self::ScrapeInProgress,
        Self::ScrapeRequested,
        Self::StatusCheckInProgress,
        Self::Completed,
        Self::NeedsReview,
        Self::Failed,
        Self::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::CredentialCheckInProgress => "CredentialCheckInProgress",
            Self::CredentialVerified => "CredentialVerified",
            Self::CredentialFailed => "CredentialFailed",
            Self::ScrapeInProgress => "ScrapeInProgress",
            Self::ScrapeRequested => "ScrapeRequested",
            Self::StatusCheckInProgress => "StatusCheckInProgress",
            Self::Completed => "Completed",
            Self::NeedsReview => "NeedsReview",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::NeedsReview | Self::Failed | Self::Cancelled
        )
    }

    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::CredentialCheckInProgress | Self::ScrapeInProgress | Self::StatusCheckInProgress
        )
    }

    /// States an in-progress state may be rolled back to.
    pub const fn rollback_targets(self) -> &'static [Self] {
        match self {
            Self::CredentialCheckInProgress => &[Self::Pending, Self::CredentialFailed],
            Self::ScrapeInProgress => {
                &[Self::Pending, Self::CredentialVerified, Self::CredentialFailed]
            }
            Self::StatusCheckInProgress => &[Self::ScrapeRequested],
            _ => &[],
        }
    }

    /// Rollback target when the pre-call status is itself an in-progress
    /// state (a job recovered after a crash).
    pub const fn default_rollback(self) -> Option<Self> {
        match self {
            Self::CredentialCheckInProgress | Self::ScrapeInProgress => Some(Self::Pending),
            Self::StatusCheckInProgress => Some(Self::ScrapeRequested),
            _ => None,
        }
    }

    /// Applies `event`, returning the next status or the rejected pair.
    pub fn apply(self, event: JobEvent) -> Result<Self, TransitionError> {
        use JobStatus::{
            Cancelled, Completed, CredentialCheckInProgress, CredentialFailed, CredentialVerified,
            Failed, NeedsReview, Pending, ScrapeInProgress, ScrapeRequested,
            StatusCheckInProgress,
        };

        let next = match (self, event) {
            (
                Pending | CredentialFailed | CredentialCheckInProgress,
                JobEvent::BeginCredentialCheck,
            ) => Some(CredentialCheckInProgress),
            (CredentialCheckInProgress, JobEvent::CredentialAccepted) => Some(CredentialVerified),
            (CredentialCheckInProgress, JobEvent::CredentialRejected) => Some(CredentialFailed),
            (
                Pending | CredentialVerified | CredentialFailed | ScrapeInProgress,
                JobEvent::BeginScrape,
            ) => Some(ScrapeInProgress),
            (ScrapeInProgress, JobEvent::ScrapeAccepted) => Some(ScrapeRequested),
            (ScrapeRequested | StatusCheckInProgress, JobEvent::BeginStatusCheck) => {
                Some(StatusCheckInProgress)
            }
            (StatusCheckInProgress, JobEvent::StatusPending) => Some(ScrapeRequested),
            (ScrapeInProgress | StatusCheckInProgress, JobEvent::Finalize(outcome)) => {
                Some(match outcome {
                    FinalOutcome::Completed => Completed,
                    FinalOutcome::NeedsReview => NeedsReview,
                    FinalOutcome::Failed => Failed,
                })
            }
            (from, JobEvent::RollBack(to)) if from.rollback_targets().contains(&to) => Some(to),
            (from, JobEvent::ForceCancel) if !from.is_terminal() => Some(Cancelled),
            _ => None,
        };

        next.ok_or(TransitionError { from: self, event })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid JobStatus: {s}"))
    }
}

/// Terminal outcome of a scrape or status check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalOutcome {
    Completed,
    NeedsReview,
    Failed,
}

impl FinalOutcome {
    pub const fn status(self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::NeedsReview => JobStatus::NeedsReview,
            Self::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEvent {
    BeginCredentialCheck,
    CredentialAccepted,
    CredentialRejected,
    BeginScrape,
    ScrapeAccepted,
    BeginStatusCheck,
    StatusPending,
    Finalize(FinalOutcome),
    RollBack(JobStatus),
    ForceCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal job transition: {event:?} from {from}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub event: JobEvent,
}

/// Retry budget and durable backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_secs: 300,
            max_delay_secs: 6 * 60 * 60,
        }
    }
}

impl RetryPolicy {
    pub const fn has_budget(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Exponential delay for the given attempt (1-based) before jitter.
    pub fn base_backoff_secs(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay_secs
            .saturating_mul(1_u64 << shift)
            .min(self.max_delay_secs)
    }

    /// Backoff with up to 10% random jitter, never above the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff_secs(attempt);
        let jitter = fastrand::u64(0..=base / 10);
        let secs = base.saturating_add(jitter).min(self.max_delay_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + self.backoff(attempt)
    }
}

/// Date windows that gate each phase's selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityPolicy {
    pub credential_lead_days: i64,
    pub retry_lookback_days: i64,
    pub stale_grace_days: i64,
    pub retry: RetryPolicy,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            credential_lead_days: 7,
            retry_lookback_days: 14,
            stale_grace_days: 7,
            retry: RetryPolicy::default(),
        }
    }
}

fn attempt_due(job: &Job, now: DateTime<Utc>) -> bool {
    job.next_attempt_at.is_none_or(|at| at <= now)
}

/// Credential checks run strictly before the run date, inside the lead window.
pub fn credential_check_eligible(
    job: &Job,
    today: NaiveDate,
    now: DateTime<Utc>,
    policy: &EligibilityPolicy,
) -> bool {
    matches!(
        job.status,
        JobStatus::Pending | JobStatus::CredentialCheckInProgress | JobStatus::CredentialFailed
    ) && !job.is_deleted
        && today < job.run_date
        && job.run_date <= today + Duration::days(policy.credential_lead_days)
        && policy.retry.has_budget(job.credential_failures)
        && attempt_due(job, now)
}

pub fn scrape_eligible(
    job: &Job,
    account_missing: bool,
    today: NaiveDate,
    now: DateTime<Utc>,
    policy: &EligibilityPolicy,
) -> bool {
    let status_ok = match job.status {
        JobStatus::CredentialVerified
        | JobStatus::CredentialFailed
        | JobStatus::ScrapeInProgress => true,
        JobStatus::Pending => !account_missing,
        _ => false,
    };

    status_ok
        && !job.is_deleted
        && job.run_date <= today
        && today <= job.run_date + Duration::days(policy.retry_lookback_days)
        && policy.retry.has_budget(job.retry_count)
        && attempt_due(job, now)
}

pub fn status_check_eligible(job: &Job) -> bool {
    !job.is_deleted
        && matches!(
            job.status,
            JobStatus::ScrapeRequested | JobStatus::StatusCheckInProgress
        )
}

pub fn is_stale(job: &Job, today: NaiveDate, policy: &EligibilityPolicy) -> bool {
    !job.is_deleted
        && !job.status.is_terminal()
        && today > job.period_end + Duration::days(policy.stale_grace_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::JobType;
    use rstest::rstest;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn job(status: JobStatus, run_date: NaiveDate) -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            account_id: 1,
            rule_id: Some(1),
            job_type: JobType::Adr,
            period_start: run_date - Duration::days(5),
            period_end: run_date + Duration::days(5),
            run_date,
            status,
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

    #[rstest]
    #[case(JobStatus::Pending, JobEvent::BeginCredentialCheck, JobStatus::CredentialCheckInProgress)]
    #[case(JobStatus::CredentialFailed, JobEvent::BeginCredentialCheck, JobStatus::CredentialCheckInProgress)]
    #[case(JobStatus::CredentialCheckInProgress, JobEvent::CredentialRejected, JobStatus::CredentialFailed)]
    #[case(JobStatus::CredentialFailed, JobEvent::BeginScrape, JobStatus::ScrapeInProgress)]
    #[case(JobStatus::ScrapeInProgress, JobEvent::BeginScrape, JobStatus::ScrapeInProgress)]
    #[case(JobStatus::ScrapeInProgress, JobEvent::ScrapeAccepted, JobStatus::ScrapeRequested)]
    #[case(JobStatus::StatusCheckInProgress, JobEvent::StatusPending, JobStatus::ScrapeRequested)]
    #[case(JobStatus::StatusCheckInProgress, JobEvent::Finalize(FinalOutcome::Completed), JobStatus::Completed)]
    #[case(JobStatus::ScrapeInProgress, JobEvent::Finalize(FinalOutcome::Failed), JobStatus::Failed)]
    #[case(JobStatus::ScrapeInProgress, JobEvent::RollBack(JobStatus::CredentialVerified), JobStatus::CredentialVerified)]
    #[case(JobStatus::CredentialFailed, JobEvent::ForceCancel, JobStatus::Cancelled)]
    fn legal_transitions(#[case] from: JobStatus, #[case] event: JobEvent, #[case] to: JobStatus) {
        assert_eq!(from.apply(event), Ok(to));
    }

    #[rstest]
    #[case(JobStatus::Completed, JobEvent::BeginScrape)]
    #[case(JobStatus::Cancelled, JobEvent::ForceCancel)]
    #[case(JobStatus::ScrapeRequested, JobEvent::BeginCredentialCheck)]
    #[case(JobStatus::CredentialVerified, JobEvent::ScrapeAccepted)]
    #[case(JobStatus::StatusCheckInProgress, JobEvent::RollBack(JobStatus::Pending))]
    #[case(JobStatus::Pending, JobEvent::RollBack(JobStatus::Pending))]
    fn illegal_transitions(#[case] from: JobStatus, #[case] event: JobEvent) {
        let err = from.apply(event).unwrap_err();
        assert_eq!(err.from, from);
        assert_eq!(err.event, event);
    }

    #[test]
    fn credential_failed_is_not_terminal() {
        assert!(!JobStatus::CredentialFailed.is_terminal());
        assert!(JobStatus::NeedsReview.is_terminal());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("Sleeping".parse::<JobStatus>().is_err());
    }

    #[test]
    fn credential_check_only_before_run_date() {
        let policy = EligibilityPolicy::default();
        let today = date(2025, 3, 10);
        let now = Utc::now();

        assert!(credential_check_eligible(&job(JobStatus::Pending, date(2025, 3, 12)), today, now, &policy));
        assert!(!credential_check_eligible(&job(JobStatus::Pending, today), today, now, &policy));
        assert!(!credential_check_eligible(&job(JobStatus::Pending, date(2025, 3, 18)), today, now, &policy));
        assert!(!credential_check_eligible(&job(JobStatus::CredentialVerified, date(2025, 3, 12)), today, now, &policy));
    }

    #[test]
    fn credential_failed_becomes_scrape_eligible_on_run_date() {
        let policy = EligibilityPolicy::default();
        let today = date(2025, 3, 10);
        let now = Utc::now();
        let failed = job(JobStatus::CredentialFailed, today);

        assert!(scrape_eligible(&failed, false, today, now, &policy));
        assert!(!scrape_eligible(&failed, false, date(2025, 3, 9), now, &policy));
    }

    #[test]
    fn missing_account_blocks_unverified_scrape() {
        let policy = EligibilityPolicy::default();
        let today = date(2025, 3, 10);
        let now = Utc::now();

        assert!(scrape_eligible(&job(JobStatus::Pending, today), false, today, now, &policy));
        assert!(!scrape_eligible(&job(JobStatus::Pending, today), true, today, now, &policy));
        assert!(scrape_eligible(&job(JobStatus::CredentialVerified, today), true, today, now, &policy));
    }

    #[test]
    fn credential_failures_leave_scrape_budget_alone() {
        let policy = EligibilityPolicy::default();
        let today = date(2025, 3, 10);
        let now = Utc::now();

        let mut rejected = job(JobStatus::CredentialFailed, today + Duration::days(3));
        rejected.credential_failures = policy.retry.max_retries;
        assert!(!credential_check_eligible(&rejected, today, now, &policy));

        rejected.run_date = today;
        assert!(scrape_eligible(&rejected, false, today, now, &policy));
    }

    #[test]
    fn scrape_respects_budget_backoff_and_lookback() {
        let policy = EligibilityPolicy::default();
        let today = date(2025, 3, 10);
        let now = Utc::now();

        let mut exhausted = job(JobStatus::CredentialVerified, today);
        exhausted.retry_count = policy.retry.max_retries;
        assert!(!scrape_eligible(&exhausted, false, today, now, &policy));

        let mut waiting = job(JobStatus::CredentialVerified, today);
        waiting.next_attempt_at = Some(now + Duration::minutes(10));
        assert!(!scrape_eligible(&waiting, false, today, now, &policy));

        let old = job(JobStatus::CredentialVerified, date(2025, 2, 1));
        assert!(!scrape_eligible(&old, false, today, now, &policy));
    }

    #[test]
    fn stale_after_grace_period() {
        let policy = EligibilityPolicy::default();
        let j = job(JobStatus::ScrapeRequested, date(2025, 3, 1));
        // period_end is 2025-03-06
        assert!(!is_stale(&j, date(2025, 3, 13), &policy));
        assert!(is_stale(&j, date(2025, 3, 14), &policy));

        let done = job(JobStatus::Completed, date(2025, 3, 1));
        assert!(!is_stale(&done, date(2025, 6, 1), &policy));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_secs: 60,
            max_delay_secs: 600,
        };
        assert_eq!(policy.base_backoff_secs(1), 60);
        assert_eq!(policy.base_backoff_secs(2), 120);
        assert_eq!(policy.base_backoff_secs(4), 480);
        assert_eq!(policy.base_backoff_secs(9), 600);

        let d = policy.backoff(2).num_seconds();
        assert!((120..=132).contains(&d));
        assert!(policy.backoff(30).num_seconds() <= 600);
    }
}
