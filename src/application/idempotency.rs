//! Idempotency ledger
//!
//! Guards billable provider calls. Before calling out, a phase asks the
//! ledger whether an earlier attempt for the same job already settled the
//! question; after calling out, the attempt is appended whatever happened.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::domain::entities::{ExecutionId, ExecutionType, JobExecution, JobId, NewJobExecution};
use crate::domain::repositories::ExecutionRepository;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerDecision {
    /// No usable earlier attempt; make the call
    Proceed,
    /// An earlier attempt stands in for the call
    Reuse(JobExecution),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    /// How long a successful credential check stays valid
    pub credential_check_ttl: Duration,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            credential_check_ttl: Duration::hours(72),
        }
    }
}

impl LedgerPolicy {
    fn success_is_fresh(&self, execution: &JobExecution, now: DateTime<Utc>) -> bool {
        match execution.execution_type {
            ExecutionType::CredentialCheck => {
                now - execution.completed_at <= self.credential_check_ttl
            }
            // A scrape accepted once is accepted for the life of the job.
            ExecutionType::ScrapeRequest => true,
            ExecutionType::StatusCheck => false,
        }
    }

    /// Pure decision over the latest recorded attempt.
    pub fn decide(&self, latest: Option<JobExecution>, now: DateTime<Utc>) -> LedgerDecision {
        let Some(execution) = latest else {
            return LedgerDecision::Proceed;
        };
        if execution.execution_type == ExecutionType::StatusCheck {
            return LedgerDecision::Proceed;
        }

        if execution.is_success && self.success_is_fresh(&execution, now) {
            return LedgerDecision::Reuse(execution);
        }
        LedgerDecision::Proceed
    }
}

pub struct IdempotencyLedger {
    executions: Arc<dyn ExecutionRepository>,
    policy: LedgerPolicy,
}

impl IdempotencyLedger {
    pub fn new(executions: Arc<dyn ExecutionRepository>, policy: LedgerPolicy) -> Self {
        Self { executions, policy }
    }

    pub async fn check(
        &self,
        job_id: JobId,
        execution_type: ExecutionType,
        now: DateTime<Utc>,
    ) -> Result<LedgerDecision> {
        // Status polls are free, never gate them.
        if execution_type == ExecutionType::StatusCheck {
            return Ok(LedgerDecision::Proceed);
        }

        let latest = self.executions.latest(job_id, execution_type).await?;
        let decision = self.policy.decide(latest, now);
        if let LedgerDecision::Reuse(execution) = &decision {
            debug!(
                job_id,
                execution_id = execution.id,
                %execution_type,
                "Reusing recorded attempt"
            );
        }
        Ok(decision)
    }

    pub async fn record(&self, execution: &NewJobExecution) -> Result<ExecutionId> {
        self.executions.append(execution).await
    }
}
