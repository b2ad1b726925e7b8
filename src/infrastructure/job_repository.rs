//! SQLite job and execution-ledger repositories

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::entities::{
    AccountId, CreateJobOutcome, ExecutionId, ExecutionType, Job, JobCandidate, JobExecution,
    JobId, JobType, JobUpdate, NewJob, NewJobExecution,
};
use crate::domain::job_state::{EligibilityPolicy, JobStatus};
use crate::domain::repositories::{ExecutionRepository, JobRepository};
use crate::infrastructure::account_repository::{ACCOUNT_COLUMNS, row_to_account};

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let job_type: String = row.try_get("job_type")?;
    Ok(Job {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        rule_id: row.try_get("rule_id")?,
        job_type: job_type.parse::<JobType>().map_err(|e| anyhow!(e))?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        run_date: row.try_get("run_date")?,
        status: status.parse::<JobStatus>().map_err(|e| anyhow!(e))?,
        retry_count: row.try_get("retry_count")?,
        credential_failures: row.try_get("credential_failures")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        is_manual_request: row.try_get("is_manual_request")?,
        manual_request_reason: row.try_get("manual_request_reason")?,
        provider_index_id: row.try_get("provider_index_id")?,
        last_status_id: row.try_get("last_status_id")?,
        last_status_description: row.try_get("last_status_description")?,
        credential_verified_at: row.try_get("credential_verified_at")?,
        scrape_requested_at: row.try_get("scrape_requested_at")?,
        completed_at: row.try_get("completed_at")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_candidate(row: &SqliteRow) -> Result<JobCandidate> {
    Ok(JobCandidate {
        job: row_to_job(row)?,
        account: row_to_account(row)?,
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<JobExecution> {
    let execution_type: String = row.try_get("execution_type")?;
    Ok(JobExecution {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        execution_type: execution_type.parse::<ExecutionType>().map_err(|e| anyhow!(e))?,
        request_payload: row.try_get("request_payload")?,
        request_hash: row.try_get("request_hash")?,
        response_body: row.try_get("response_body")?,
        http_status: row.try_get("http_status")?,
        status_id: row.try_get("status_id")?,
        index_id: row.try_get("index_id")?,
        is_success: row.try_get("is_success")?,
        is_error: row.try_get("is_error")?,
        is_final: row.try_get("is_final")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

// ============================================================================
// JobRepository
// ============================================================================

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn candidate_select(filter: &str) -> String {
        format!(
            "SELECT j.*, {ACCOUNT_COLUMNS} FROM jobs j \
             JOIN accounts a ON a.id = j.account_id \
             WHERE j.is_deleted = 0 AND {filter} \
             ORDER BY j.run_date, j.id"
        )
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<CreateJobOutcome> {
        let result = sqlx::query(
            r"
            INSERT INTO jobs (
                account_id, rule_id, job_type, period_start, period_end, run_date, status,
                is_manual_request, manual_request_reason, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'Pending', ?, ?, ?, ?)
            ON CONFLICT (account_id, period_start, period_end) WHERE is_deleted = 0 DO NOTHING
            ",
        )
        .bind(job.account_id)
        .bind(job.rule_id)
        .bind(job.job_type.as_str())
        .bind(job.period_start)
        .bind(job.period_end)
        .bind(job.run_date)
        .bind(job.is_manual_request)
        .bind(&job.manual_request_reason)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                account_id = job.account_id,
                period_start = %job.period_start,
                period_end = %job.period_end,
                "Job already exists for period"
            );
            return Ok(CreateJobOutcome::Skipped);
        }
        Ok(CreateJobOutcome::Created(result.last_insert_rowid()))
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_candidate(&self, id: JobId) -> Result<Option<JobCandidate>> {
        let row = sqlx::query(&Self::candidate_select("j.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_candidate).transpose()
    }

    async fn find_for_account(&self, account_id: AccountId) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE account_id = ? ORDER BY period_start, id")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn credential_check_candidates(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
        policy: &EligibilityPolicy,
    ) -> Result<Vec<JobCandidate>> {
        let sql = Self::candidate_select(
            "a.is_deleted = 0 \
             AND j.status IN ('Pending', 'CredentialCheckInProgress', 'CredentialFailed') \
             AND j.run_date > ? AND j.run_date <= ? \
             AND j.credential_failures < ? \
             AND (j.next_attempt_at IS NULL OR j.next_attempt_at <= ?)",
        );
        let rows = sqlx::query(&sql)
            .bind(today)
            .bind(today + Duration::days(policy.credential_lead_days))
            .bind(policy.retry.max_retries)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_candidate).collect()
    }

    async fn scrape_candidates(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
        policy: &EligibilityPolicy,
    ) -> Result<Vec<JobCandidate>> {
        let sql = Self::candidate_select(
            "a.is_deleted = 0 \
             AND (j.status IN ('CredentialVerified', 'CredentialFailed', 'ScrapeInProgress') \
                  OR (j.status = 'Pending' AND a.is_missing = 0)) \
             AND j.run_date <= ? AND j.run_date >= ? \
             AND j.retry_count < ? \
             AND (j.next_attempt_at IS NULL OR j.next_attempt_at <= ?)",
        );
        let rows = sqlx::query(&sql)
            .bind(today)
            .bind(today - Duration::days(policy.retry_lookback_days))
            .bind(policy.retry.max_retries)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_candidate).collect()
    }

    async fn status_check_candidates(&self) -> Result<Vec<JobCandidate>> {
        let sql = Self::candidate_select("j.status IN ('ScrapeRequested', 'StatusCheckInProgress')");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_candidate).collect()
    }

    async fn stale_candidates(&self, today: NaiveDate, stale_grace_days: i64) -> Result<Vec<JobCandidate>> {
        let sql = Self::candidate_select(
            "j.status NOT IN ('Completed', 'NeedsReview', 'Failed', 'Cancelled') \
             AND j.period_end < ?",
        );
        let rows = sqlx::query(&sql)
            .bind(today - Duration::days(stale_grace_days))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_candidate).collect()
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET
                status = ?,
                retry_count = COALESCE(?, retry_count),
                credential_failures = COALESCE(?, credential_failures),
                next_attempt_at = CASE WHEN ? THEN ? ELSE next_attempt_at END,
                provider_index_id = COALESCE(?, provider_index_id),
                last_status_id = COALESCE(?, last_status_id),
                last_status_description = COALESCE(?, last_status_description),
                credential_verified_at = COALESCE(?, credential_verified_at),
                scrape_requested_at = COALESCE(?, scrape_requested_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ? AND status = ? AND is_deleted = 0
            ",
        )
        .bind(to.as_str())
        .bind(update.retry_count)
        .bind(update.credential_failures)
        .bind(update.next_attempt_at.is_some())
        .bind(update.next_attempt_at.flatten())
        .bind(update.provider_index_id)
        .bind(update.last_status_id)
        .bind(&update.last_status_description)
        .bind(update.credential_verified_at)
        .bind(update.scrape_requested_at)
        .bind(update.completed_at)
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            debug!(job_id = id, from = %from, to = %to, "Job status changed underneath, transition skipped");
        }
        Ok(applied)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs WHERE is_deleted = 0 GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let count: i64 = row.try_get("n")?;
                Ok((status.parse::<JobStatus>().map_err(|e| anyhow!(e))?, count as u64))
            })
            .collect()
    }
}

// ============================================================================
// ExecutionRepository
// ============================================================================

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    async fn append(&self, execution: &NewJobExecution) -> Result<ExecutionId> {
        let result = sqlx::query(
            r"
            INSERT INTO job_executions (
                job_id, execution_type, request_payload, request_hash, response_body,
                http_status, status_id, index_id, is_success, is_error, is_final,
                error_message, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(execution.job_id)
        .bind(execution.execution_type.as_str())
        .bind(&execution.request_payload)
        .bind(execution.request_hash())
        .bind(&execution.response_body)
        .bind(execution.http_status)
        .bind(execution.status_id)
        .bind(execution.index_id)
        .bind(execution.is_success)
        .bind(execution.is_error)
        .bind(execution.is_final)
        .bind(&execution.error_message)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn latest(&self, job_id: JobId, execution_type: ExecutionType) -> Result<Option<JobExecution>> {
        let row = sqlx::query(
            "SELECT * FROM job_executions WHERE job_id = ? AND execution_type = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(job_id)
        .bind(execution_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query("SELECT * FROM job_executions WHERE job_id = ? ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_execution).collect()
    }
}
