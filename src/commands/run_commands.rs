//! Run control commands
//!
//! Caller-facing operations over the coordinator and repositories. Errors
//! are flattened to strings at this boundary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::coordinator::{CoordinatorError, StartRunRequest};
use crate::application::state::AppState;
use crate::domain::entities::{AccountId, CreateJobOutcome, JobId, JobType, NewJob};
use crate::domain::run::{OrchestrationRun, PhaseFlags, PhaseResult, RunPhase, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StartRunResponse {
    Started { run_id: Uuid },
    Conflict { active_run_id: Uuid },
}

/// Live view of a run in progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub requested_by: String,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub current_phase: Option<RunPhase>,
    pub current_step: Option<String>,
    pub processed_items: u64,
    pub total_items: u64,
    pub cancel_requested: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl From<&OrchestrationRun> for RunStatusView {
    fn from(run: &OrchestrationRun) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            requested_by: run.requested_by.clone(),
            queued_at: run.queued_at,
            started_at: run.started_at,
            current_phase: run.current_phase,
            current_step: run.current_step.clone(),
            processed_items: run.processed_items,
            total_items: run.total_items,
            cancel_requested: run.cancel_requested,
            last_heartbeat_at: run.last_heartbeat_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummaryView {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub requested_by: String,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub phases: Vec<PhaseResult>,
    pub error_message: Option<String>,
}

impl From<&OrchestrationRun> for RunSummaryView {
    fn from(run: &OrchestrationRun) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            requested_by: run.requested_by.clone(),
            queued_at: run.queued_at,
            completed_at: run.completed_at,
            duration_secs: run
                .started_at
                .zip(run.completed_at)
                .map(|(start, end)| (end - start).num_seconds()),
            phases: run.phase_results.clone(),
            error_message: run.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualJobRequest {
    pub account_id: AccountId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ManualJobResponse {
    Created { job_id: JobId },
    /// A live job already covers that account and period
    AlreadyExists,
}

/// Starts a run in the background.
pub async fn start_run(
    state: &AppState,
    flags: PhaseFlags,
    requested_by: &str,
) -> Result<StartRunResponse, String> {
    let request = StartRunRequest {
        flags,
        requested_by: requested_by.to_string(),
    };
    match state.coordinator.start_run(request).await {
        Ok(started) => Ok(StartRunResponse::Started {
            run_id: started.run_id,
        }),
        Err(CoordinatorError::Conflict { active_run_id }) => {
            Ok(StartRunResponse::Conflict { active_run_id })
        }
        Err(e) => Err(format!("Failed to start run: {e}")),
    }
}

pub async fn get_current_run(state: &AppState) -> Result<Option<RunStatusView>, String> {
    state
        .coordinator
        .current_run()
        .await
        .map(|run| run.as_ref().map(RunStatusView::from))
        .map_err(|e| format!("Failed to load current run: {e}"))
}

pub async fn get_recent_runs(state: &AppState, limit: u32) -> Result<Vec<RunSummaryView>, String> {
    let runs = state
        .coordinator
        .recent_runs(limit)
        .await
        .map_err(|e| format!("Failed to load run history: {e}"))?;
    Ok(runs.iter().map(RunSummaryView::from).collect())
}

/// Returns whether the run was still active when the request landed.
pub async fn cancel_run(state: &AppState, run_id: Uuid) -> Result<bool, String> {
    state
        .coordinator
        .cancel_run(run_id)
        .await
        .map_err(|e| format!("Failed to cancel run {run_id}: {e}"))
}

pub async fn recover_interrupted_runs(state: &AppState) -> Result<Vec<Uuid>, String> {
    state
        .coordinator
        .recover_interrupted_runs()
        .await
        .map_err(|e| format!("Failed to recover runs: {e}"))
}

/// Queues an out-of-schedule retrieval for today. Manual jobs never move
/// the account's rule.
pub async fn request_manual_job(
    state: &AppState,
    request: ManualJobRequest,
) -> Result<ManualJobResponse, String> {
    if request.period_start > request.period_end {
        return Err(format!(
            "Invalid period: {} is after {}",
            request.period_start, request.period_end
        ));
    }

    let account = state
        .accounts
        .find_by_id(request.account_id)
        .await
        .map_err(|e| format!("Failed to load account {}: {e}", request.account_id))?
        .ok_or_else(|| format!("Account not found: {}", request.account_id))?;
    if account.is_deleted {
        return Err(format!("Account {} is deleted", account.id));
    }

    let job = NewJob {
        account_id: account.id,
        rule_id: None,
        job_type: JobType::Adr,
        period_start: request.period_start,
        period_end: request.period_end,
        run_date: state.clock.today(),
        is_manual_request: true,
        manual_request_reason: request.reason,
    };

    let outcome = state
        .jobs
        .create_job(&job, state.clock.now())
        .await
        .map_err(|e| format!("Failed to create manual job: {e}"))?;

    match outcome {
        CreateJobOutcome::Created(job_id) => {
            info!(job_id, account_id = account.id, "Manual job queued");
            Ok(ManualJobResponse::Created { job_id })
        }
        CreateJobOutcome::Skipped => {
            warn!(account_id = account.id, "Manual job skipped, period already covered");
            Ok(ManualJobResponse::AlreadyExists)
        }
    }
}

/// Job counts by status, for the status overview.
pub async fn get_job_counts(state: &AppState) -> Result<Vec<(String, u64)>, String> {
    let counts = state
        .jobs
        .count_by_status()
        .await
        .map_err(|e| format!("Failed to count jobs: {e}"))?;
    Ok(counts
        .into_iter()
        .map(|(status, n)| (status.to_string(), n))
        .collect())
}
