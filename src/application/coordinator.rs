//! Orchestration run coordinator
//!
//! Owns the run lifecycle: claim the single active-run slot, execute the
//! enabled phases in order on a bounded worker pool, flush progress, honor
//! cancellation, release the slot and hand the outcome to the reporter.
//! Everything a phase does to an individual job lives in [`PhaseExecutor`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration as StdDuration, Instant};

use anyhow::{Result, anyhow};
use chrono::Duration;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, info_span, warn};
use uuid::Uuid;

use crate::application::phases::{ItemOutcome, PhaseExecutor, WorkItem, tally};
use crate::application::reporter::{RunReport, SummaryReporter};
use crate::domain::repositories::{NewRun, RunClaim, RunRepository};
use crate::domain::run::{OrchestrationRun, PhaseFlags, PhaseResult, RunPhase, RunProgress, RunStatus};
use crate::domain::services::Clock;
use crate::infrastructure::config::OrchestratorConfig;

const ABANDONED_MESSAGE: &str = "interrupted: no heartbeat from the owning process";
const LOST_SLOT_MESSAGE: &str = "run lost the active slot to recovery";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("another run is already active: {active_run_id}")]
    Conflict { active_run_id: Uuid },
    #[error("run not found: {0}")]
    NotFound(Uuid),
    #[error("run task did not complete: {0}")]
    Spawn(String),
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct StartRunRequest {
    pub flags: PhaseFlags,
    pub requested_by: String,
}

/// Handle to a run executing in the background
pub struct StartedRun {
    pub run_id: Uuid,
    handle: JoinHandle<RunStatus>,
}

impl StartedRun {
    /// Waits for the run to stop and returns its final status.
    pub async fn wait(self) -> Result<RunStatus, CoordinatorError> {
        self.handle
            .await
            .map_err(|e| CoordinatorError::Spawn(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub max_concurrency: usize,
    pub stale_run_after: Duration,
    pub progress_flush_every: u64,
    pub progress_flush_interval: StdDuration,
    pub max_error_messages: usize,
}

impl From<&OrchestratorConfig> for CoordinatorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            stale_run_after: Duration::seconds(config.stale_run_after_secs),
            progress_flush_every: config.progress_flush_every.max(1),
            progress_flush_interval: StdDuration::from_millis(config.progress_flush_interval_ms),
            max_error_messages: config.max_error_messages,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

/// Per-run state threaded through the phases
struct RunContext {
    run_id: Uuid,
    token: CancellationToken,
    /// Set once recovery elsewhere has failed this run and freed its slot
    lost: AtomicBool,
}

impl RunContext {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
        self.token.cancel();
    }
}

#[derive(Clone)]
pub struct RunCoordinator {
    runs: Arc<dyn RunRepository>,
    executor: Arc<PhaseExecutor>,
    reporter: Arc<SummaryReporter>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl RunCoordinator {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        executor: Arc<PhaseExecutor>,
        reporter: Arc<SummaryReporter>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            runs,
            executor,
            reporter,
            clock,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claims the active-run slot and starts the run in the background.
    ///
    /// A run whose owner stopped sending heartbeats is failed first so it
    /// cannot block the slot forever.
    pub async fn start_run(&self, request: StartRunRequest) -> Result<StartedRun, CoordinatorError> {
        let now = self.clock.now();

        if self.active.lock().await.is_empty() {
            let cutoff = now - self.settings.stale_run_after;
            self.runs.fail_abandoned(cutoff, ABANDONED_MESSAGE, now).await?;
        }

        let run = NewRun {
            id: Uuid::new_v4(),
            requested_by: request.requested_by,
            phase_flags: request.flags,
            queued_at: now,
        };

        if let RunClaim::Conflict { active_run_id } = self.runs.try_claim(&run).await? {
            info!(active_run_id = %active_run_id, "Run already active, start rejected");
            return Err(CoordinatorError::Conflict { active_run_id });
        }

        let token = CancellationToken::new();
        self.active.lock().await.insert(run.id, token.clone());

        let run_id = run.id;
        let span = info_span!("run", run_id = %run.id, requested_by = %run.requested_by);
        info!(run_id = %run_id, phases = ?run.phase_flags.enabled_phases(), "Run queued");

        let this = self.clone();
        let handle = tokio::spawn(async move { this.execute(run, token).await }.instrument(span));
        Ok(StartedRun { run_id, handle })
    }

    /// Requests cooperative cancellation. Returns false if the run had
    /// already stopped.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool, CoordinatorError> {
        let run = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or(CoordinatorError::NotFound(run_id))?;
        if !run.status.is_active() {
            return Ok(false);
        }

        let persisted = self.runs.request_cancel(run_id).await?;
        if let Some(token) = self.active.lock().await.get(&run_id) {
            token.cancel();
        }
        info!(run_id = %run_id, "Cancellation requested");
        Ok(persisted)
    }

    /// Fails runs left Queued or Running by a process that is gone and frees
    /// the slot. Jobs they left in progress are picked up by the next run.
    pub async fn recover_interrupted_runs(&self) -> Result<Vec<Uuid>, CoordinatorError> {
        let now = self.clock.now();
        let cutoff = if self.active.lock().await.is_empty() {
            now
        } else {
            now - self.settings.stale_run_after
        };
        let recovered = self.runs.fail_abandoned(cutoff, ABANDONED_MESSAGE, now).await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered interrupted runs");
        }
        Ok(recovered)
    }

    pub async fn current_run(&self) -> Result<Option<OrchestrationRun>, CoordinatorError> {
        Ok(self.runs.find_active().await?)
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<OrchestrationRun>, CoordinatorError> {
        Ok(self.runs.find_recent(limit).await?)
    }

    pub async fn find_run(&self, run_id: Uuid) -> Result<OrchestrationRun, CoordinatorError> {
        self.runs
            .find_by_id(run_id)
            .await?
            .ok_or(CoordinatorError::NotFound(run_id))
    }

    async fn execute(self, run: NewRun, token: CancellationToken) -> RunStatus {
        let ctx = RunContext {
            run_id: run.id,
            token,
            lost: AtomicBool::new(false),
        };
        let started_at = self.clock.now();
        let mut results: Vec<PhaseResult> = Vec::new();
        let mut fatal: Option<String> = None;

        match self.runs.mark_running(ctx.run_id, started_at).await {
            Ok(false) => {
                warn!("Run was closed before it started");
                ctx.mark_lost();
            }
            Ok(true) => {
                info!("Run started");
                for phase in run.phase_flags.enabled_phases() {
                    if self.cancel_requested(&ctx).await {
                        info!(%phase, "Run cancelled before phase");
                        break;
                    }

                    let mut result = PhaseResult::new(phase);
                    let outcome = self
                        .run_phase(&ctx, &mut result)
                        .instrument(info_span!("phase", %phase))
                        .await;
                    results.push(result);
                    if ctx.is_lost() {
                        break;
                    }

                    if let Err(e) = self.runs.save_phase_results(ctx.run_id, &results, self.clock.now()).await {
                        warn!(error = %e, "Could not persist phase results");
                    }
                    if let Err(e) = outcome {
                        error!(%phase, error = %e, "Phase aborted, failing run");
                        fatal = Some(format!("{phase} phase failed: {e:#}"));
                        break;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Could not mark run as running");
                fatal = Some(format!("could not start run: {e:#}"));
            }
        }

        if ctx.is_lost() {
            fatal.get_or_insert_with(|| LOST_SLOT_MESSAGE.to_string());
        }
        let status = if fatal.is_some() {
            RunStatus::Failed
        } else if ctx.token.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        let completed_at = self.clock.now();
        match self
            .runs
            .finish(ctx.run_id, status, &results, fatal.as_deref(), completed_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(%status, "Run was failed elsewhere, keeping the stored status"),
            Err(e) => error!(error = %e, "Could not record final run status"),
        }
        self.active.lock().await.remove(&ctx.run_id);

        let report = RunReport {
            run_id: ctx.run_id,
            requested_by: run.requested_by,
            status,
            started_at: Some(started_at),
            completed_at,
            phases: results,
            fatal_error: fatal,
        };
        self.reporter.report(&report).await;
        status
    }

    async fn run_phase(&self, ctx: &RunContext, result: &mut PhaseResult) -> Result<()> {
        let phase = result.phase;
        info!(%phase, "Phase started");

        match phase {
            RunPhase::Sync => {
                self.flush(ctx, phase, "syncing accounts", 0, 0).await;
                self.executor
                    .sync_accounts(result, self.settings.max_error_messages)
                    .await?;
            }
            RunPhase::CreateJobs => {
                let items = self.executor.create_job_items().await?;
                self.run_items(ctx, result, "creating jobs", items, |executor, item| async move {
                    executor.create_job(item).await
                })
                .await;
            }
            RunPhase::VerifyCredentials => {
                let items = self.executor.credential_items().await?;
                self.run_items(ctx, result, "verifying credentials", items, |executor, item| async move {
                    executor.verify_credential(item).await
                })
                .await;
            }
            RunPhase::Scrape => {
                let items = self.executor.scrape_items().await?;
                self.run_items(ctx, result, "requesting scrapes", items, |executor, item| async move {
                    executor.request_scrape(item).await
                })
                .await;
            }
            RunPhase::CheckStatuses => {
                let stale = self.executor.stale_items().await?;
                self.run_items(ctx, result, "sweeping stale jobs", stale, |executor, item| async move {
                    executor.cancel_stale(item).await
                })
                .await;

                let items = self.executor.status_items().await?;
                self.run_items(ctx, result, "checking statuses", items, |executor, item| async move {
                    executor.check_status(item).await
                })
                .await;
            }
        }

        self.flush(ctx, phase, "done", result.total_items, result.total_items).await;
        info!(
            %phase,
            total = result.total_items,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            reused = result.reused,
            "Phase finished"
        );
        Ok(())
    }

    /// Runs `work` over `items` on the worker pool, folding each outcome
    /// into `result` as it completes.
    async fn run_items<T, F, Fut>(
        &self,
        ctx: &RunContext,
        result: &mut PhaseResult,
        step: &str,
        items: Vec<T>,
        work: F,
    ) where
        T: WorkItem,
        F: Fn(Arc<PhaseExecutor>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ItemOutcome>> + Send + 'static,
    {
        let total = items.len() as u64;
        result.total_items += total;
        self.flush(ctx, result.phase, step, 0, total).await;
        if items.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let work = Arc::new(work);
        let mut pending = FuturesUnordered::new();

        for item in items {
            let label = item.label();
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let token = ctx.token.clone();
            let work = work.clone();

            let handle = tokio::spawn(
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| anyhow!("worker pool closed: {e}"))?;
                    if token.is_cancelled() {
                        return Ok(ItemOutcome::Skipped { counter: "cancelled" });
                    }
                    (*work)(executor, item).await
                }
                .instrument(Span::current()),
            );
            pending.push(async move { (label, handle.await) });
        }

        let mut processed = 0_u64;
        let mut last_flush = Instant::now();
        while let Some((label, joined)) = pending.next().await {
            let outcome = joined.unwrap_or_else(|e| Err(anyhow!("worker task failed: {e}")));
            tally(result, &label, outcome, self.settings.max_error_messages);
            processed += 1;

            if processed % self.settings.progress_flush_every == 0
                || last_flush.elapsed() >= self.settings.progress_flush_interval
            {
                self.flush(ctx, result.phase, step, processed, total).await;
                last_flush = Instant::now();
            }
        }
        self.flush(ctx, result.phase, step, processed, total).await;
    }

    /// Writes progress and picks up a cancel flag set by another process.
    /// A run that no longer holds the slot stops as if cancelled.
    async fn flush(&self, ctx: &RunContext, phase: RunPhase, step: &str, processed: u64, total: u64) {
        if ctx.is_lost() {
            return;
        }
        let progress = RunProgress {
            current_phase: phase,
            current_step: step.to_string(),
            processed_items: processed,
            total_items: total,
        };
        match self.runs.update_progress(ctx.run_id, &progress, self.clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                error!(%phase, "Run no longer holds the active slot, stopping");
                ctx.mark_lost();
                return;
            }
            Err(e) => warn!(error = %e, "Could not flush run progress"),
        }
        self.cancel_requested(ctx).await;
    }

    async fn cancel_requested(&self, ctx: &RunContext) -> bool {
        if ctx.token.is_cancelled() {
            return true;
        }
        match self.runs.is_cancel_requested(ctx.run_id).await {
            Ok(true) => {
                ctx.token.cancel();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "Could not read cancel flag");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_clamp_degenerate_values() {
        let config = OrchestratorConfig {
            max_concurrency: 0,
            progress_flush_every: 0,
            ..OrchestratorConfig::default()
        };
        let settings = CoordinatorSettings::from(&config);
        assert_eq!(settings.max_concurrency, 1);
        assert_eq!(settings.progress_flush_every, 1);
        assert_eq!(settings.stale_run_after, Duration::seconds(1800));
    }
}
