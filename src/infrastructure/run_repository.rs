//! SQLite orchestration run repository
//!
//! Run exclusivity lives in the single-row `active_run` table. A run owns
//! the slot from the transaction that queues it until the transaction that
//! records its final status.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::repositories::{NewRun, RunClaim, RunRepository};
use crate::domain::run::{OrchestrationRun, PhaseFlags, PhaseResult, RunPhase, RunProgress, RunStatus};

fn row_to_run(row: &SqliteRow) -> Result<OrchestrationRun> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let phase_flags: String = row.try_get("phase_flags")?;
    let phase_results: String = row.try_get("phase_results")?;
    let current_phase: Option<String> = row.try_get("current_phase")?;
    let processed_items: i64 = row.try_get("processed_items")?;
    let total_items: i64 = row.try_get("total_items")?;

    Ok(OrchestrationRun {
        id: Uuid::parse_str(&id).with_context(|| format!("Invalid run id {id}"))?,
        requested_by: row.try_get("requested_by")?,
        phase_flags: serde_json::from_str::<PhaseFlags>(&phase_flags)
            .context("Invalid phase_flags JSON")?,
        status: status.parse::<RunStatus>().map_err(|e| anyhow!(e))?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        current_phase: current_phase
            .map(|p| p.parse::<RunPhase>().map_err(|e| anyhow!(e)))
            .transpose()?,
        current_step: row.try_get("current_step")?,
        processed_items: processed_items as u64,
        total_items: total_items as u64,
        phase_results: serde_json::from_str::<Vec<PhaseResult>>(&phase_results)
            .context("Invalid phase_results JSON")?,
        error_message: row.try_get("error_message")?,
        cancel_requested: row.try_get("cancel_requested")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
    })
}

pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn try_claim(&self, run: &NewRun) -> Result<RunClaim> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction takes the write lock up front.
        sqlx::query(
            r"
            INSERT INTO orchestration_runs (id, requested_by, phase_flags, status, queued_at, phase_results)
            VALUES (?, ?, ?, 'Queued', ?, '[]')
            ",
        )
        .bind(run.id.to_string())
        .bind(&run.requested_by)
        .bind(serde_json::to_string(&run.phase_flags)?)
        .bind(run.queued_at)
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query(
            "INSERT INTO active_run (slot, run_id, claimed_at) VALUES (1, ?, ?) ON CONFLICT (slot) DO NOTHING",
        )
        .bind(run.id.to_string())
        .bind(run.queued_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !claimed {
            let active: String = sqlx::query_scalar("SELECT run_id FROM active_run WHERE slot = 1")
                .fetch_one(&mut *tx)
                .await?;
            tx.rollback().await?;
            let active_run_id = Uuid::parse_str(&active).with_context(|| format!("Invalid run id {active}"))?;
            return Ok(RunClaim::Conflict { active_run_id });
        }

        tx.commit().await?;
        Ok(RunClaim::Claimed)
    }

    async fn mark_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE orchestration_runs SET status = 'Running', started_at = ?, last_heartbeat_at = ?
            WHERE id = ? AND status = 'Queued'
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_progress(&self, id: Uuid, progress: &RunProgress, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE orchestration_runs SET
                current_phase = ?, current_step = ?, processed_items = ?, total_items = ?,
                last_heartbeat_at = ?
            WHERE id = ? AND status IN ('Queued', 'Running')
              AND EXISTS (SELECT 1 FROM active_run WHERE slot = 1 AND run_id = orchestration_runs.id)
            ",
        )
        .bind(progress.current_phase.as_str())
        .bind(&progress.current_step)
        .bind(progress.processed_items as i64)
        .bind(progress.total_items as i64)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_phase_results(&self, id: Uuid, results: &[PhaseResult], now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            UPDATE orchestration_runs SET phase_results = ?, last_heartbeat_at = ?
            WHERE id = ? AND status IN ('Queued', 'Running')
            ",
        )
        .bind(serde_json::to_string(results)?)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE orchestration_runs SET cancel_requested = 1 WHERE id = ? AND status IN ('Queued', 'Running')",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM orchestration_runs WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        results: &[PhaseResult],
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE orchestration_runs SET
                status = ?, completed_at = ?, phase_results = ?, error_message = ?,
                last_heartbeat_at = ?
            WHERE id = ? AND status IN ('Queued', 'Running')
            ",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(serde_json::to_string(results)?)
        .bind(error_message)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        sqlx::query("DELETE FROM active_run WHERE run_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        if updated {
            info!(run_id = %id, status = %status, "Run finished");
        } else {
            warn!(run_id = %id, status = %status, "Run was already closed, final status not written");
        }
        Ok(updated)
    }

    async fn fail_abandoned(
        &self,
        seen_before: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar(
            r"
            UPDATE orchestration_runs SET status = 'Failed', error_message = ?, completed_at = ?
            WHERE status IN ('Queued', 'Running')
              AND COALESCE(last_heartbeat_at, started_at, queued_at) < ?
            RETURNING id
            ",
        )
        .bind(message)
        .bind(now)
        .bind(seen_before)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r"
            DELETE FROM active_run
            WHERE run_id NOT IN (SELECT id FROM orchestration_runs WHERE status IN ('Queued', 'Running'))
            ",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let ids = ids
            .iter()
            .map(|id| Uuid::parse_str(id).with_context(|| format!("Invalid run id {id}")))
            .collect::<Result<Vec<_>>>()?;
        for id in &ids {
            warn!(run_id = %id, "Marked abandoned run as failed");
        }
        Ok(ids)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OrchestrationRun>> {
        let row = sqlx::query("SELECT * FROM orchestration_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn find_active(&self) -> Result<Option<OrchestrationRun>> {
        let row = sqlx::query(
            "SELECT r.* FROM orchestration_runs r JOIN active_run s ON s.run_id = r.id WHERE s.slot = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn find_recent(&self, limit: u32) -> Result<Vec<OrchestrationRun>> {
        let rows = sqlx::query("SELECT * FROM orchestration_runs ORDER BY queued_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_run).collect()
    }
}
