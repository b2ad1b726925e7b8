//! Run exclusivity, cancellation and recovery

use std::time::Duration as StdDuration;

use adr_orchestrator::application::coordinator::{CoordinatorError, StartRunRequest};
use adr_orchestrator::domain::job_state::JobStatus;
use adr_orchestrator::domain::repositories::NewRun;
use adr_orchestrator::domain::run::{PhaseFlags, RunPhase, RunStatus};
use adr_orchestrator::domain::services::Clock;
use adr_orchestrator::test_utils::{TestHarness, sync_row};
use adr_orchestrator::AppConfig;
use anyhow::{Result, bail};
use chrono::Duration;
use uuid::Uuid;

fn rows(n: usize) -> Vec<adr_orchestrator::domain::entities::AccountSyncRow> {
    (1..=n)
        .map(|i| sync_row(&format!("K{i}"), &format!("ACC-{i}")))
        .collect()
}

fn request() -> StartRunRequest {
    StartRunRequest {
        flags: PhaseFlags::all(),
        requested_by: "test".into(),
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    bail!("condition not reached")
}

fn foreign_run(queued_at: chrono::DateTime<chrono::Utc>) -> NewRun {
    NewRun {
        id: Uuid::new_v4(),
        requested_by: "other-host".into(),
        phase_flags: PhaseFlags::all(),
        queued_at,
    }
}

#[tokio::test]
async fn provider_calls_respect_concurrency_limit() -> Result<()> {
    let mut config = AppConfig::default();
    config.orchestrator.max_concurrency = 2;
    let harness = TestHarness::with_config(config).await?;
    harness.source.set_rows(rows(6));

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(harness.provider.scrape_calls(), 6);
    assert_eq!(harness.provider.status_calls(), 6);
    assert!(harness.provider.max_in_flight() >= 1);
    assert!(harness.provider.max_in_flight() <= 2);
    Ok(())
}

#[tokio::test]
async fn second_start_conflicts_with_running_one() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(rows(1));
    harness.provider.hold();

    let first = harness.state.coordinator.start_run(request()).await?;
    let provider = harness.provider.clone();
    eventually(|| provider.scrape_calls() == 1).await?;

    match harness.state.coordinator.start_run(request()).await {
        Err(CoordinatorError::Conflict { active_run_id }) => assert_eq!(active_run_id, first.run_id),
        other => bail!("expected a conflict, got {:?}", other.map(|s| s.run_id)),
    }

    let current = harness.state.coordinator.current_run().await?.unwrap();
    assert_eq!(current.id, first.run_id);
    assert_eq!(current.status, RunStatus::Running);
    assert_eq!(current.current_phase, Some(RunPhase::Scrape));

    harness.provider.open();
    assert_eq!(first.wait().await?, RunStatus::Completed);
    assert!(harness.state.coordinator.current_run().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn simultaneous_starts_admit_exactly_one() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(rows(1));
    harness.provider.hold();

    let coordinator = &harness.state.coordinator;
    let (a, b) = tokio::join!(coordinator.start_run(request()), coordinator.start_run(request()));
    let (winner, active_run_id) = match (a, b) {
        (Ok(started), Err(CoordinatorError::Conflict { active_run_id }))
        | (Err(CoordinatorError::Conflict { active_run_id }), Ok(started)) => (started, active_run_id),
        (a, b) => bail!(
            "expected one start and one conflict, got {:?} and {:?}",
            a.map(|s| s.run_id),
            b.map(|s| s.run_id)
        ),
    };
    assert_eq!(active_run_id, winner.run_id);
    assert_eq!(coordinator.recent_runs(10).await?.len(), 1);

    harness.provider.open();
    assert_eq!(winner.wait().await?, RunStatus::Completed);
    assert!(coordinator.current_run().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn run_recovered_elsewhere_stops_and_stays_failed() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(rows(1));
    harness.provider.hold();

    let started = harness.state.coordinator.start_run(request()).await?;
    let run_id = started.run_id;
    let provider = harness.provider.clone();
    eventually(|| provider.scrape_calls() == 1).await?;

    // Another process recovers with a cutoff past our heartbeat and claims the slot.
    let later = harness.clock.now() + Duration::minutes(1);
    assert_eq!(harness.state.runs.fail_abandoned(later, "interrupted", later).await?, vec![run_id]);
    let successor = foreign_run(harness.clock.now());
    harness.state.runs.try_claim(&successor).await?;

    harness.provider.open();
    assert_eq!(started.wait().await?, RunStatus::Failed);
    assert_eq!(harness.provider.status_calls(), 0);

    let run = harness.state.coordinator.find_run(run_id).await?;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("interrupted"));
    assert!(run
        .phase_results
        .iter()
        .all(|p| p.phase != RunPhase::Scrape && p.phase != RunPhase::CheckStatuses));

    let active = harness.state.coordinator.current_run().await?.unwrap();
    assert_eq!(active.id, successor.id);
    Ok(())
}

#[tokio::test]
async fn cancelled_run_stops_between_items() -> Result<()> {
    let mut config = AppConfig::default();
    config.orchestrator.max_concurrency = 1;
    let harness = TestHarness::with_config(config).await?;
    harness.source.set_rows(rows(6));
    harness.provider.hold();

    let started = harness.state.coordinator.start_run(request()).await?;
    let run_id = started.run_id;
    let provider = harness.provider.clone();
    eventually(|| provider.scrape_calls() == 1).await?;

    assert!(harness.state.coordinator.cancel_run(run_id).await?);
    harness.provider.open();
    assert_eq!(started.wait().await?, RunStatus::Cancelled);

    let run = harness.state.coordinator.find_run(run_id).await?;
    assert!(run.cancel_requested);
    assert!(run.completed_at.is_some());
    let scrape = run
        .phase_results
        .iter()
        .find(|p| p.phase == RunPhase::Scrape)
        .unwrap();
    assert_eq!(scrape.counter("requested"), 1);
    assert_eq!(scrape.counter("cancelled"), 5);
    assert!(run.phase_results.iter().all(|p| p.phase != RunPhase::CheckStatuses));
    assert_eq!(harness.provider.scrape_calls(), 1);
    assert_eq!(harness.provider.status_calls(), 0);

    // Cancelling a finished run is a no-op.
    assert!(!harness.state.coordinator.cancel_run(run_id).await?);

    // The next run picks up where the cancelled one stopped.
    let next = harness.run(PhaseFlags::all()).await?;
    assert_eq!(next.status, RunStatus::Completed);
    assert_eq!(harness.provider.scrape_calls(), 6);
    for account in harness.live_accounts().await? {
        let jobs = harness.jobs_for(account.id).await?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
    }
    Ok(())
}

#[tokio::test]
async fn cancel_of_unknown_run_is_an_error() -> Result<()> {
    let harness = TestHarness::new().await?;
    let missing = Uuid::new_v4();
    assert!(matches!(
        harness.state.coordinator.cancel_run(missing).await,
        Err(CoordinatorError::NotFound(id)) if id == missing
    ));
    Ok(())
}

#[tokio::test]
async fn abandoned_run_does_not_block_the_slot() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(rows(1));
    let abandoned = foreign_run(harness.clock.now() - Duration::hours(2));
    harness.state.runs.try_claim(&abandoned).await?;

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);

    let old = harness.state.coordinator.find_run(abandoned.id).await?;
    assert_eq!(old.status, RunStatus::Failed);
    assert!(old.error_message.unwrap_or_default().contains("interrupted"));
    Ok(())
}

#[tokio::test]
async fn recent_foreign_run_is_only_cleared_by_recovery() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(rows(1));
    let other = foreign_run(harness.clock.now() - Duration::minutes(5));
    harness.state.runs.try_claim(&other).await?;

    assert!(matches!(
        harness.state.coordinator.start_run(request()).await,
        Err(CoordinatorError::Conflict { active_run_id }) if active_run_id == other.id
    ));

    let recovered = harness.state.coordinator.recover_interrupted_runs().await?;
    assert_eq!(recovered, vec![other.id]);
    assert!(harness.state.coordinator.recover_interrupted_runs().await?.is_empty());

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);
    let history = harness.state.coordinator.recent_runs(10).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, run.id);
    assert_eq!(history[1].status, RunStatus::Failed);
    Ok(())
}
