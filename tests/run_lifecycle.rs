//! End-to-end runs against a scripted provider

use adr_orchestrator::domain::entities::{ExecutionType, JobType, JobUpdate};
use adr_orchestrator::domain::job_state::JobStatus;
use adr_orchestrator::domain::run::{OrchestrationRun, PhaseFlags, PhaseResult, RunPhase, RunStatus};
use adr_orchestrator::domain::services::Clock;
use adr_orchestrator::test_utils::{TestHarness, date, http_reply, new_execution, ok_reply, sync_row};
use anyhow::Result;
use chrono::Duration;

fn phase(run: &OrchestrationRun, phase: RunPhase) -> &PhaseResult {
    run.phase_results
        .iter()
        .find(|p| p.phase == phase)
        .expect("phase executed")
}

#[tokio::test]
async fn due_account_is_retrieved_in_one_run() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1")]);

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.phase_results.len(), 5);
    assert_eq!(phase(&run, RunPhase::Sync).counter("inserted"), 1);
    assert_eq!(phase(&run, RunPhase::Sync).counter("rules_created"), 1);
    assert_eq!(phase(&run, RunPhase::CreateJobs).counter("created"), 1);
    assert_eq!(phase(&run, RunPhase::Scrape).counter("requested"), 1);
    assert_eq!(phase(&run, RunPhase::CheckStatuses).counter("completed"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let jobs = harness.jobs_for(account.id).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].provider_index_id, Some(1000 + jobs[0].id));

    let rule = harness.state.rules.find_enabled(account.id, JobType::Adr).await?.unwrap();
    assert_eq!(rule.next_run_date, date(2025, 4, 10));
    assert_eq!(rule.next_range_start, date(2025, 4, 5));
    assert_eq!(rule.next_range_end, date(2025, 4, 15));

    let account = harness.state.accounts.find_by_id(account.id).await?.unwrap();
    assert_eq!(account.last_invoice_date, Some(date(2025, 3, 10)));
    assert_eq!(account.next_due_date, Some(date(2025, 4, 10)));

    assert_eq!(harness.provider.credential_calls(), 0);
    assert_eq!(harness.provider.scrape_calls(), 1);
    assert_eq!(harness.provider.status_calls(), 1);
    assert!(harness.sink.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn repeated_run_makes_no_new_calls() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1"), sync_row("K2", "ACC-2")]);

    harness.run(PhaseFlags::all()).await?;
    let second = harness.run(PhaseFlags::all()).await?;

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(phase(&second, RunPhase::Sync).counter("unchanged"), 2);
    assert_eq!(phase(&second, RunPhase::CreateJobs).total_items, 0);
    assert_eq!(harness.provider.scrape_calls(), 2);
    assert_eq!(harness.provider.status_calls(), 2);
    Ok(())
}

#[tokio::test]
async fn credentials_are_checked_ahead_of_run_date() -> Result<()> {
    let harness = TestHarness::new().await?;
    let mut row = sync_row("K1", "ACC-1");
    row.next_due_date = Some(date(2025, 3, 14));
    harness.source.set_rows(vec![row]);

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(phase(&run, RunPhase::VerifyCredentials).counter("verified"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::CredentialVerified);
    assert_eq!(job.run_date, date(2025, 3, 14));
    assert!(job.credential_verified_at.is_some());

    // Verified jobs are not re-checked and not scraped before the run date.
    harness.run(PhaseFlags::all()).await?;
    assert_eq!(harness.provider.credential_calls(), 1);
    assert_eq!(harness.provider.scrape_calls(), 0);

    harness.clock.advance(Duration::days(4));
    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);
    let job = harness.state.jobs.find_by_id(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.provider.scrape_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn rejected_credentials_still_get_scraped() -> Result<()> {
    let harness = TestHarness::new().await?;
    let mut row = sync_row("K1", "ACC-1");
    row.next_due_date = Some(date(2025, 3, 14));
    harness.source.set_rows(vec![row]);
    harness
        .provider
        .push_credential(ok_reply(r#"{"StatusId":8,"Status":"Invalid credentials"}"#));

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(phase(&run, RunPhase::VerifyCredentials).counter("credential_failed"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::CredentialFailed);
    assert_eq!(job.credential_failures, 1);
    assert_eq!(job.retry_count, 0);

    let sent = harness.sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].errors[0].contains("credential rejected"));

    harness.clock.advance(Duration::days(4));
    harness.run(PhaseFlags::all()).await?;
    let job = harness.state.jobs.find_by_id(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.provider.credential_calls(), 1);
    assert_eq!(harness.provider.scrape_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn repeated_rejections_do_not_block_run_date_scrape() -> Result<()> {
    let harness = TestHarness::new().await?;
    let mut row = sync_row("K1", "ACC-1");
    row.next_due_date = Some(date(2025, 3, 17));
    harness.source.set_rows(vec![row]);

    // One run a day for the week leading up to the run date, every check rejected.
    for _ in 0..7 {
        harness
            .provider
            .push_credential(ok_reply(r#"{"StatusId":8,"Status":"Invalid credentials"}"#));
        harness.run(PhaseFlags::all()).await?;
        harness.clock.advance(Duration::days(1));
    }

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(harness.clock.today(), date(2025, 3, 17));
    assert_eq!(job.status, JobStatus::CredentialFailed);
    assert_eq!(job.credential_failures, 5);
    assert_eq!(job.retry_count, 0);
    assert_eq!(harness.provider.credential_calls(), 5);

    harness.run(PhaseFlags::all()).await?;
    let job = harness.state.jobs.find_by_id(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.provider.scrape_calls(), 1);
    assert_eq!(harness.provider.credential_calls(), 5);
    Ok(())
}

#[tokio::test]
async fn rate_limited_scrape_keeps_returned_index() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1")]);
    harness.provider.push_scrape(http_reply(429, r#"{"IndexId": 555}"#));

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(phase(&run, RunPhase::Scrape).counter("requested"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.provider_index_id, Some(555));
    assert_eq!(job.retry_count, 0);

    let scrape = harness
        .state
        .executions
        .latest(job.id, ExecutionType::ScrapeRequest)
        .await?
        .unwrap();
    assert_eq!(scrape.http_status, Some(429));
    assert_eq!(scrape.index_id, Some(555));
    assert_eq!(scrape.response_body.as_deref(), Some(r#"{"IndexId": 555}"#));

    harness.clock.advance(Duration::days(1));
    harness.run(PhaseFlags::all()).await?;
    assert_eq!(harness.provider.scrape_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn rate_limited_scrape_without_index_is_retried() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1")]);
    harness.provider.push_scrape(http_reply(429, "slow down"));

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(phase(&run, RunPhase::Scrape).counter("transient"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.next_attempt_at.is_some());
    Ok(())
}

#[tokio::test]
async fn verified_credential_is_reused_within_ttl() -> Result<()> {
    let harness = TestHarness::new().await?;
    let mut row = sync_row("K1", "ACC-1");
    row.next_due_date = Some(date(2025, 3, 14));
    harness.source.set_rows(vec![row]);
    harness.run(PhaseFlags::all()).await?;

    // The job lost its verified state (e.g. a crash mid-update) while the
    // ledger still holds a fresh success.
    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    let now = harness.clock.now();
    assert!(
        harness
            .state
            .jobs
            .transition(
                job.id,
                JobStatus::CredentialVerified,
                JobStatus::CredentialCheckInProgress,
                &JobUpdate::default(),
                now
            )
            .await?
    );

    harness.clock.advance(Duration::hours(24));
    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(phase(&run, RunPhase::VerifyCredentials).reused, 1);
    assert_eq!(harness.provider.credential_calls(), 1);

    let job = harness.state.jobs.find_by_id(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::CredentialVerified);
    Ok(())
}

#[tokio::test]
async fn transient_scrape_failure_backs_off() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1")]);
    harness.provider.push_scrape(http_reply(503, "Service Unavailable"));

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(phase(&run, RunPhase::Scrape).counter("transient"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    let retry_at = job.next_attempt_at.unwrap();
    assert!(retry_at > harness.clock.now());

    // Still inside the backoff window.
    harness.run(PhaseFlags::all()).await?;
    assert_eq!(harness.provider.scrape_calls(), 1);

    harness.clock.set(retry_at + Duration::seconds(1));
    harness.run(PhaseFlags::all()).await?;
    let job = harness.state.jobs.find_by_id(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.provider.scrape_calls(), 2);

    let history = harness.state.executions.list_for_job(job.id).await?;
    let scrapes: Vec<_> = history
        .iter()
        .filter(|e| e.execution_type == ExecutionType::ScrapeRequest)
        .collect();
    assert_eq!(scrapes.len(), 2);
    assert!(scrapes[0].is_error);
    assert!(scrapes[1].is_success);
    Ok(())
}

#[tokio::test]
async fn recorded_scrape_is_not_repeated_after_crash() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1")]);
    let setup = PhaseFlags {
        sync: true,
        create_jobs: true,
        verify_credentials: false,
        scrape: false,
        check_statuses: false,
    };
    harness.run(setup).await?;

    // The process died after the provider accepted the scrape but before the
    // job left ScrapeInProgress.
    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    let now = harness.clock.now();
    assert!(
        harness
            .state
            .jobs
            .transition(job.id, JobStatus::Pending, JobStatus::ScrapeInProgress, &JobUpdate::default(), now)
            .await?
    );
    harness
        .state
        .executions
        .append(&new_execution(job.id, ExecutionType::ScrapeRequest, true))
        .await?;

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(phase(&run, RunPhase::Scrape).reused, 1);
    assert_eq!(harness.provider.scrape_calls(), 0);

    let job = harness.state.jobs.find_by_id(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.provider_index_id, Some(42));
    assert_eq!(harness.provider.status_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn stale_job_is_cancelled_and_rule_moves_on() -> Result<()> {
    let harness = TestHarness::new().await?;
    let mut row = sync_row("K1", "ACC-1");
    row.next_due_date = Some(date(2025, 2, 1));
    harness.source.set_rows(vec![row]);

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(phase(&run, RunPhase::Scrape).total_items, 0);
    assert_eq!(phase(&run, RunPhase::CheckStatuses).counter("stale_cancelled"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::Cancelled);

    let rule = harness.state.rules.find_enabled(account.id, JobType::Adr).await?.unwrap();
    assert_eq!(rule.next_run_date, date(2025, 4, 1));
    assert_eq!(harness.provider.scrape_calls(), 0);

    let sent = harness.sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].errors.iter().any(|e| e.contains("stale")));
    Ok(())
}

#[tokio::test]
async fn permanent_scrape_error_finishes_cycle() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1")]);
    harness.provider.push_scrape(http_reply(404, "no such vendor"));

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(phase(&run, RunPhase::Scrape).counter("permanent_failure"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(harness.provider.status_calls(), 0);

    let rule = harness.state.rules.find_enabled(account.id, JobType::Adr).await?.unwrap();
    assert_eq!(rule.next_run_date, date(2025, 4, 10));
    let account = harness.state.accounts.find_by_id(account.id).await?.unwrap();
    assert_eq!(account.last_invoice_date, None);
    Ok(())
}

#[tokio::test]
async fn waiting_status_is_polled_again() -> Result<()> {
    let harness = TestHarness::new().await?;
    harness.source.set_rows(vec![sync_row("K1", "ACC-1")]);
    harness
        .provider
        .push_status(ok_reply(r#"{"StatusId":3,"Status":"Processing"}"#));

    let run = harness.run(PhaseFlags::all()).await?;
    assert_eq!(phase(&run, RunPhase::CheckStatuses).counter("still_processing"), 1);

    let account = harness.live_accounts().await?.remove(0);
    let job = harness.jobs_for(account.id).await?.remove(0);
    assert_eq!(job.status, JobStatus::ScrapeRequested);
    assert_eq!(job.last_status_id, Some(3));

    harness.run(PhaseFlags::status_only()).await?;
    let job = harness.state.jobs.find_by_id(job.id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.provider.status_calls(), 2);
    assert_eq!(harness.provider.scrape_calls(), 1);
    Ok(())
}
