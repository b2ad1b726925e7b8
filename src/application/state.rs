//! Application state
//!
//! Builds the repositories, provider client, feed, notification sinks and
//! run coordinator once at startup and hands out shared references.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tracing::info;

use crate::application::coordinator::{CoordinatorSettings, RunCoordinator};
use crate::application::idempotency::{IdempotencyLedger, LedgerPolicy};
use crate::application::phases::{PhaseDependencies, PhaseExecutor};
use crate::application::reporter::SummaryReporter;
use crate::application::rule_scheduler::RuleScheduler;
use crate::domain::entities::JobType;
use crate::domain::repositories::{
    AccountRepository, ExecutionRepository, JobRepository, RuleRepository, RunRepository,
};
use crate::domain::services::{AccountSource, Clock, NotificationSink, ScrapingProvider, SystemClock};
use crate::infrastructure::account_feed::JsonFileAccountSource;
use crate::infrastructure::account_repository::{SqliteAccountRepository, SqliteRuleRepository};
use crate::infrastructure::config::{AppConfig, ConfigManager};
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::job_repository::{SqliteExecutionRepository, SqliteJobRepository};
use crate::infrastructure::notification::{TracingNotificationSink, WebhookNotificationSink};
use crate::infrastructure::provider_client::HttpScrapingProvider;
use crate::infrastructure::run_repository::SqliteRunRepository;

/// External collaborators, swappable in tests
pub struct Collaborators {
    pub provider: Arc<dyn ScrapingProvider>,
    pub source: Option<Arc<dyn AccountSource>>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
    pub clock: Arc<dyn Clock>,
}

pub struct AppState {
    pub config: AppConfig,
    pub database: DatabaseConnection,
    pub accounts: Arc<dyn AccountRepository>,
    pub rules: Arc<dyn RuleRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub clock: Arc<dyn Clock>,
    pub coordinator: RunCoordinator,
}

impl AppState {
    /// Opens the database, applies the schema and wires the production
    /// collaborators.
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let path = ConfigManager::resolve_database_path(&config)?;
        let database = DatabaseConnection::new(&path, &config.database).await?;
        database.migrate().await.context("Failed to migrate database")?;

        let provider: Arc<dyn ScrapingProvider> = Arc::new(HttpScrapingProvider::new(&config.provider)?);
        let source = config
            .feed
            .accounts_path
            .as_ref()
            .map(|p| Arc::new(JsonFileAccountSource::new(p.clone())) as Arc<dyn AccountSource>);

        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingNotificationSink)];
        if let Some(url) = &config.notification.webhook_url {
            sinks.push(Arc::new(WebhookNotificationSink::new(
                url.as_str(),
                config.notification.timeout_secs,
            )?));
        }

        info!(
            database = %path.display(),
            provider = %config.provider.base_url,
            feed = source.is_some(),
            sinks = sinks.len(),
            "Application state initialized"
        );

        Ok(Self::from_parts(
            config,
            database,
            Collaborators {
                provider,
                source,
                sinks,
                clock: Arc::new(SystemClock),
            },
        ))
    }

    /// Wires everything around an already migrated database.
    pub fn from_parts(config: AppConfig, database: DatabaseConnection, parts: Collaborators) -> Self {
        let pool = database.pool().clone();
        let accounts: Arc<dyn AccountRepository> = Arc::new(SqliteAccountRepository::new(pool.clone()));
        let rules: Arc<dyn RuleRepository> = Arc::new(SqliteRuleRepository::new(pool.clone()));
        let jobs: Arc<dyn JobRepository> = Arc::new(SqliteJobRepository::new(pool.clone()));
        let executions: Arc<dyn ExecutionRepository> = Arc::new(SqliteExecutionRepository::new(pool.clone()));
        let runs: Arc<dyn RunRepository> = Arc::new(SqliteRunRepository::new(pool));

        let o = &config.orchestrator;
        let ledger = IdempotencyLedger::new(
            executions.clone(),
            LedgerPolicy {
                credential_check_ttl: Duration::hours(o.credential_check_ttl_hours),
            },
        );

        let executor = PhaseExecutor::new(PhaseDependencies {
            accounts: accounts.clone(),
            jobs: jobs.clone(),
            ledger,
            scheduler: RuleScheduler::new(rules.clone(), JobType::Adr, o.drift_threshold_days),
            provider: parts.provider,
            source: parts.source,
            status_codes: config.status_code_table(),
            policy: o.eligibility(),
            clock: parts.clock.clone(),
        });

        let coordinator = RunCoordinator::new(
            runs.clone(),
            Arc::new(executor),
            Arc::new(SummaryReporter::new(parts.sinks)),
            parts.clock.clone(),
            CoordinatorSettings::from(o),
        );

        Self {
            config,
            database,
            accounts,
            rules,
            jobs,
            executions,
            runs,
            clock: parts.clock,
            coordinator,
        }
    }
}
