//! External collaborators
//!
//! Traits for the scraping provider, the account feed and the notification
//! channel. Infrastructure supplies the real implementations; tests script
//! them.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::{Account, AccountSyncRow, Job, JobId};
use crate::domain::provider_response::ParsedResponse;
use crate::domain::run::RunSummaryNotification;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CredentialCheckRequest {
    pub job_id: JobId,
    pub account_number: String,
    pub vendor_code: String,
    pub credential_ref: Option<String>,
}

impl CredentialCheckRequest {
    pub fn for_job(job: &Job, account: &Account) -> Self {
        Self {
            job_id: job.id,
            account_number: account.external_id.clone(),
            vendor_code: account.vendor_code.clone(),
            credential_ref: account.credential_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScrapeRequest {
    pub job_id: JobId,
    pub account_number: String,
    pub vendor_code: String,
    pub credential_ref: Option<String>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl ScrapeRequest {
    pub fn for_job(job: &Job, account: &Account) -> Self {
        Self {
            job_id: job.id,
            account_number: account.external_id.clone(),
            vendor_code: account.vendor_code.clone(),
            credential_ref: account.credential_ref.clone(),
            period_start: job.period_start,
            period_end: job.period_end,
        }
    }
}

/// Raw reply plus its interpretation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReply {
    pub http_status: u16,
    pub raw_body: String,
    pub parsed: ParsedResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response format (HTTP {http_status})")]
    UnexpectedFormat { http_status: u16, body: String },
}

impl ProviderError {
    /// Whether a later attempt may succeed without anything changing on
    /// our side.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

#[async_trait]
pub trait ScrapingProvider: Send + Sync {
    async fn verify_credential(&self, request: &CredentialCheckRequest) -> Result<ProviderReply, ProviderError>;
    async fn request_scrape(&self, request: &ScrapeRequest) -> Result<ProviderReply, ProviderError>;
    async fn check_status(&self, index_id: i64) -> Result<ProviderReply, ProviderError>;
}

/// Source-of-truth feed of accounts
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn fetch_accounts(&self) -> anyhow::Result<Vec<AccountSyncRow>>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, summary: &RunSummaryNotification) -> anyhow::Result<()>;
}

/// Source of "now" for scheduling decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
