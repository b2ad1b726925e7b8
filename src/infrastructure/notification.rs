//! Notification sinks for end-of-run summaries

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info};

use crate::domain::run::RunSummaryNotification;
use crate::domain::services::NotificationSink;

/// Writes the summary to the log
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn send(&self, summary: &RunSummaryNotification) -> Result<()> {
        let phases = summary
            .phases
            .iter()
            .map(|p| {
                format!(
                    "{}: {} ok / {} failed / {} skipped / {} reused of {}",
                    p.phase, p.succeeded, p.failed, p.skipped, p.reused, p.total_items
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        error!(
            run_id = %summary.run_id,
            status = %summary.status,
            requested_by = %summary.requested_by,
            duration_secs = ?summary.duration_secs,
            error_count = summary.errors.len(),
            fatal = ?summary.fatal_error,
            phases = %phases,
            "Run finished with failures"
        );
        for message in &summary.errors {
            error!(run_id = %summary.run_id, "{message}");
        }
        Ok(())
    }
}

/// POSTs the summary as JSON
pub struct WebhookNotificationSink {
    client: Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn send(&self, summary: &RunSummaryNotification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .with_context(|| format!("Failed to post run summary to {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook rejected run summary with status {status}");
        }
        info!(run_id = %summary.run_id, "Run summary delivered");
        Ok(())
    }
}
