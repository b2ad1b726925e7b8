//! Account feed read from a JSON export

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::domain::entities::AccountSyncRow;
use crate::domain::services::AccountSource;

/// Reads a JSON array of account rows from disk on every fetch.
pub struct JsonFileAccountSource {
    path: PathBuf,
}

impl JsonFileAccountSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AccountSource for JsonFileAccountSource {
    async fn fetch_accounts(&self) -> Result<Vec<AccountSyncRow>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read account feed {}", self.path.display()))?;
        let rows: Vec<AccountSyncRow> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid account feed {}", self.path.display()))?;
        info!(path = %self.path.display(), accounts = rows.len(), "Account feed loaded");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing_period::PeriodType;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reads_feed_labels() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"[
                {"sourceKey": "K1", "externalId": "100-200", "vendorCode": "ACME",
                 "periodType": "Monthly", "lastInvoiceDate": "2025-01-23"},
                {"sourceKey": "K2", "externalId": "300", "vendorCode": "GRID",
                 "periodType": "Bi-Weekly", "isMissing": true}
            ]"#,
        )?;

        let rows = JsonFileAccountSource::new(&path).fetch_accounts().await?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].period_type, PeriodType::BiWeekly);
        assert!(rows[1].is_missing);
        assert_eq!(rows[0].credential_ref, None);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let source = JsonFileAccountSource::new("/nonexistent/accounts.json");
        assert!(source.fetch_accounts().await.is_err());
    }
}
