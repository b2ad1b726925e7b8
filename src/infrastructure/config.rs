//! Configuration infrastructure
//!
//! Settings are layered: built-in defaults, then an optional JSON file, then
//! `ADR__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::domain::job_state::{EligibilityPolicy, RetryPolicy};
use crate::domain::status_codes::{StatusCodeEntry, StatusCodeTable};

const APP_DIR_NAME: &str = "adr-orchestrator";
const CONFIG_FILE_NAME: &str = "config.json";
const ENV_PREFIX: &str = "ADR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub provider: ProviderConfig,
    pub feed: FeedConfig,
    pub notification: NotificationConfig,
    /// Overrides and additions to the built-in status table
    pub status_codes: Vec<StatusCodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to the platform data directory
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: defaults::DB_MAX_CONNECTIONS,
            busy_timeout_ms: defaults::DB_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Directory for rolling log files; defaults to the data directory
    pub directory: Option<PathBuf>,
    /// Extra `target=level` directives appended to the filter
    pub module_filters: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            directory: None,
            module_filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub credential_lead_days: i64,
    pub retry_lookback_days: i64,
    pub stale_grace_days: i64,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub credential_check_ttl_hours: i64,
    pub drift_threshold_days: i64,
    pub stale_run_after_secs: i64,
    pub progress_flush_every: u64,
    pub progress_flush_interval_ms: u64,
    pub max_error_messages: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: defaults::MAX_CONCURRENCY,
            credential_lead_days: defaults::CREDENTIAL_LEAD_DAYS,
            retry_lookback_days: defaults::RETRY_LOOKBACK_DAYS,
            stale_grace_days: defaults::STALE_GRACE_DAYS,
            max_retries: defaults::MAX_RETRIES,
            retry_base_delay_secs: defaults::RETRY_BASE_DELAY_SECS,
            retry_max_delay_secs: defaults::RETRY_MAX_DELAY_SECS,
            credential_check_ttl_hours: defaults::CREDENTIAL_CHECK_TTL_HOURS,
            drift_threshold_days: defaults::DRIFT_THRESHOLD_DAYS,
            stale_run_after_secs: defaults::STALE_RUN_AFTER_SECS,
            progress_flush_every: defaults::PROGRESS_FLUSH_EVERY,
            progress_flush_interval_ms: defaults::PROGRESS_FLUSH_INTERVAL_MS,
            max_error_messages: defaults::MAX_ERROR_MESSAGES,
        }
    }
}

impl OrchestratorConfig {
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_secs: self.retry_base_delay_secs,
            max_delay_secs: self.retry_max_delay_secs,
        }
    }

    pub const fn eligibility(&self) -> EligibilityPolicy {
        EligibilityPolicy {
            credential_lead_days: self.credential_lead_days,
            retry_lookback_days: self.retry_lookback_days,
            stale_grace_days: self.stale_grace_days,
            retry: self.retry_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
    pub user_agent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::PROVIDER_BASE_URL.to_string(),
            api_key: None,
            api_key_header: defaults::PROVIDER_API_KEY_HEADER.to_string(),
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            requests_per_second: defaults::REQUESTS_PER_SECOND,
            user_agent: format!("{APP_DIR_NAME}/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// JSON array of account rows
    pub accounts_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Summaries are POSTed here when set; otherwise they are logged
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
        }
    }
}

impl AppConfig {
    pub fn status_code_table(&self) -> StatusCodeTable {
        StatusCodeTable::with_overrides(&self.status_codes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.max_concurrency == 0 {
            return Err(ConfigError::Validation {
                message: "orchestrator.max_concurrency must be greater than 0".to_string(),
            });
        }
        if o.retry_base_delay_secs > o.retry_max_delay_secs {
            return Err(ConfigError::Validation {
                message: "orchestrator.retry_base_delay_secs cannot exceed retry_max_delay_secs"
                    .to_string(),
            });
        }
        for (name, value) in [
            ("credential_lead_days", o.credential_lead_days),
            ("retry_lookback_days", o.retry_lookback_days),
            ("stale_grace_days", o.stale_grace_days),
            ("drift_threshold_days", o.drift_threshold_days),
        ] {
            if value < 0 {
                return Err(ConfigError::Validation {
                    message: format!("orchestrator.{name} must not be negative"),
                });
            }
        }
        if self.provider.requests_per_second == 0 {
            return Err(ConfigError::Validation {
                message: "provider.requests_per_second must be greater than 0".to_string(),
            });
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation {
                message: "database.max_connections must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads and writes the configuration file
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(APP_DIR_NAME);
        Ok(config_dir)
    }

    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(APP_DIR_NAME);
        Ok(data_dir)
    }

    /// Manager for the platform default config file.
    pub fn new() -> Result<Self> {
        Ok(Self {
            config_path: Self::get_config_dir()?.join(CONFIG_FILE_NAME),
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Defaults, overlaid by the file when it exists, overlaid by env.
    pub fn load_config(&self) -> Result<AppConfig> {
        let config = Self::build(Some(&self.config_path))?;
        if self.config_path.exists() {
            info!("Loaded configuration from: {:?}", self.config_path);
        }
        Ok(config)
    }

    /// Defaults overlaid by environment only.
    pub fn from_env() -> Result<AppConfig> {
        Self::build(None)
    }

    fn build(path: Option<&Path>) -> Result<AppConfig> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(ConfigError::from)
            .context("Failed to seed default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(ConfigError::from)
            .context("Failed to build configuration")?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(ConfigError::from)
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Writes a default file unless one already exists.
    pub async fn initialize_default(&self) -> Result<bool> {
        if self.config_path.exists() {
            return Ok(false);
        }
        self.save_config(&AppConfig::default()).await?;
        Ok(true)
    }

    /// Database file from config, or the platform data directory.
    pub fn resolve_database_path(config: &AppConfig) -> Result<PathBuf> {
        match &config.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::get_app_data_dir()?.join("database").join("adr.db")),
        }
    }

    pub fn resolve_log_dir(config: &AppConfig) -> Result<PathBuf> {
        match &config.logging.directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::get_app_data_dir()?.join("logs")),
        }
    }
}

/// Default configuration values
pub mod defaults {
    pub const DB_MAX_CONNECTIONS: u32 = 8;
    pub const DB_BUSY_TIMEOUT_MS: u64 = 5000;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = false;

    /// Worker pool size per phase
    pub const MAX_CONCURRENCY: usize = 4;
    /// Days before the run date a credential check may happen
    pub const CREDENTIAL_LEAD_DAYS: i64 = 7;
    /// Days after the run date a scrape is still attempted
    pub const RETRY_LOOKBACK_DAYS: i64 = 14;
    /// Days past the period end before an unfinished job is swept
    pub const STALE_GRACE_DAYS: i64 = 7;
    pub const MAX_RETRIES: u32 = 5;
    pub const RETRY_BASE_DELAY_SECS: u64 = 300;
    pub const RETRY_MAX_DELAY_SECS: u64 = 6 * 60 * 60;
    pub const CREDENTIAL_CHECK_TTL_HOURS: i64 = 72;
    pub const DRIFT_THRESHOLD_DAYS: i64 = 3;
    pub const STALE_RUN_AFTER_SECS: i64 = 1800;
    pub const PROGRESS_FLUSH_EVERY: u64 = 1;
    pub const PROGRESS_FLUSH_INTERVAL_MS: u64 = 2000;
    pub const MAX_ERROR_MESSAGES: usize = 200;

    pub const PROVIDER_BASE_URL: &str = "http://localhost:8080/api";
    pub const PROVIDER_API_KEY_HEADER: &str = "X-Api-Key";
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const REQUESTS_PER_SECOND: u32 = 5;
}
