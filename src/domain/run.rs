//! Orchestration run model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Self::Queued),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(format!("Invalid RunStatus: {other}")),
        }
    }
}

/// Pipeline phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunPhase {
    Sync,
    CreateJobs,
    VerifyCredentials,
    Scrape,
    CheckStatuses,
}

impl RunPhase {
    pub const ORDER: [Self; 5] = [
        Self::Sync,
        Self::CreateJobs,
        Self::VerifyCredentials,
        Self::Scrape,
        Self::CheckStatuses,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "Sync",
            Self::CreateJobs => "CreateJobs",
            Self::VerifyCredentials => "VerifyCredentials",
            Self::Scrape => "Scrape",
            Self::CheckStatuses => "CheckStatuses",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| format!("Invalid RunPhase: {s}"))
    }
}

/// Which phases a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFlags {
    pub sync: bool,
    pub create_jobs: bool,
    pub verify_credentials: bool,
    pub scrape: bool,
    pub check_statuses: bool,
}

impl Default for PhaseFlags {
    fn default() -> Self {
        Self::all()
    }
}

impl PhaseFlags {
    pub const fn all() -> Self {
        Self {
            sync: true,
            create_jobs: true,
            verify_credentials: true,
            scrape: true,
            check_statuses: true,
        }
    }

    pub const fn status_only() -> Self {
        Self {
            sync: false,
            create_jobs: false,
            verify_credentials: false,
            scrape: false,
            check_statuses: true,
        }
    }

    pub const fn is_enabled(&self, phase: RunPhase) -> bool {
        match phase {
            RunPhase::Sync => self.sync,
            RunPhase::CreateJobs => self.create_jobs,
            RunPhase::VerifyCredentials => self.verify_credentials,
            RunPhase::Scrape => self.scrape,
            RunPhase::CheckStatuses => self.check_statuses,
        }
    }

    pub fn enabled_phases(&self) -> Vec<RunPhase> {
        RunPhase::ORDER
            .into_iter()
            .filter(|phase| self.is_enabled(*phase))
            .collect()
    }
}

/// Tallies for one executed phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: RunPhase,
    pub total_items: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub reused: u64,
    /// Phase-specific counters, e.g. `inserted`, `stale_cancelled`
    pub counters: BTreeMap<String, u64>,
    pub errors: Vec<String>,
    /// Errors beyond the capture cap, counted but not kept
    pub errors_dropped: u64,
}

impl PhaseResult {
    pub fn new(phase: RunPhase) -> Self {
        Self {
            phase,
            total_items: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            reused: 0,
            counters: BTreeMap::new(),
            errors: Vec::new(),
            errors_dropped: 0,
        }
    }

    pub fn bump(&mut self, counter: &str) {
        *self.counters.entry(counter.to_string()).or_default() += 1;
    }

    pub fn add(&mut self, counter: &str, amount: u64) {
        *self.counters.entry(counter.to_string()).or_default() += amount;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    /// Records a failure message, keeping at most `cap` of them.
    pub fn push_error(&mut self, message: String, cap: usize) {
        if self.errors.len() < cap {
            self.errors.push(message);
        } else {
            self.errors_dropped += 1;
        }
    }

    pub const fn has_failures(&self) -> bool {
        self.failed > 0 || self.errors_dropped > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub id: Uuid,
    pub requested_by: String,
    pub phase_flags: PhaseFlags,
    pub status: RunStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_phase: Option<RunPhase>,
    pub current_step: Option<String>,
    pub processed_items: u64,
    pub total_items: u64,
    pub phase_results: Vec<PhaseResult>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl OrchestrationRun {
    /// Last sign of life, used to spot abandoned runs.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.queued_at)
    }
}

/// Progress snapshot flushed to the run row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub current_phase: RunPhase,
    pub current_step: String,
    pub processed_items: u64,
    pub total_items: u64,
}

/// Per-phase line of a run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSummary {
    pub phase: RunPhase,
    pub total_items: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub reused: u64,
}

/// End-of-run message sent when something went wrong
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummaryNotification {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub requested_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: Option<i64>,
    pub phases: Vec<PhaseSummary>,
    pub errors: Vec<String>,
    pub fatal_error: Option<String>,
}
