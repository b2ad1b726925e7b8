//! End-of-run summary reporter

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::run::{PhaseResult, PhaseSummary, RunStatus, RunSummaryNotification};
use crate::domain::services::NotificationSink;

/// Everything known about a run once it has stopped
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub requested_by: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub phases: Vec<PhaseResult>,
    pub fatal_error: Option<String>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.fatal_error.is_some()
            || self.status == RunStatus::Failed
            || self.phases.iter().any(PhaseResult::has_failures)
    }

    pub fn to_notification(&self) -> RunSummaryNotification {
        let mut errors = Vec::new();
        for phase in &self.phases {
            errors.extend(phase.errors.iter().map(|e| format!("[{}] {e}", phase.phase)));
            if phase.errors_dropped > 0 {
                errors.push(format!(
                    "[{}] {} more errors not shown",
                    phase.phase, phase.errors_dropped
                ));
            }
        }

        RunSummaryNotification {
            run_id: self.run_id,
            status: self.status,
            requested_by: self.requested_by.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_secs: self
                .started_at
                .map(|started| (self.completed_at - started).num_seconds()),
            phases: self
                .phases
                .iter()
                .map(|p| PhaseSummary {
                    phase: p.phase,
                    total_items: p.total_items,
                    succeeded: p.succeeded,
                    failed: p.failed,
                    skipped: p.skipped,
                    reused: p.reused,
                })
                .collect(),
            errors,
            fatal_error: self.fatal_error.clone(),
        }
    }
}

pub struct SummaryReporter {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl SummaryReporter {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Sends the summary to every sink if the run had failures. Sink errors
    /// are logged and swallowed. Returns whether a summary went out.
    pub async fn report(&self, report: &RunReport) -> bool {
        if !report.has_failures() {
            info!(run_id = %report.run_id, status = %report.status, "Run finished cleanly, no summary sent");
            return false;
        }

        let notification = report.to_notification();
        for sink in &self.sinks {
            if let Err(e) = sink.send(&notification).await {
                warn!(run_id = %report.run_id, error = %e, "Failed to deliver run summary");
            }
        }
        true
    }
}
