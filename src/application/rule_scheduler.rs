//! Account rule scheduler
//!
//! Decides which accounts are due and moves each rule to its next billing
//! date once a cycle is done. Date math comes from the billing calculator;
//! this module only picks the anchor and persists the result.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::{debug, info};

use crate::domain::billing_period::{
    BillingError, PeriodType, anti_creep_anchor, billing_window, correct_drift, detect_drift,
    next_date_on_or_after,
};
use crate::domain::entities::{
    Account, AccountRule, AccountScheduleUpdate, Job, JobType, NewAccountRule, RuleAdvance, RuleId,
    ScheduledAccount,
};
use crate::domain::repositories::RuleRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced(RuleAdvance),
    /// The rule is under manual control and was left alone
    Overridden,
}

/// Computes the next schedule position from `anchor`.
///
/// Bi-weekly cadences are checked against the account's observed median
/// gap; when the projection is off by more than `drift_threshold_days` the
/// date is re-derived from `last_invoice_date`.
pub fn plan_advance(
    rule: &AccountRule,
    period: PeriodType,
    anchor: NaiveDate,
    last_invoice_date: Option<NaiveDate>,
    median_gap_days: Option<i64>,
    today: NaiveDate,
    drift_threshold_days: i64,
) -> Result<RuleAdvance, BillingError> {
    let mut next_run_date = next_date_on_or_after(period, anchor, today, rule.anchor_day_of_month)?;

    if period == PeriodType::BiWeekly {
        if let (Some(last_invoice), Some(median)) = (last_invoice_date, median_gap_days) {
            if median > 0 && detect_drift(next_run_date, last_invoice, median, drift_threshold_days)? {
                let corrected = correct_drift(last_invoice, median, today)?;
                debug!(
                    rule_id = rule.id,
                    projected = %next_run_date,
                    corrected = %corrected,
                    "Bi-weekly drift corrected"
                );
                next_run_date = corrected;
            }
        }
    }

    let (before, after) = rule.window_days(period);
    let (next_range_start, next_range_end) = billing_window(next_run_date, before, after)?;

    Ok(RuleAdvance {
        anchor_date: anchor,
        next_run_date,
        next_range_start,
        next_range_end,
    })
}

pub struct RuleScheduler {
    rules: Arc<dyn RuleRepository>,
    job_type: JobType,
    drift_threshold_days: i64,
}

impl RuleScheduler {
    pub fn new(rules: Arc<dyn RuleRepository>, job_type: JobType, drift_threshold_days: i64) -> Self {
        Self {
            rules,
            job_type,
            drift_threshold_days,
        }
    }

    pub const fn job_type(&self) -> JobType {
        self.job_type
    }

    pub async fn find_rule(&self, id: RuleId) -> Result<Option<AccountRule>> {
        self.rules.find_by_id(id).await
    }

    pub async fn accounts_without_rule(&self) -> Result<Vec<Account>> {
        self.rules.accounts_without_enabled_rule(self.job_type).await
    }

    pub async fn accounts_due(&self, today: NaiveDate) -> Result<Vec<ScheduledAccount>> {
        self.rules.find_due(today, self.job_type).await
    }

    pub async fn accounts_needing_credential_check(
        &self,
        today: NaiveDate,
        lead_days: i64,
    ) -> Result<Vec<ScheduledAccount>> {
        self.rules.find_upcoming(today, lead_days, self.job_type).await
    }

    /// Due rules first, then the ones coming up inside the lead window.
    pub async fn rules_within_horizon(
        &self,
        today: NaiveDate,
        lead_days: i64,
    ) -> Result<Vec<ScheduledAccount>> {
        let mut scheduled = self.accounts_due(today).await?;
        scheduled.extend(self.accounts_needing_credential_check(today, lead_days).await?);
        Ok(scheduled)
    }

    /// Moves the rule past a cycle that was actually retrieved.
    ///
    /// The anchor is the earlier of the expected and actual run dates, and
    /// the account's `last_invoice_date` moves to the actual date.
    pub async fn advance_rule(
        &self,
        rule: &AccountRule,
        account: &Account,
        completed_job: &Job,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        if rule.is_manually_overridden {
            info!(rule_id = rule.id, "Rule is overridden, not advancing");
            return Ok(AdvanceOutcome::Overridden);
        }

        let actual = completed_job.actual_run_date().unwrap_or(rule.next_run_date);
        let anchor = anti_creep_anchor(rule.next_run_date, actual);
        let last_invoice = Some(account.last_invoice_date.map_or(actual, |d| d.max(actual)));

        let advance = plan_advance(
            rule,
            account.period_type,
            anchor,
            last_invoice,
            account.median_gap_days,
            today,
            self.drift_threshold_days,
        )
        .with_context(|| format!("Failed to advance rule {}", rule.id))?;

        self.persist(rule, &advance, Some(actual), now).await?;
        info!(
            rule_id = rule.id,
            account_id = account.id,
            anchor = %advance.anchor_date,
            next_run_date = %advance.next_run_date,
            "Rule advanced after retrieval"
        );
        Ok(AdvanceOutcome::Advanced(advance))
    }

    /// Moves the rule past a cycle that produced nothing (stale or
    /// permanently failed), anchoring on the expected date.
    pub async fn advance_without_run(
        &self,
        rule: &AccountRule,
        account: &Account,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        if rule.is_manually_overridden {
            info!(rule_id = rule.id, "Rule is overridden, not advancing");
            return Ok(AdvanceOutcome::Overridden);
        }

        let advance = plan_advance(
            rule,
            account.period_type,
            rule.next_run_date,
            account.last_invoice_date,
            account.median_gap_days,
            today,
            self.drift_threshold_days,
        )
        .with_context(|| format!("Failed to advance rule {}", rule.id))?;

        self.persist(rule, &advance, None, now).await?;
        info!(
            rule_id = rule.id,
            account_id = account.id,
            next_run_date = %advance.next_run_date,
            "Rule advanced without retrieval"
        );
        Ok(AdvanceOutcome::Advanced(advance))
    }

    async fn persist(
        &self,
        rule: &AccountRule,
        advance: &RuleAdvance,
        last_invoice_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let schedule = AccountScheduleUpdate {
            next_due_date: advance.next_run_date,
            window_start: advance.next_range_start,
            window_end: advance.next_range_end,
            last_invoice_date,
        };
        self.rules.apply_advance(rule.id, advance, &schedule, now).await
    }

    /// Creates the enabled rule for an account that has none.
    ///
    /// The first run date is the account's `next_due_date`, else its last
    /// invoice projected forward, else `today`.
    pub async fn ensure_rule(
        &self,
        account: &Account,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleId>> {
        if self.rules.find_enabled(account.id, self.job_type).await?.is_some() {
            return Ok(None);
        }

        let rule = initial_rule(account, self.job_type, today)
            .with_context(|| format!("Failed to schedule account {}", account.id))?;
        let id = self.rules.create_rule(&rule, now).await?;
        info!(
            account_id = account.id,
            rule_id = id,
            next_run_date = %rule.next_run_date,
            "Backfilled account rule"
        );
        Ok(Some(id))
    }
}

fn initial_rule(account: &Account, job_type: JobType, today: NaiveDate) -> Result<NewAccountRule, BillingError> {
    let period = account.period_type;
    let next_run_date = match (account.next_due_date, account.last_invoice_date) {
        (Some(due), _) => due,
        (None, Some(last)) => next_date_on_or_after(period, last, today, None)?,
        (None, None) => today,
    };
    let anchor_day_of_month = period
        .months()
        .map(|_| account.last_invoice_date.unwrap_or(next_run_date).day());
    let (before, after) = period.default_window_days();
    let (next_range_start, next_range_end) = billing_window(next_run_date, before, after)?;

    Ok(NewAccountRule {
        account_id: account.id,
        job_type,
        priority: 0,
        anchor_date: account.last_invoice_date.or(Some(next_run_date)),
        anchor_day_of_month,
        next_run_date,
        next_range_start,
        next_range_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job_state::JobStatus;
    use crate::domain::repositories::AccountRepository;
    use crate::infrastructure::account_repository::{SqliteAccountRepository, SqliteRuleRepository};
    use crate::test_utils::{TestDatabase, date, sync_row};
    use chrono::TimeZone;

    fn rule(next_run_date: NaiveDate) -> AccountRule {
        let now = Utc::now();
        AccountRule {
            id: 1,
            account_id: 1,
            job_type: JobType::Adr,
            is_enabled: true,
            priority: 0,
            anchor_date: None,
            anchor_day_of_month: None,
            next_run_date,
            next_range_start: next_run_date,
            next_range_end: next_run_date,
            window_days_before: None,
            window_days_after: None,
            is_manually_overridden: false,
            overridden_by: None,
            overridden_at: None,
            last_advanced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn late_run_keeps_expected_anchor() {
        // Cycle anchored 2024-12-23, expected 2025-01-23, retrieved 2025-01-27.
        let expected = date(2025, 1, 23);
        let anchor = anti_creep_anchor(expected, date(2025, 1, 27));
        assert_eq!(anchor, expected);

        let advance = plan_advance(
            &rule(expected),
            PeriodType::Monthly,
            anchor,
            None,
            None,
            date(2025, 1, 27),
            3,
        )
        .unwrap();
        assert_eq!(advance.next_run_date, date(2025, 2, 23));
        assert_eq!(advance.next_range_start, date(2025, 2, 18));
        assert_eq!(advance.next_range_end, date(2025, 2, 28));
    }

    #[test]
    fn biweekly_drift_snaps_to_invoice_cadence() {
        // Projection lands on 03-14 but invoices arrive every 15 days from 02-20.
        let advance = plan_advance(
            &rule(date(2025, 2, 28)),
            PeriodType::BiWeekly,
            date(2025, 2, 28),
            Some(date(2025, 2, 20)),
            Some(15),
            date(2025, 3, 1),
            3,
        )
        .unwrap();
        assert_eq!(advance.next_run_date, date(2025, 3, 7));
    }

    #[test]
    fn small_drift_is_tolerated() {
        let advance = plan_advance(
            &rule(date(2025, 2, 28)),
            PeriodType::BiWeekly,
            date(2025, 2, 28),
            Some(date(2025, 2, 27)),
            Some(14),
            date(2025, 3, 1),
            3,
        )
        .unwrap();
        assert_eq!(advance.next_run_date, date(2025, 3, 14));
    }

    #[test]
    fn initial_rule_projects_last_invoice() {
        let mut account = crate::test_utils::account_fixture(1);
        account.period_type = PeriodType::Quarterly;
        account.last_invoice_date = Some(date(2024, 6, 30));
        account.next_due_date = None;

        let rule = initial_rule(&account, JobType::Adr, date(2025, 1, 10)).unwrap();
        assert_eq!(rule.next_run_date, date(2025, 3, 30));
        assert_eq!(rule.anchor_date, Some(date(2024, 6, 30)));
        assert_eq!(rule.anchor_day_of_month, Some(30));
    }

    #[tokio::test]
    async fn ensure_rule_is_idempotent() -> Result<()> {
        let db = TestDatabase::new().await?;
        let accounts = SqliteAccountRepository::new(db.pool().clone());
        let rules = Arc::new(SqliteRuleRepository::new(db.pool().clone()));
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        accounts.sync_accounts(&[sync_row("K1", "ACC-1")], now).await?;
        let account = accounts.find_live().await?.remove(0);

        let scheduler = RuleScheduler::new(rules.clone(), JobType::Adr, 3);
        let created = scheduler.ensure_rule(&account, now.date_naive(), now).await?;
        assert!(created.is_some());
        assert_eq!(scheduler.ensure_rule(&account, now.date_naive(), now).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn overridden_rule_is_not_advanced() -> Result<()> {
        let db = TestDatabase::new().await?;
        let accounts = SqliteAccountRepository::new(db.pool().clone());
        let rules = Arc::new(SqliteRuleRepository::new(db.pool().clone()));
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        accounts.sync_accounts(&[sync_row("K1", "ACC-1")], now).await?;
        let account = accounts.find_live().await?.remove(0);

        let scheduler = RuleScheduler::new(rules.clone(), JobType::Adr, 3);
        let rule_id = scheduler
            .ensure_rule(&account, now.date_naive(), now)
            .await?
            .expect("rule created");
        rules.set_override(rule_id, Some("ops@example.com"), now).await?;
        let rule = rules.find_by_id(rule_id).await?.expect("rule");

        let outcome = scheduler
            .advance_without_run(&rule, &account, now.date_naive(), now)
            .await?;
        assert_eq!(outcome, AdvanceOutcome::Overridden);
        let unchanged = rules.find_by_id(rule_id).await?.expect("rule");
        assert_eq!(unchanged.next_run_date, rule.next_run_date);
        Ok(())
    }

    #[tokio::test]
    async fn completed_cycle_moves_account_schedule() -> Result<()> {
        let db = TestDatabase::new().await?;
        let accounts = SqliteAccountRepository::new(db.pool().clone());
        let rules = Arc::new(SqliteRuleRepository::new(db.pool().clone()));
        let now = Utc.with_ymd_and_hms(2025, 1, 27, 9, 0, 0).unwrap();

        let mut row = sync_row("K1", "ACC-1");
        row.next_due_date = Some(date(2025, 1, 23));
        row.last_invoice_date = Some(date(2024, 12, 23));
        accounts.sync_accounts(&[row], now).await?;
        let account = accounts.find_live().await?.remove(0);

        let scheduler = RuleScheduler::new(rules.clone(), JobType::Adr, 3);
        let rule_id = scheduler
            .ensure_rule(&account, now.date_naive(), now)
            .await?
            .expect("rule created");
        let rule = rules.find_by_id(rule_id).await?.expect("rule");
        assert_eq!(rule.next_run_date, date(2025, 1, 23));

        let mut job = crate::test_utils::job_fixture(1, account.id, date(2025, 1, 23));
        job.status = JobStatus::Completed;
        job.scrape_requested_at = Some(now);

        let outcome = scheduler
            .advance_rule(&rule, &account, &job, now.date_naive(), now)
            .await?;
        let AdvanceOutcome::Advanced(advance) = outcome else {
            panic!("expected advance");
        };
        assert_eq!(advance.anchor_date, date(2025, 1, 23));
        assert_eq!(advance.next_run_date, date(2025, 2, 23));

        let refreshed = accounts.find_by_id(account.id).await?.expect("account");
        assert_eq!(refreshed.next_due_date, Some(date(2025, 2, 23)));
        assert_eq!(refreshed.last_invoice_date, Some(date(2025, 1, 27)));
        Ok(())
    }
}
