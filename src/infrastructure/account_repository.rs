//! SQLite account and rule repositories

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::domain::billing_period::PeriodType;
use crate::domain::entities::{
    Account, AccountId, AccountRule, AccountScheduleUpdate, AccountSyncRow, JobType,
    NewAccountRule, RuleAdvance, RuleId, ScheduledAccount, SyncOutcome,
};
use crate::domain::repositories::{AccountRepository, RuleRepository};

/// Account columns aliased with an `a_` prefix so they can be joined
/// alongside rule or job columns.
pub(crate) const ACCOUNT_COLUMNS: &str = "a.id AS a_id, a.source_key AS a_source_key, \
    a.external_id AS a_external_id, a.credential_ref AS a_credential_ref, \
    a.vendor_code AS a_vendor_code, a.vendor_name AS a_vendor_name, \
    a.period_type AS a_period_type, a.period_days AS a_period_days, \
    a.median_gap_days AS a_median_gap_days, a.last_invoice_date AS a_last_invoice_date, \
    a.next_due_date AS a_next_due_date, a.window_start AS a_window_start, \
    a.window_end AS a_window_end, a.is_missing AS a_is_missing, \
    a.is_manually_overridden AS a_is_manually_overridden, a.overridden_by AS a_overridden_by, \
    a.overridden_at AS a_overridden_at, a.is_deleted AS a_is_deleted, \
    a.deleted_at AS a_deleted_at, a.created_at AS a_created_at, a.updated_at AS a_updated_at";

pub(crate) fn row_to_account(row: &SqliteRow) -> Result<Account> {
    let period_type: String = row.try_get("a_period_type")?;
    Ok(Account {
        id: row.try_get("a_id")?,
        source_key: row.try_get("a_source_key")?,
        external_id: row.try_get("a_external_id")?,
        credential_ref: row.try_get("a_credential_ref")?,
        vendor_code: row.try_get("a_vendor_code")?,
        vendor_name: row.try_get("a_vendor_name")?,
        period_type: period_type.parse::<PeriodType>().map_err(|e| anyhow!(e))?,
        period_days: row.try_get("a_period_days")?,
        median_gap_days: row.try_get("a_median_gap_days")?,
        last_invoice_date: row.try_get("a_last_invoice_date")?,
        next_due_date: row.try_get("a_next_due_date")?,
        window_start: row.try_get("a_window_start")?,
        window_end: row.try_get("a_window_end")?,
        is_missing: row.try_get("a_is_missing")?,
        is_manually_overridden: row.try_get("a_is_manually_overridden")?,
        overridden_by: row.try_get("a_overridden_by")?,
        overridden_at: row.try_get("a_overridden_at")?,
        is_deleted: row.try_get("a_is_deleted")?,
        deleted_at: row.try_get("a_deleted_at")?,
        created_at: row.try_get("a_created_at")?,
        updated_at: row.try_get("a_updated_at")?,
    })
}

pub(crate) fn row_to_rule(row: &SqliteRow) -> Result<AccountRule> {
    let job_type: String = row.try_get("job_type")?;
    Ok(AccountRule {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        job_type: job_type.parse::<JobType>().map_err(|e| anyhow!(e))?,
        is_enabled: row.try_get("is_enabled")?,
        priority: row.try_get("priority")?,
        anchor_date: row.try_get("anchor_date")?,
        anchor_day_of_month: row.try_get("anchor_day_of_month")?,
        next_run_date: row.try_get("next_run_date")?,
        next_range_start: row.try_get("next_range_start")?,
        next_range_end: row.try_get("next_range_end")?,
        window_days_before: row.try_get("window_days_before")?,
        window_days_after: row.try_get("window_days_after")?,
        is_manually_overridden: row.try_get("is_manually_overridden")?,
        overridden_by: row.try_get("overridden_by")?,
        overridden_at: row.try_get("overridden_at")?,
        last_advanced_at: row.try_get("last_advanced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ============================================================================
// AccountRepository
// ============================================================================

pub struct SqliteAccountRepository {
    pool: SqlitePool,
}

/// Field values sync would write for an existing account
#[derive(Debug, PartialEq, Eq)]
struct SyncedFields {
    external_id: String,
    credential_ref: Option<String>,
    vendor_code: String,
    vendor_name: Option<String>,
    last_invoice_date: Option<NaiveDate>,
    is_missing: bool,
    period_type: PeriodType,
    period_days: Option<i64>,
    median_gap_days: Option<i64>,
    next_due_date: Option<NaiveDate>,
}

impl SyncedFields {
    fn current(account: &Account) -> Self {
        Self {
            external_id: account.external_id.clone(),
            credential_ref: account.credential_ref.clone(),
            vendor_code: account.vendor_code.clone(),
            vendor_name: account.vendor_name.clone(),
            last_invoice_date: account.last_invoice_date,
            is_missing: account.is_missing,
            period_type: account.period_type,
            period_days: account.period_days,
            median_gap_days: account.median_gap_days,
            next_due_date: account.next_due_date,
        }
    }

    /// What the account looks like after applying `row`. Override-protected
    /// fields keep their current values, the invoice date never moves
    /// backwards and a feed without a due date keeps the computed one.
    fn merged(account: &Account, row: &AccountSyncRow) -> Self {
        let last_invoice_date = match (account.last_invoice_date, row.last_invoice_date) {
            (Some(current), Some(incoming)) => Some(current.max(incoming)),
            (current, incoming) => incoming.or(current),
        };
        let mut merged = Self {
            external_id: row.external_id.clone(),
            credential_ref: row.credential_ref.clone(),
            vendor_code: row.vendor_code.clone(),
            vendor_name: row.vendor_name.clone(),
            last_invoice_date,
            is_missing: row.is_missing,
            period_type: row.period_type,
            period_days: row.period_days,
            median_gap_days: row.median_gap_days,
            next_due_date: row.next_due_date.or(account.next_due_date),
        };
        if account.is_manually_overridden {
            merged.period_type = account.period_type;
            merged.period_days = account.period_days;
            merged.median_gap_days = account.median_gap_days;
            merged.next_due_date = account.next_due_date;
        }
        merged
    }
}

impl SqliteAccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_account(
        tx: &mut Transaction<'_, Sqlite>,
        row: &AccountSyncRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO accounts (
                source_key, external_id, credential_ref, vendor_code, vendor_name,
                period_type, period_days, median_gap_days, last_invoice_date, next_due_date,
                is_missing, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&row.source_key)
        .bind(&row.external_id)
        .bind(&row.credential_ref)
        .bind(&row.vendor_code)
        .bind(&row.vendor_name)
        .bind(row.period_type.as_str())
        .bind(row.period_days)
        .bind(row.median_gap_days)
        .bind(row.last_invoice_date)
        .bind(row.next_due_date)
        .bind(row.is_missing)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_account(
        tx: &mut Transaction<'_, Sqlite>,
        id: AccountId,
        fields: &SyncedFields,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE accounts SET
                external_id = ?, credential_ref = ?, vendor_code = ?, vendor_name = ?,
                last_invoice_date = ?, is_missing = ?, period_type = ?, period_days = ?,
                median_gap_days = ?, next_due_date = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&fields.external_id)
        .bind(&fields.credential_ref)
        .bind(&fields.vendor_code)
        .bind(&fields.vendor_name)
        .bind(fields.last_invoice_date)
        .bind(fields.is_missing)
        .bind(fields.period_type.as_str())
        .bind(fields.period_days)
        .bind(fields.median_gap_days)
        .bind(fields.next_due_date)
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn restore_account(
        tx: &mut Transaction<'_, Sqlite>,
        id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE accounts SET is_deleted = 0, deleted_at = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&mut **tx)
            .await?;

        // Latest rule per job type comes back, unless one is already enabled.
        sqlx::query(
            r"
            UPDATE account_rules SET is_enabled = 1, updated_at = ?
            WHERE id IN (
                SELECT MAX(id) FROM account_rules WHERE account_id = ? GROUP BY job_type
            )
            AND is_enabled = 0
            AND NOT EXISTS (
                SELECT 1 FROM account_rules other
                WHERE other.account_id = account_rules.account_id
                  AND other.job_type = account_rules.job_type
                  AND other.is_enabled = 1
            )
            ",
        )
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountRepository for SqliteAccountRepository {
    async fn sync_accounts(&self, rows: &[AccountSyncRow], now: DateTime<Utc>) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        // Last row wins when the feed repeats a key.
        let mut incoming: HashMap<&str, &AccountSyncRow> = HashMap::with_capacity(rows.len());
        for row in rows {
            if incoming.insert(row.source_key.as_str(), row).is_some() {
                warn!(source_key = %row.source_key, "Duplicate source key in account feed");
            }
        }

        let mut tx = self.pool.begin().await?;

        let existing_rows = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts a"))
            .fetch_all(&mut *tx)
            .await?;
        let mut existing: HashMap<String, Account> = HashMap::with_capacity(existing_rows.len());
        for row in &existing_rows {
            let account = row_to_account(row)?;
            existing.insert(account.source_key.clone(), account);
        }

        for (source_key, row) in &incoming {
            match existing.get(*source_key) {
                None => {
                    Self::insert_account(&mut tx, row, now).await?;
                    outcome.inserted += 1;
                }
                Some(account) => {
                    if account.is_deleted {
                        Self::restore_account(&mut tx, account.id, now).await?;
                        outcome.restored += 1;
                    }
                    let merged = SyncedFields::merged(account, row);
                    if merged == SyncedFields::current(account) {
                        if !account.is_deleted {
                            outcome.unchanged += 1;
                        }
                    } else {
                        Self::update_account(&mut tx, account.id, &merged, now).await?;
                        outcome.updated += 1;
                    }
                }
            }
        }

        if incoming.is_empty() {
            warn!("Account feed is empty, skipping deletion pass");
        } else {
            for account in existing.values() {
                if account.is_deleted || incoming.contains_key(account.source_key.as_str()) {
                    continue;
                }
                sqlx::query(
                    "UPDATE accounts SET is_deleted = 1, deleted_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(now)
                .bind(account.id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE account_rules SET is_enabled = 0, updated_at = ? WHERE account_id = ? AND is_enabled = 1",
                )
                .bind(now)
                .bind(account.id)
                .execute(&mut *tx)
                .await?;
                outcome.marked_deleted += 1;
            }
        }

        tx.commit().await?;

        info!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            marked_deleted = outcome.marked_deleted,
            restored = outcome.restored,
            "Account sync applied"
        );
        Ok(outcome)
    }

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn find_live(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.is_deleted = 0 ORDER BY a.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_account).collect()
    }

    async fn set_override(&self, id: AccountId, overridden_by: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE accounts SET
                is_manually_overridden = ?, overridden_by = ?, overridden_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(overridden_by.is_some())
        .bind(overridden_by)
        .bind(overridden_by.map(|_| now))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// RuleRepository
// ============================================================================

pub struct SqliteRuleRepository {
    pool: SqlitePool,
}

impl SqliteRuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn scheduled_select(filter: &str) -> String {
        format!(
            "SELECT r.*, {ACCOUNT_COLUMNS} FROM account_rules r \
             JOIN accounts a ON a.id = r.account_id \
             WHERE r.is_enabled = 1 AND a.is_deleted = 0 AND r.job_type = ? AND {filter} \
             ORDER BY r.priority DESC, r.next_run_date, r.id"
        )
    }

    fn rows_to_scheduled(rows: &[SqliteRow]) -> Result<Vec<ScheduledAccount>> {
        rows.iter()
            .map(|row| {
                Ok(ScheduledAccount {
                    rule: row_to_rule(row)?,
                    account: row_to_account(row)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RuleRepository for SqliteRuleRepository {
    async fn create_rule(&self, rule: &NewAccountRule, now: DateTime<Utc>) -> Result<RuleId> {
        let result = sqlx::query(
            r"
            INSERT INTO account_rules (
                account_id, job_type, is_enabled, priority, anchor_date, anchor_day_of_month,
                next_run_date, next_range_start, next_range_end, created_at, updated_at
            ) VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(rule.account_id)
        .bind(rule.job_type.as_str())
        .bind(rule.priority)
        .bind(rule.anchor_date)
        .bind(rule.anchor_day_of_month)
        .bind(rule.next_run_date)
        .bind(rule.next_range_start)
        .bind(rule.next_range_end)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(rule_id = id, account_id = rule.account_id, "Created account rule");
        Ok(id)
    }

    async fn find_by_id(&self, id: RuleId) -> Result<Option<AccountRule>> {
        let row = sqlx::query("SELECT * FROM account_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_rule).transpose()
    }

    async fn find_enabled(&self, account_id: AccountId, job_type: JobType) -> Result<Option<AccountRule>> {
        let row = sqlx::query(
            "SELECT * FROM account_rules WHERE account_id = ? AND job_type = ? AND is_enabled = 1",
        )
        .bind(account_id)
        .bind(job_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_rule).transpose()
    }

    async fn accounts_without_enabled_rule(&self, job_type: JobType) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts a \
             WHERE a.is_deleted = 0 AND NOT EXISTS ( \
                 SELECT 1 FROM account_rules r \
                 WHERE r.account_id = a.id AND r.job_type = ? AND r.is_enabled = 1) \
             ORDER BY a.id"
        ))
        .bind(job_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_account).collect()
    }

    async fn find_due(&self, today: NaiveDate, job_type: JobType) -> Result<Vec<ScheduledAccount>> {
        let rows = sqlx::query(&Self::scheduled_select("r.next_run_date <= ?"))
            .bind(job_type.as_str())
            .bind(today)
            .fetch_all(&self.pool)
            .await?;
        Self::rows_to_scheduled(&rows)
    }

    async fn find_upcoming(&self, today: NaiveDate, lead_days: i64, job_type: JobType) -> Result<Vec<ScheduledAccount>> {
        let horizon = today + chrono::Duration::days(lead_days);
        let rows = sqlx::query(&Self::scheduled_select("r.next_run_date > ? AND r.next_run_date <= ?"))
            .bind(job_type.as_str())
            .bind(today)
            .bind(horizon)
            .fetch_all(&self.pool)
            .await?;
        Self::rows_to_scheduled(&rows)
    }

    async fn apply_advance(
        &self,
        rule_id: RuleId,
        advance: &RuleAdvance,
        account: &AccountScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            UPDATE account_rules SET
                anchor_date = ?, next_run_date = ?, next_range_start = ?, next_range_end = ?,
                last_advanced_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(advance.anchor_date)
        .bind(advance.next_run_date)
        .bind(advance.next_range_start)
        .bind(advance.next_range_end)
        .bind(now)
        .bind(now)
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("account rule {rule_id} not found"));
        }

        // Overridden accounts keep their hand-set schedule fields.
        sqlx::query(
            r"
            UPDATE accounts SET
                next_due_date = CASE WHEN is_manually_overridden = 1 THEN next_due_date ELSE ? END,
                window_start = CASE WHEN is_manually_overridden = 1 THEN window_start ELSE ? END,
                window_end = CASE WHEN is_manually_overridden = 1 THEN window_end ELSE ? END,
                last_invoice_date = CASE
                    WHEN ? IS NULL THEN last_invoice_date
                    WHEN last_invoice_date IS NULL OR last_invoice_date < ? THEN ?
                    ELSE last_invoice_date END,
                updated_at = ?
            WHERE id = (SELECT account_id FROM account_rules WHERE id = ?)
            ",
        )
        .bind(account.next_due_date)
        .bind(account.window_start)
        .bind(account.window_end)
        .bind(account.last_invoice_date)
        .bind(account.last_invoice_date)
        .bind(account.last_invoice_date)
        .bind(now)
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_override(&self, id: RuleId, overridden_by: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE account_rules SET
                is_manually_overridden = ?, overridden_by = ?, overridden_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(overridden_by.is_some())
        .bind(overridden_by)
        .bind(overridden_by.map(|_| now))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestDatabase, sync_row};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn sync_is_idempotent() -> Result<()> {
        let db = TestDatabase::new().await?;
        let repo = SqliteAccountRepository::new(db.pool().clone());
        let rows = vec![sync_row("K1", "ACC-1"), sync_row("K2", "ACC-2")];
        let now = Utc::now();

        let first = repo.sync_accounts(&rows, now).await?;
        assert_eq!(first.inserted, 2);

        let second = repo.sync_accounts(&rows, now).await?;
        assert_eq!(
            second,
            SyncOutcome {
                unchanged: 2,
                ..SyncOutcome::default()
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn absent_accounts_are_soft_deleted_and_restored() -> Result<()> {
        let db = TestDatabase::new().await?;
        let repo = SqliteAccountRepository::new(db.pool().clone());
        let rules = SqliteRuleRepository::new(db.pool().clone());
        let now = Utc::now();

        repo.sync_accounts(&[sync_row("K1", "ACC-1"), sync_row("K2", "ACC-2")], now).await?;
        let k2 = repo.find_live().await?.into_iter().find(|a| a.source_key == "K2").unwrap();
        rules
            .create_rule(
                &NewAccountRule {
                    account_id: k2.id,
                    job_type: JobType::Adr,
                    priority: 0,
                    anchor_date: None,
                    anchor_day_of_month: None,
                    next_run_date: date(2025, 3, 1),
                    next_range_start: date(2025, 2, 24),
                    next_range_end: date(2025, 3, 6),
                },
                now,
            )
            .await?;

        let outcome = repo.sync_accounts(&[sync_row("K1", "ACC-1")], now).await?;
        assert_eq!(outcome.marked_deleted, 1);
        assert!(repo.find_by_id(k2.id).await?.unwrap().is_deleted);
        assert!(rules.find_enabled(k2.id, JobType::Adr).await?.is_none());

        let outcome = repo
            .sync_accounts(&[sync_row("K1", "ACC-1"), sync_row("K2", "ACC-2")], now)
            .await?;
        assert_eq!(outcome.restored, 1);
        assert!(!repo.find_by_id(k2.id).await?.unwrap().is_deleted);
        assert!(rules.find_enabled(k2.id, JobType::Adr).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn override_protects_schedule_fields() -> Result<()> {
        let db = TestDatabase::new().await?;
        let repo = SqliteAccountRepository::new(db.pool().clone());
        let now = Utc::now();

        repo.sync_accounts(&[sync_row("K1", "ACC-1")], now).await?;
        let account = repo.find_live().await?.remove(0);
        repo.set_override(account.id, Some("ops@example.com"), now).await?;

        let mut changed = sync_row("K1", "ACC-1");
        changed.period_type = PeriodType::Quarterly;
        changed.vendor_name = Some("Renamed Vendor".into());
        repo.sync_accounts(&[changed], now).await?;

        let after = repo.find_by_id(account.id).await?.unwrap();
        assert_eq!(after.period_type, PeriodType::Monthly);
        assert_eq!(after.vendor_name.as_deref(), Some("Renamed Vendor"));
        Ok(())
    }

    #[tokio::test]
    async fn only_one_enabled_rule_per_account() -> Result<()> {
        let db = TestDatabase::new().await?;
        let accounts = SqliteAccountRepository::new(db.pool().clone());
        let rules = SqliteRuleRepository::new(db.pool().clone());
        let now = Utc::now();
        accounts.sync_accounts(&[sync_row("K1", "ACC-1")], now).await?;
        let account = accounts.find_live().await?.remove(0);

        let rule = NewAccountRule {
            account_id: account.id,
            job_type: JobType::Adr,
            priority: 0,
            anchor_date: None,
            anchor_day_of_month: None,
            next_run_date: date(2025, 3, 1),
            next_range_start: date(2025, 2, 24),
            next_range_end: date(2025, 3, 6),
        };
        rules.create_rule(&rule, now).await?;
        assert!(rules.create_rule(&rule, now).await.is_err());
        assert!(rules.accounts_without_enabled_rule(JobType::Adr).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn due_and_upcoming_split_on_today() -> Result<()> {
        let db = TestDatabase::new().await?;
        let accounts = SqliteAccountRepository::new(db.pool().clone());
        let rules = SqliteRuleRepository::new(db.pool().clone());
        let now = Utc::now();
        accounts
            .sync_accounts(&[sync_row("K1", "ACC-1"), sync_row("K2", "ACC-2")], now)
            .await?;
        let live = accounts.find_live().await?;

        for (account, run) in live.iter().zip([date(2025, 3, 10), date(2025, 3, 14)]) {
            rules
                .create_rule(
                    &NewAccountRule {
                        account_id: account.id,
                        job_type: JobType::Adr,
                        priority: 0,
                        anchor_date: None,
                        anchor_day_of_month: None,
                        next_run_date: run,
                        next_range_start: run,
                        next_range_end: run,
                    },
                    now,
                )
                .await?;
        }

        let today = date(2025, 3, 10);
        let due = rules.find_due(today, JobType::Adr).await?;
        let upcoming = rules.find_upcoming(today, 7, JobType::Adr).await?;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].account.source_key, "K1");
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].account.source_key, "K2");
        Ok(())
    }
}
