//! Billing period calculator
//!
//! Pure calendar arithmetic for account billing cadences. Nothing in here
//! touches the database or the clock: callers pass `today` in explicitly.
//!
//! Month-based periods preserve the anchor day-of-month and clamp to the
//! last day of short months, so an account billed on the 31st goes
//! Jan 31 → Feb 28 → Mar 31 instead of sticking to the 28th forever.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on forward steps when rolling an anchor up to `today`.
pub const MAX_ADVANCE_STEPS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("anchor {anchor} did not reach {target} within {steps} {period} advances")]
    IterationLimit {
        period: PeriodType,
        anchor: NaiveDate,
        target: NaiveDate,
        steps: usize,
    },

    #[error("date arithmetic overflowed from {0}")]
    OutOfRange(NaiveDate),

    #[error("median gap must be positive, got {0} days")]
    InvalidMedian(i64),

    #[error("unknown billing period type: {0}")]
    UnknownPeriodType(String),
}

/// Billing cadence of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum PeriodType {
    BiWeekly,
    Monthly,
    BiMonthly,
    Quarterly,
    SemiAnnually,
    Annually,
}

impl PeriodType {
    pub const ALL: [Self; 6] = [
        Self::BiWeekly,
        Self::Monthly,
        Self::BiMonthly,
        Self::Quarterly,
        Self::SemiAnnually,
        Self::Annually,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BiWeekly => "BiWeekly",
            Self::Monthly => "Monthly",
            Self::BiMonthly => "BiMonthly",
            Self::Quarterly => "Quarterly",
            Self::SemiAnnually => "SemiAnnually",
            Self::Annually => "Annually",
        }
    }

    /// Calendar months per period; `None` for day-based cadences.
    pub const fn months(self) -> Option<u32> {
        match self {
            Self::BiWeekly => None,
            Self::Monthly => Some(1),
            Self::BiMonthly => Some(2),
            Self::Quarterly => Some(3),
            Self::SemiAnnually => Some(6),
            Self::Annually => Some(12),
        }
    }

    /// Nominal length in days, used for lookbacks and sanity checks only.
    pub const fn nominal_days(self) -> i64 {
        match self {
            Self::BiWeekly => 14,
            Self::Monthly => 30,
            Self::BiMonthly => 61,
            Self::Quarterly => 91,
            Self::SemiAnnually => 182,
            Self::Annually => 365,
        }
    }

    /// Default (days before, days after) for the billing window.
    pub const fn default_window_days(self) -> (i64, i64) {
        match self {
            Self::BiWeekly => (3, 3),
            Self::Monthly => (5, 5),
            Self::BiMonthly => (7, 7),
            Self::Quarterly => (10, 10),
            Self::SemiAnnually => (14, 14),
            Self::Annually => (21, 21),
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = BillingError;

    /// Accepts both the stored names and the feed labels ("Bi-Weekly", "Semi Annual", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "biweekly" => Ok(Self::BiWeekly),
            "monthly" => Ok(Self::Monthly),
            "bimonthly" => Ok(Self::BiMonthly),
            "quarterly" => Ok(Self::Quarterly),
            "semiannually" | "semiannual" => Ok(Self::SemiAnnually),
            "annually" | "annual" | "yearly" => Ok(Self::Annually),
            _ => Err(BillingError::UnknownPeriodType(s.to_string())),
        }
    }
}

impl TryFrom<String> for PeriodType {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Last calendar day of the given month.
pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |last| last.day())
}

/// Add whole months, landing on `day_of_month` or the month's last day if shorter.
pub fn add_months_clamped(
    date: NaiveDate,
    months: u32,
    day_of_month: u32,
) -> Result<NaiveDate, BillingError> {
    let total = date.year() * 12 + date.month0() as i32 + months as i32;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let day = day_of_month.clamp(1, last_day_of_month(year, month));

    NaiveDate::from_ymd_opt(year, month, day).ok_or(BillingError::OutOfRange(date))
}

/// One period forward from `anchor`.
///
/// `anchor_day_of_month` overrides the anchor's own day for month-based
/// periods; pass the original billing day so a clamped date (Feb 28) can
/// spring back to the 31st the following month.
pub fn next_date(
    period: PeriodType,
    anchor: NaiveDate,
    anchor_day_of_month: Option<u32>,
) -> Result<NaiveDate, BillingError> {
    match period.months() {
        None => anchor
            .checked_add_signed(Duration::days(14))
            .ok_or(BillingError::OutOfRange(anchor)),
        Some(months) => {
            let day = anchor_day_of_month.unwrap_or_else(|| anchor.day());
            add_months_clamped(anchor, months, day)
        }
    }
}

/// First period date strictly after `anchor` that is on or after `today`.
pub fn next_date_on_or_after(
    period: PeriodType,
    anchor: NaiveDate,
    today: NaiveDate,
    anchor_day_of_month: Option<u32>,
) -> Result<NaiveDate, BillingError> {
    let day = anchor_day_of_month.or_else(|| period.months().map(|_| anchor.day()));

    let mut candidate = next_date(period, anchor, day)?;
    for _ in 1..MAX_ADVANCE_STEPS {
        if candidate >= today {
            return Ok(candidate);
        }
        candidate = next_date(period, candidate, day)?;
    }

    if candidate >= today {
        Ok(candidate)
    } else {
        Err(BillingError::IterationLimit {
            period,
            anchor,
            target: today,
            steps: MAX_ADVANCE_STEPS,
        })
    }
}

/// `date` moved by a signed number of days, or `OutOfRange` past chrono's calendar.
fn shift_days(date: NaiveDate, days: i64) -> Result<NaiveDate, BillingError> {
    let magnitude = Days::new(days.unsigned_abs());
    let shifted = if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    };
    shifted.ok_or(BillingError::OutOfRange(date))
}

/// Inclusive window `[run - before, run + after]`. Negative widths count as zero.
pub fn billing_window(
    next_run_date: NaiveDate,
    days_before: i64,
    days_after: i64,
) -> Result<(NaiveDate, NaiveDate), BillingError> {
    Ok((
        shift_days(next_run_date, -days_before.max(0))?,
        shift_days(next_run_date, days_after.max(0))?,
    ))
}

/// Whether the naive projection has wandered away from the observed cadence.
pub fn detect_drift(
    calculated: NaiveDate,
    last_invoice_date: NaiveDate,
    median_days: i64,
    threshold_days: i64,
) -> Result<bool, BillingError> {
    let expected = shift_days(last_invoice_date, median_days)?;
    Ok((calculated - expected).num_days().abs() > threshold_days)
}

/// Re-derive the next date from the last real invoice using the median gap.
pub fn correct_drift(
    last_invoice_date: NaiveDate,
    median_days: i64,
    today: NaiveDate,
) -> Result<NaiveDate, BillingError> {
    if median_days <= 0 {
        return Err(BillingError::InvalidMedian(median_days));
    }

    let first = shift_days(last_invoice_date, median_days)?;
    if first >= today {
        return Ok(first);
    }

    let behind = (today - first).num_days();
    let steps = (behind + median_days - 1) / median_days;
    let ahead = steps
        .checked_mul(median_days)
        .ok_or(BillingError::OutOfRange(first))?;
    shift_days(first, ahead)
}

/// Anchor to carry forward after a completed cycle.
///
/// On-time or early runs re-anchor on the actual date; late runs keep the
/// expected date so one slow vendor posting doesn't push every later cycle out.
pub fn anti_creep_anchor(expected: NaiveDate, actual_run: NaiveDate) -> NaiveDate {
    if actual_run <= expected { actual_run } else { expected }
}
