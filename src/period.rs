//! Reporting calendar.
//!
//! Weeks run Friday through Thursday and receivables are snapshotted on
//! Fridays. The snapshot's own week has not finished yet, so the week being
//! reported on is the seven days ending the day before the snapshot.

use crate::error::SnapshotError;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SNAPSHOT_WEEKDAY: Weekday = Weekday::Fri;

/// Friday on or before `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let back = (date.weekday().num_days_from_monday() + 7 - SNAPSHOT_WEEKDAY.num_days_from_monday()) % 7;
    date - Duration::days(back as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "NaiveDate", into = "NaiveDate")]
pub struct Snapshot {
    date: NaiveDate,
}

impl Snapshot {
    pub fn new(date: NaiveDate) -> Result<Self, SnapshotError> {
        if date.weekday() != SNAPSHOT_WEEKDAY {
            return Err(SnapshotError::NotFriday(date));
        }
        Ok(Self { date })
    }

    /// The latest snapshot day not after `date`.
    pub fn on_or_before(date: NaiveDate) -> Self {
        Self { date: week_start(date) }
    }

    pub fn date(&self) -> NaiveDate { self.date }

    /// Snapshot exactly one reporting period earlier.
    pub fn previous(&self) -> Snapshot {
        Snapshot { date: self.date - Duration::days(7) }
    }

    /// Whole days between `due` and the snapshot; negative when not yet due.
    pub fn overdue_days(&self, due: NaiveDate) -> i64 {
        (self.date - due).num_days()
    }

    /// The completed Friday..Thursday week preceding the snapshot.
    pub fn reporting_week(&self) -> (NaiveDate, NaiveDate) {
        (self.date - Duration::days(7), self.date - Duration::days(1))
    }

    /// Inclusive date window covering `periods` completed weeks.
    pub fn lookback_window(&self, periods: u8) -> (NaiveDate, NaiveDate) {
        let periods = periods.max(1) as i64;
        (self.date - Duration::days(7 * periods), self.date - Duration::days(1))
    }
}

impl TryFrom<NaiveDate> for Snapshot {
    type Error = SnapshotError;
    fn try_from(date: NaiveDate) -> Result<Self, Self::Error> { Snapshot::new(date) }
}

impl From<Snapshot> for NaiveDate {
    fn from(s: Snapshot) -> Self { s.date }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Weekly,
    Monthly,
}

/// Grouping key of an aggregate bucket. Serialized as `W2025-01-03` (week
/// starting that Friday) or `M2025-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PeriodKey {
    Week(NaiveDate),
    Month { year: i32, month: u32 },
}

impl PeriodKey {
    pub fn of(date: NaiveDate, granularity: Granularity) -> Self {
        match granularity {
            Granularity::Weekly => PeriodKey::Week(week_start(date)),
            Granularity::Monthly => PeriodKey::Month { year: date.year(), month: date.month() },
        }
    }

    /// The key `n` periods before this one.
    pub fn preceding(&self, n: u32) -> Self {
        match *self {
            PeriodKey::Week(start) => PeriodKey::Week(start - Duration::days(7 * n as i64)),
            PeriodKey::Month { year, month } => {
                let idx = year * 12 + month as i32 - 1 - n as i32;
                PeriodKey::Month { year: idx.div_euclid(12), month: idx.rem_euclid(12) as u32 + 1 }
            }
        }
    }

    /// First calendar day inside the period.
    pub fn first_day(&self) -> NaiveDate {
        match *self {
            PeriodKey::Week(start) => start,
            PeriodKey::Month { year, month } => NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN),
        }
    }

    /// Human label used in reports: `2025-01-03 - 2025-01-09` or `2025-01`.
    pub fn label(&self) -> String {
        match self {
            PeriodKey::Week(start) => {
                let end = *start + Duration::days(6);
                format!("{} - {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
            }
            PeriodKey::Month { year, month } => format!("{year:04}-{month:02}"),
        }
    }
}

impl From<PeriodKey> for String {
    fn from(k: PeriodKey) -> Self {
        match k {
            PeriodKey::Week(start) => format!("W{}", start.format("%Y-%m-%d")),
            PeriodKey::Month { year, month } => format!("M{year:04}-{month:02}"),
        }
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if let Some(rest) = s.strip_prefix('W') {
            let d = NaiveDate::parse_from_str(rest, "%Y-%m-%d").map_err(|e| format!("bad week key {s}: {e}"))?;
            return Ok(PeriodKey::Week(d));
        }
        if let Some(rest) = s.strip_prefix('M') {
            let (y, m) = rest.split_once('-').ok_or_else(|| format!("bad month key {s}"))?;
            let year = y.parse::<i32>().map_err(|e| format!("bad month key {s}: {e}"))?;
            let month = m.parse::<u32>().map_err(|e| format!("bad month key {s}: {e}"))?;
            if !(1..=12).contains(&month) {
                return Err(format!("bad month key {s}"));
            }
            return Ok(PeriodKey::Month { year, month });
        }
        Err(format!("unknown period key {s}"))
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
