//! Recurrence rules and next-occurrence calculation.
//!
//! Supports the `FREQ`, `BYHOUR`, `BYMINUTE` and `BYDAY` parts of RFC5545
//! RRULEs. Wall-clock fields are always applied in the target timezone and
//! the result converted back to UTC, so a daily 06:00 rule stays at 06:00
//! local across DST transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::errors::DomainError;

/// Upper bound on the number of local days searched for an occurrence.
const MAX_SEARCH_DAYS: i64 = 370;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("recurrence rule is empty")]
    Empty,
    #[error("recurrence rule is missing FREQ")]
    MissingFrequency,
    #[error("unsupported FREQ '{0}' (expected MINUTELY, HOURLY, DAILY or WEEKLY)")]
    UnsupportedFrequency(String),
    #[error("unsupported rule part '{0}'")]
    UnsupportedPart(String),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

impl From<RecurrenceError> for DomainError {
    fn from(err: RecurrenceError) -> Self {
        DomainError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Frequency {
    Minutely,
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Minutely => "MINUTELY",
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
        }
    }
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub freq: Frequency,
    /// Sorted, deduplicated local hours. Empty means "derive from dtstart".
    pub by_hour: Vec<u32>,
    /// Sorted, deduplicated local minutes. Empty means "derive from dtstart".
    pub by_minute: Vec<u32>,
    /// Weekdays the rule may fire on. Empty means every day.
    pub by_day: Vec<Weekday>,
}

impl RecurrenceRule {
    pub fn parse(raw: &str) -> Result<Self, RecurrenceError> {
        let mut body = raw.trim();
        if body.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("RRULE:")) {
            body = &body[6..];
        }
        if body.is_empty() {
            return Err(RecurrenceError::Empty);
        }

        let mut freq = None;
        let mut by_hour = Vec::new();
        let mut by_minute = Vec::new();
        let mut by_day = Vec::new();

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| RecurrenceError::UnsupportedPart(part.to_string()))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();
            match key.as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "MINUTELY" => Frequency::Minutely,
                        "HOURLY" => Frequency::Hourly,
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        other => return Err(RecurrenceError::UnsupportedFrequency(other.to_string())),
                    });
                }
                "BYHOUR" => by_hour = parse_number_list(&key, value, 23)?,
                "BYMINUTE" => by_minute = parse_number_list(&key, value, 59)?,
                "BYDAY" => {
                    by_day = value
                        .split(',')
                        .map(|d| parse_weekday(d.trim()))
                        .collect::<Result<Vec<_>, _>>()?;
                    by_day.sort_by_key(Weekday::num_days_from_monday);
                    by_day.dedup();
                }
                "INTERVAL" if value == "1" => {}
                _ => return Err(RecurrenceError::UnsupportedPart(part.to_string())),
            }
        }

        let freq = freq.ok_or(RecurrenceError::MissingFrequency)?;
        Ok(Self {
            freq,
            by_hour,
            by_minute,
            by_day,
        })
    }

    /// Earliest instant strictly after `after` whose local rendering in `tz`
    /// matches the rule. Fields the rule leaves open take their value from
    /// `dtstart` (rendered in `tz`).
    ///
    /// Local times that fall in a DST gap do not exist and are skipped.
    /// A repeated local time fires once, at the earlier instant, for `DAILY`
    /// and `WEEKLY` rules; `MINUTELY` and `HOURLY` rules fire in both passes
    /// of the repeated hour.
    pub fn next_occurrence(
        &self,
        dtstart: DateTime<Utc>,
        after: DateTime<Utc>,
        tz: Tz,
    ) -> Option<DateTime<Utc>> {
        let start_local = dtstart.with_timezone(&tz);
        let second = start_local.second();

        let hours: Vec<u32> = if !self.by_hour.is_empty() {
            self.by_hour.clone()
        } else {
            match self.freq {
                Frequency::Minutely | Frequency::Hourly => (0..24).collect(),
                Frequency::Daily | Frequency::Weekly => vec![start_local.hour()],
            }
        };
        let minutes: Vec<u32> = if !self.by_minute.is_empty() {
            self.by_minute.clone()
        } else {
            match self.freq {
                Frequency::Minutely => (0..60).collect(),
                _ => vec![start_local.minute()],
            }
        };
        let days: Vec<Weekday> = if self.by_day.is_empty() && self.freq == Frequency::Weekly {
            vec![start_local.weekday()]
        } else {
            self.by_day.clone()
        };

        let earliest_only = matches!(self.freq, Frequency::Daily | Frequency::Weekly);
        let first_day = after.with_timezone(&tz).date_naive();
        for offset in 0..=MAX_SEARCH_DAYS {
            let date = first_day.checked_add_signed(Duration::days(offset))?;
            if !days.is_empty() && !days.contains(&date.weekday()) {
                continue;
            }
            // Wall-clock order is not instant order inside a repeated hour.
            let next = hours
                .iter()
                .flat_map(|&hour| minutes.iter().map(move |&minute| (hour, minute)))
                .filter_map(|(hour, minute)| date.and_hms_opt(hour, minute, second))
                .flat_map(|naive| local_instants(tz, naive, earliest_only))
                .filter(|candidate| *candidate > after)
                .min();
            if next.is_some() {
                return next;
            }
        }
        None
    }
}

impl FromStr for RecurrenceRule {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.freq.as_str())?;
        if !self.by_hour.is_empty() {
            write!(f, ";BYHOUR={}", join_numbers(&self.by_hour))?;
        }
        if !self.by_minute.is_empty() {
            write!(f, ";BYMINUTE={}", join_numbers(&self.by_minute))?;
        }
        if !self.by_day.is_empty() {
            let days: Vec<&str> = self.by_day.iter().map(weekday_code).collect();
            write!(f, ";BYDAY={}", days.join(","))?;
        }
        Ok(())
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, RecurrenceError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| RecurrenceError::UnknownTimezone(name.to_string()))
}

/// The next local midnight in `tz` strictly after `now`.
///
/// If midnight itself is skipped by a DST change, the first valid local time
/// of that day is used instead.
pub fn next_local_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    for offset in 1..=2 {
        let Some(day) = today.checked_add_signed(Duration::days(offset)) else {
            break;
        };
        if let Some(start) = first_valid_local_time(tz, day) {
            if start > now {
                return start;
            }
        }
    }
    now + Duration::days(1)
}

fn first_valid_local_time(tz: Tz, day: NaiveDate) -> Option<DateTime<Utc>> {
    let midnight = day.and_hms_opt(0, 0, 0)?;
    // DST gaps are at most a couple of hours; step forward 15 minutes at a time.
    (0..=12)
        .map(|step| midnight + Duration::minutes(15 * step))
        .find_map(|naive| resolve_local(tz, &naive))
}

/// Instants at which `naive` occurs in `tz`: none inside a DST gap, two in a
/// repeated hour unless `earliest_only`.
fn local_instants(
    tz: Tz,
    naive: NaiveDateTime,
    earliest_only: bool,
) -> impl Iterator<Item = DateTime<Utc>> {
    let (first, second) = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => (Some(dt), None),
        LocalResult::Ambiguous(earliest, latest) => (Some(earliest), (!earliest_only).then_some(latest)),
        LocalResult::None => (None, None),
    };
    first.into_iter().chain(second).map(|dt| dt.with_timezone(&Utc))
}

fn resolve_local(tz: Tz, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

fn parse_number_list(key: &str, value: &str, max: u32) -> Result<Vec<u32>, RecurrenceError> {
    let mut numbers = value
        .split(',')
        .map(|n| {
            n.trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n <= max)
                .ok_or_else(|| RecurrenceError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    numbers.sort_unstable();
    numbers.dedup();
    Ok(numbers)
}

fn parse_weekday(code: &str) -> Result<Weekday, RecurrenceError> {
    match code.to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        _ => Err(RecurrenceError::InvalidValue {
            key: "BYDAY".to_string(),
            value: code.to_string(),
        }),
    }
}

const fn weekday_code(day: &Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

fn join_numbers(numbers: &[u32]) -> String {
    numbers
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
