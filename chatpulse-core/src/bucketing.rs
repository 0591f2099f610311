//! Calendar-day bucketing in a subject area's reporting timezone.
//!
//! Both the ingest side and the query side derive day keys through
//! [`day_key`], so a turn and the report that reads it always agree on
//! which bucket the turn belongs to.

use crate::types::fixed_offset_from_hours;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Document key format (`MM-DD-YYYY`)
const KEY_FORMAT: &str = "%m-%d-%Y";
/// Sortable storage format (`YYYY-MM-DD`)
const ISO_FORMAT: &str = "%Y-%m-%d";

/// A calendar day in some subject area's timezone.
///
/// Displays as `MM-DD-YYYY`; ordering follows the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// `YYYY-MM-DD`, used for range scans
    pub fn iso(&self) -> String {
        self.0.format(ISO_FORMAT).to_string()
    }

    /// Parse either the `MM-DD-YYYY` key form or the ISO form.
    pub fn parse(s: &str) -> Option<Self> {
        NaiveDate::parse_from_str(s, KEY_FORMAT)
            .or_else(|_| NaiveDate::parse_from_str(s, ISO_FORMAT))
            .ok()
            .map(Self)
    }
}

impl std::fmt::Display for DayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(KEY_FORMAT))
    }
}

impl std::str::FromStr for DayKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DayKey::parse(s).ok_or_else(|| format!("invalid day key: {}", s))
    }
}

impl TryFrom<String> for DayKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DayKey> for String {
    fn from(key: DayKey) -> Self {
        key.to_string()
    }
}

/// Wall-clock date of `instant` at a fixed UTC offset of `timezone_offset_hours`.
pub fn day_key(instant: DateTime<Utc>, timezone_offset_hours: f64) -> DayKey {
    let offset = fixed_offset_from_hours(timezone_offset_hours);
    DayKey(instant.with_timezone(&offset).date_naive())
}

/// Whether two instants fall on the same calendar day at the given offset.
pub fn same_day(a: DateTime<Utc>, b: DateTime<Utc>, timezone_offset_hours: f64) -> bool {
    day_key(a, timezone_offset_hours) == day_key(b, timezone_offset_hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_key_applies_offset() {
        // 2024-03-02 05:30 UTC is still March 1st at UTC-7
        let instant = Utc.with_ymd_and_hms(2024, 3, 2, 5, 30, 0).unwrap();
        assert_eq!(day_key(instant, -7.0).to_string(), "03-01-2024");
        assert_eq!(day_key(instant, 0.0).to_string(), "03-02-2024");
        assert_eq!(day_key(instant, 5.5).to_string(), "03-02-2024");
    }

    #[test]
    fn test_same_day_across_midnight() {
        // 23:58 and 00:05 local time at UTC-7
        let before = Utc.with_ymd_and_hms(2024, 3, 2, 6, 58, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 2, 7, 5, 0).unwrap();
        assert!(!same_day(before, after, -7.0));
        assert!(same_day(before, after, 0.0));
    }

    #[test]
    fn test_parse_both_formats() {
        let a = DayKey::parse("03-01-2024").unwrap();
        let b = DayKey::parse("2024-03-01").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.iso(), "2024-03-01");
        assert!(DayKey::parse("2024/03/01").is_none());
    }

    #[test]
    fn test_serde_uses_key_format() {
        let key = DayKey::parse("12-31-2023").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"12-31-2023\"");
        let back: DayKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
