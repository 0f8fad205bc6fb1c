use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use std::collections::BTreeSet;

/// Lifecycle label derived from the session date on every read.
/// Never stored; cancellation is the only persisted override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputedStatus {
    Cancelled,
    Past,
    Today,
    Upcoming,
}

impl ComputedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ComputedStatus::Cancelled => "cancelled",
            ComputedStatus::Past => "past",
            ComputedStatus::Today => "today",
            ComputedStatus::Upcoming => "upcoming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancelled" => Some(ComputedStatus::Cancelled),
            "past" => Some(ComputedStatus::Past),
            "today" => Some(ComputedStatus::Today),
            "upcoming" => Some(ComputedStatus::Upcoming),
            _ => None,
        }
    }
}

pub fn computed_status(is_cancelled: bool, date: NaiveDate, today: NaiveDate) -> ComputedStatus {
    if is_cancelled {
        return ComputedStatus::Cancelled;
    }
    match date.cmp(&today) {
        std::cmp::Ordering::Less => ComputedStatus::Past,
        std::cmp::Ordering::Equal => ComputedStatus::Today,
        std::cmp::Ordering::Greater => ComputedStatus::Upcoming,
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Weekday numbering used on the wire: Sunday=0 .. Saturday=6.
pub fn weekday_number(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Every day in [start, end] whose weekday is in the set, ascending.
/// The generate handler zips the result with 1-based session numbers.
pub fn plan_session_dates(
    start: NaiveDate,
    end: NaiveDate,
    weekdays: &BTreeSet<u8>,
) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut day = start;
    while day <= end {
        if weekdays.contains(&weekday_number(day)) {
            out.push(day);
        }
        day += Duration::days(1);
    }
    out
}
