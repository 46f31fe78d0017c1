//! Resolution of time-range labels into concrete inclusive date bounds.
//!
//! Recognized labels: `last N days|weeks|months|years`, `this month`,
//! `this year`, `year to date` / `ytd`. Month and year offsets snap to the
//! first day of the resulting month or year rather than the same calendar day.

use std::sync::LazyLock;

use chrono::{Datelike, Days, NaiveDate};
use regex::Regex;

static LAST_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)last\s+(\d+)\s+(days?|weeks?|months?|years?)").unwrap()
});

/// An inclusive `[start, end]` date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Resolve `label` relative to `today`.
///
/// Empty, unrecognized or out-of-range labels resolve to `None`, which callers
/// treat as "no time restriction".
#[must_use]
pub fn resolve(label: Option<&str>, today: NaiveDate) -> Option<DateRange> {
    let label = label?.trim().to_ascii_lowercase();
    if label.is_empty() {
        return None;
    }

    let start = match label.as_str() {
        "this month" => today.with_day(1)?,
        "this year" | "year to date" | "ytd" => first_of_year(today.year())?,
        _ => {
            let caps = LAST_N.captures(&label)?;
            let n: u32 = caps[1].parse().ok()?;
            match caps[2].trim_end_matches('s') {
                "day" => today.checked_sub_days(Days::new(u64::from(n)))?,
                "week" => today.checked_sub_days(Days::new(u64::from(n) * 7))?,
                "month" => months_back(today, n)?,
                "year" => first_of_year(today.year().checked_sub(i32::try_from(n).ok()?)?)?,
                _ => return None,
            }
        }
    };

    Some(DateRange { start, end: today })
}

fn first_of_year(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
}

/// First day of the month `n` months before `today`'s month.
fn months_back(today: NaiveDate, n: u32) -> Option<NaiveDate> {
    let index = i64::from(today.year()) * 12 + i64::from(today.month0()) - i64::from(n);
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    let month = u32::try_from(index.rem_euclid(12)).ok()? + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
}
