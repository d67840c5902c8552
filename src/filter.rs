use crate::str_utils::digit_groups;
use crate::types::TimelineEvent;
use chrono::NaiveDate;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    Day,
    Month,
    Year,
    Unknown,
}

impl DatePrecision {
    pub fn of(date: &str) -> Self {
        match date_parts(date) {
            Some(DateParts { day: Some(_), .. }) => DatePrecision::Day,
            Some(DateParts { month: Some(_), .. }) => DatePrecision::Month,
            Some(_) => DatePrecision::Year,
            None => DatePrecision::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateParts {
    pub year: u64,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

/// Numeric parts of a free-form date. `"2023年1月5日"`, `"2023-01-05"` and `"20230105"` agree.
pub fn date_parts(date: &str) -> Option<DateParts> {
    let groups = digit_groups(date);
    let first = groups.first()?;

    if groups.len() == 1 && first.len() == 8 {
        return Some(DateParts {
            year: first[..4].parse().ok()?,
            month: first[4..6].parse().ok(),
            day: first[6..8].parse().ok(),
        });
    }

    Some(DateParts {
        year: first.parse().ok()?,
        month: groups.get(1).and_then(|g| g.parse().ok()),
        day: groups.get(2).and_then(|g| g.parse().ok()),
    })
}

/// Ordering key with missing month/day treated as zero, so `2023` sorts before `2023-01-01`
/// and `2023-1` equals `2023-01`. Undated events have no key and sort first.
pub fn date_sort_key(date: &str) -> Option<(u64, u32, u32)> {
    let parts = date_parts(date)?;
    Some((parts.year, parts.month.unwrap_or(0), parts.day.unwrap_or(0)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

pub fn sort_events(events: &mut [TimelineEvent], direction: SortDirection) {
    events.sort_by(|a, b| {
        let ord = compare_dates(&a.date, &b.date);
        match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    });
}

pub fn compare_dates(a: &str, b: &str) -> Ordering {
    date_sort_key(a).cmp(&date_sort_key(b))
}

/// First and last calendar day covered by `date` at its own precision.
pub fn date_bounds(date: &str) -> Option<(NaiveDate, NaiveDate)> {
    let parts = date_parts(date)?;
    let year = i32::try_from(parts.year).ok()?;
    match (parts.month, parts.day) {
        (Some(m), Some(d)) => {
            let day = NaiveDate::from_ymd_opt(year, m, d)?;
            Some((day, day))
        }
        (Some(m), None) => {
            let first = NaiveDate::from_ymd_opt(year, m, 1)?;
            let next = if m == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(year, m + 1, 1)?
            };
            Some((first, next.pred_opt()?))
        }
        _ => Some((
            NaiveDate::from_ymd_opt(year, 1, 1)?,
            NaiveDate::from_ymd_opt(year, 12, 31)?,
        )),
    }
}

/// Inclusive date range. An event is kept when the period its date covers overlaps the range;
/// events whose date cannot be read are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateFilter {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn matches(&self, event: &TimelineEvent) -> bool {
        let Some((first, last)) = date_bounds(&event.date) else {
            return true;
        };
        self.start.map_or(true, |s| last >= s) && self.end.map_or(true, |e| first <= e)
    }

    pub fn apply(&self, events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
        if self.is_unbounded() {
            return events;
        }
        events.into_iter().filter(|e| self.matches(e)).collect()
    }
}
