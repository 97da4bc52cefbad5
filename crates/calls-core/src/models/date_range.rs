//! Report date range
//!
//! The report API filters calls by two local wall-clock timestamps, both
//! inclusive, at second granularity.

use crate::{AppError, AppResult};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::fmt;

/// Wire format of `date_from` / `date_till`
pub const REPORT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Inclusive `[from, till]` range in the report API's local time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    from: NaiveDateTime,
    till: NaiveDateTime,
}

impl DateRange {
    /// Create a range, rejecting `from > till`
    pub fn new(from: NaiveDateTime, till: NaiveDateTime) -> AppResult<Self> {
        if from > till {
            return Err(AppError::Validation(format!(
                "date range start {} is after its end {}",
                from.format(REPORT_DATETIME_FORMAT),
                till.format(REPORT_DATETIME_FORMAT)
            )));
        }

        Ok(Self { from, till })
    }

    /// Whole calendar day, `00:00:00` through `23:59:59`
    pub fn for_day(day: NaiveDate) -> Self {
        let from = day.and_time(NaiveTime::MIN);
        Self {
            from,
            till: from + Duration::seconds(86_399),
        }
    }

    /// The calendar day before `now` (UTC)
    pub fn yesterday(now: DateTime<Utc>) -> Self {
        Self::for_day(now.date_naive() - Duration::days(1))
    }

    /// Parse both bounds from the `YYYY-MM-DD HH:MM:SS` wire format
    pub fn parse(from: &str, till: &str) -> AppResult<Self> {
        let parse = |value: &str, label: &str| {
            NaiveDateTime::parse_from_str(value.trim(), REPORT_DATETIME_FORMAT).map_err(|e| {
                AppError::Validation(format!(
                    "invalid {} timestamp '{}': {} (expected YYYY-MM-DD HH:MM:SS)",
                    label, value, e
                ))
            })
        };

        Self::new(parse(from, "from")?, parse(till, "till")?)
    }

    pub fn from(&self) -> NaiveDateTime {
        self.from
    }

    pub fn till(&self) -> NaiveDateTime {
        self.till
    }

    /// `date_from` request parameter
    pub fn from_param(&self) -> String {
        self.from.format(REPORT_DATETIME_FORMAT).to_string()
    }

    /// `date_till` request parameter
    pub fn till_param(&self) -> String {
        self.till.format(REPORT_DATETIME_FORMAT).to_string()
    }

    /// Absolute bounds of the range when its wall-clock is read in `tz`
    ///
    /// Returns `None` when a bound falls into a DST gap. The upper bound is
    /// extended to the end of its second so that fractional timestamps are
    /// still covered.
    pub fn to_utc(&self, tz: Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let from = tz.from_local_datetime(&self.from).earliest()?;
        let till = tz.from_local_datetime(&self.till).latest()?;

        Some((
            from.with_timezone(&Utc),
            till.with_timezone(&Utc) + Duration::milliseconds(999),
        ))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.from_param(), self.till_param())
    }
}
