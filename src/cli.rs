//! Command-line arguments

use calls_core::models::DateRange;
use calls_core::AppResult;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "calls-loader")]
#[command(version, about = "Export call-detail records from the report API into the warehouse")]
pub struct Args {
    /// Load one whole day (YYYY-MM-DD) instead of yesterday
    #[arg(long, conflicts_with_all = ["from", "till"])]
    pub date: Option<NaiveDate>,

    /// Range start, "YYYY-MM-DD HH:MM:SS" in the report time zone
    #[arg(long, requires = "till")]
    pub from: Option<String>,

    /// Range end (inclusive), "YYYY-MM-DD HH:MM:SS"
    #[arg(long, requires = "from")]
    pub till: Option<String>,

    /// Fetch and normalize, but do not write to the warehouse
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Extra configuration file layered over config/default and config/{RUN_MODE}
    #[arg(long, env = "CALLS_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Range selected by the flags; yesterday (UTC) when none are given
    pub fn resolve_range(&self, now: DateTime<Utc>) -> AppResult<DateRange> {
        match (&self.date, &self.from, &self.till) {
            (Some(day), _, _) => Ok(DateRange::for_day(*day)),
            (None, Some(from), Some(till)) => DateRange::parse(from, till),
            _ => Ok(DateRange::yesterday(now)),
        }
    }
}
