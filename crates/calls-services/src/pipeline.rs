//! One run of the job: fetch a range, normalize it, append it
//!
//! The stages run strictly in sequence. The loader is never called for an
//! empty batch, and a pipeline without a loader is a dry run.

use calls_core::config::{AppConfig, WriteMode};
use calls_core::models::{DateRange, TableRef, TableSchema};
use calls_core::traits::{BulkLoader, LoadTarget, ReportSource, WriteDisposition};
use calls_core::{AppError, AppResult};
use chrono_tz::Tz;
use std::fmt;
use tracing::{info, instrument, warn};

use crate::normalizer::RecordNormalizer;
use crate::paginator::{Paginator, Truncation};

/// Column the range replacement filters on
pub const RANGE_COLUMN: &str = "start_time";

/// Where batches go and how existing rows are treated
#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub table: TableRef,
    pub schema: Option<TableSchema>,
    pub write_mode: WriteMode,
    /// Zone the range bounds are read in
    pub timezone: Tz,
}

impl LoadSettings {
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            table: config.warehouse.table_ref()?,
            schema: config.warehouse.schema(),
            write_mode: config.warehouse.write_mode,
            timezone: config.report.tz()?,
        })
    }

    /// Load target for a run over `range`
    pub fn target_for(&self, range: &DateRange) -> AppResult<LoadTarget> {
        let disposition = match self.write_mode {
            WriteMode::Append => WriteDisposition::Append,
            WriteMode::ReplaceRange => {
                let (from, till) = range.to_utc(self.timezone).ok_or_else(|| {
                    AppError::Validation(format!(
                        "range {} does not exist in time zone {}",
                        range, self.timezone
                    ))
                })?;
                WriteDisposition::ReplaceRange {
                    column: RANGE_COLUMN.to_string(),
                    from,
                    till,
                }
            }
        };

        Ok(LoadTarget {
            table: self.table.clone(),
            schema: self.schema.clone(),
            disposition,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Rows were handed to the loader
    Loaded,
    /// The range held no records; the loader was not called
    NoData,
    /// Rows were produced but loading was skipped
    DryRun,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOutcome::Loaded => "loaded",
            RunOutcome::NoData => "no_data",
            RunOutcome::DryRun => "dry_run",
        })
    }
}

/// What a run did
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub range: DateRange,
    pub outcome: RunOutcome,
    pub pages: u32,
    pub records_fetched: usize,
    pub rows_normalized: usize,
    pub rows_loaded: u64,
    pub rows_deleted: Option<u64>,
    pub coercion_failures: usize,
    pub truncated: Option<Truncation>,
    pub job_id: Option<String>,
}

impl RunSummary {
    /// Rows were loaded but the fetch stopped before the end of the range
    pub fn is_partial_load(&self) -> bool {
        self.outcome == RunOutcome::Loaded && self.truncated.is_some()
    }
}

/// Fetch → normalize → append
pub struct IngestPipeline<S: ReportSource> {
    paginator: Paginator<S>,
    normalizer: RecordNormalizer,
    load: LoadSettings,
    loader: Option<Box<dyn BulkLoader>>,
}

impl<S: ReportSource> IngestPipeline<S> {
    /// Create a pipeline without a loader (dry run)
    pub fn new(paginator: Paginator<S>, normalizer: RecordNormalizer, load: LoadSettings) -> Self {
        Self {
            paginator,
            normalizer,
            load,
            loader: None,
        }
    }

    pub fn with_loader(mut self, loader: Box<dyn BulkLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.loader.is_none()
    }

    #[instrument(skip(self), fields(range = %range, table = %self.load.table))]
    pub async fn run(&self, range: &DateRange) -> AppResult<RunSummary> {
        // Resolve the target first so a bad range fails before any fetch
        let target = self.load.target_for(range)?;

        let fetched = self.paginator.fetch_all(range).await?;
        let (batch, stats) = self.normalizer.normalize_with_stats(&fetched.records);

        let mut summary = RunSummary {
            range: *range,
            outcome: RunOutcome::NoData,
            pages: fetched.pages,
            records_fetched: fetched.len(),
            rows_normalized: batch.len(),
            rows_loaded: 0,
            rows_deleted: None,
            coercion_failures: stats.coercion_failures,
            truncated: fetched.truncated.clone(),
            job_id: None,
        };

        if batch.is_empty() {
            info!("No data to load for {}", range);
            return Ok(summary);
        }

        if let Some(truncation) = &summary.truncated {
            warn!(
                "Loading a partial range: stopped at offset {} ({})",
                truncation.offset, truncation.reason
            );
        }

        let loader = match &self.loader {
            Some(loader) => loader,
            None => {
                info!("Dry run: {} rows normalized, skipping load", batch.len());
                summary.outcome = RunOutcome::DryRun;
                return Ok(summary);
            }
        };

        info!(
            "Appending {} rows to {} via {}",
            batch.len(),
            target.table,
            loader.backend()
        );

        let report = loader.append(&batch, &target).await?;

        summary.outcome = RunOutcome::Loaded;
        summary.rows_loaded = report.rows_written;
        summary.rows_deleted = report.rows_deleted;
        summary.job_id = report.job_id;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn settings(write_mode: WriteMode, timezone: Tz) -> LoadSettings {
        LoadSettings {
            table: "p.d.t".parse().unwrap(),
            schema: None,
            write_mode,
            timezone,
        }
    }

    #[test]
    fn test_append_target() {
        let range = DateRange::parse("2025-01-01 00:00:00", "2025-01-01 23:59:59").unwrap();
        let target = settings(WriteMode::Append, Tz::UTC).target_for(&range).unwrap();
        assert_eq!(target.disposition, WriteDisposition::Append);
    }

    #[test]
    fn test_replace_range_target_uses_zone() {
        let range = DateRange::parse("2025-01-01 00:00:00", "2025-01-01 23:59:59").unwrap();
        let moscow: Tz = "Europe/Moscow".parse().unwrap();
        let target = settings(WriteMode::ReplaceRange, moscow)
            .target_for(&range)
            .unwrap();

        match target.disposition {
            WriteDisposition::ReplaceRange { column, from, till } => {
                assert_eq!(column, "start_time");
                assert_eq!(from, Utc.with_ymd_and_hms(2024, 12, 31, 21, 0, 0).unwrap());
                assert!(till > Utc.with_ymd_and_hms(2025, 1, 1, 20, 59, 59).unwrap());
            }
            other => panic!("unexpected disposition {:?}", other),
        }
    }

    fn summary(outcome: RunOutcome, truncated: bool) -> RunSummary {
        RunSummary {
            range: DateRange::parse("2025-01-01 00:00:00", "2025-01-01 23:59:59").unwrap(),
            outcome,
            pages: 1,
            records_fetched: 10,
            rows_normalized: 10,
            rows_loaded: 0,
            rows_deleted: None,
            coercion_failures: 0,
            truncated: truncated.then(|| Truncation {
                offset: 1000,
                reason: "Report API error at offset 1000: boom".to_string(),
            }),
            job_id: None,
        }
    }

    #[test]
    fn test_partial_load_only_when_loaded() {
        assert!(summary(RunOutcome::Loaded, true).is_partial_load());
        assert!(!summary(RunOutcome::Loaded, false).is_partial_load());
        assert!(!summary(RunOutcome::DryRun, true).is_partial_load());
        assert!(!summary(RunOutcome::NoData, true).is_partial_load());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(RunOutcome::NoData.to_string(), "no_data");
        assert_eq!(RunOutcome::Loaded.to_string(), "loaded");
    }
}
