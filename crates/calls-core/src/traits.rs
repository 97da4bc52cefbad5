//! Seams between the pipeline stages
//!
//! The report API and the warehouse are reached through these traits so the
//! paginator and the pipeline can run against stubs.

use crate::error::AppError;
use crate::models::{CallRecord, DateRange, ResultBatch, TableRef, TableSchema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of one page request
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// A non-empty page of records, in API order
    Page(Vec<CallRecord>),
    /// The API returned no records at this offset
    End,
}

impl PageOutcome {
    /// Build from a record list; an empty list is the end of data
    pub fn from_records(records: Vec<CallRecord>) -> Self {
        if records.is_empty() {
            PageOutcome::End
        } else {
            PageOutcome::Page(records)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PageOutcome::Page(records) => records.len(),
            PageOutcome::End => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of call-report pages
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Transport or protocol failure for a single page
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the records at `offset` (at most `limit`) for `range`
    async fn fetch_page(
        &self,
        range: &DateRange,
        offset: u64,
        limit: u32,
    ) -> Result<PageOutcome, Self::Error>;
}

/// How the loader treats rows already in the destination
#[derive(Debug, Clone, PartialEq)]
pub enum WriteDisposition {
    /// Plain append; overlapping runs duplicate rows
    Append,
    /// Delete rows whose `column` lies in `[from, till]`, then append
    ReplaceRange {
        column: String,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    },
}

/// Where and how a batch is written
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTarget {
    pub table: TableRef,
    /// Explicit column types; `None` means auto-detect
    pub schema: Option<TableSchema>,
    pub disposition: WriteDisposition,
}

/// Outcome of a successful load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub rows_written: u64,
    pub rows_deleted: Option<u64>,
    /// Backend job identifier, when the backend has one
    pub job_id: Option<String>,
}

/// Bulk-append write path of a warehouse
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Append every row of `batch` to `target`, creating the table if absent
    async fn append(&self, batch: &ResultBatch, target: &LoadTarget) -> Result<LoadReport, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_outcome_from_records() {
        assert_eq!(PageOutcome::from_records(Vec::new()), PageOutcome::End);

        let record = CallRecord::try_from(json!({"id": 1})).unwrap();
        let outcome = PageOutcome::from_records(vec![record]);
        assert_eq!(outcome.len(), 1);
        assert!(!outcome.is_empty());
    }
}
