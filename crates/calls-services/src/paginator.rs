//! Offset/limit pagination over the report API
//!
//! Pages are requested strictly one after another at offsets `0, limit,
//! 2*limit, ...` until the source returns `PageOutcome::End`.

use calls_core::config::{PageErrorPolicy, ReportConfig};
use calls_core::models::{CallRecord, DateRange};
use calls_core::traits::{PageOutcome, ReportSource};
use calls_core::{AppError, AppResult};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Why a fetch stopped before the end of data
#[derive(Debug, Clone, PartialEq)]
pub struct Truncation {
    /// Offset of the page that was not fetched
    pub offset: u64,
    pub reason: String,
}

/// Records accumulated over all pages of a range
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRecords {
    pub records: Vec<CallRecord>,
    /// Non-empty pages received
    pub pages: u32,
    /// Requests issued, including the terminating one
    pub calls: u32,
    /// Set when the fetch stopped early under `keep_partial`
    pub truncated: Option<Truncation>,
}

impl FetchedRecords {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Drives a `ReportSource` through every page of a range
pub struct Paginator<S: ReportSource> {
    source: Arc<S>,
    page_size: u32,
    max_pages: Option<u32>,
    on_error: PageErrorPolicy,
}

impl<S: ReportSource> Paginator<S> {
    /// Create a new paginator
    ///
    /// `max_pages = None` fetches until the source runs dry.
    pub fn new(
        source: Arc<S>,
        page_size: u32,
        max_pages: Option<u32>,
        on_error: PageErrorPolicy,
    ) -> Self {
        Self {
            source,
            page_size,
            max_pages,
            on_error,
        }
    }

    pub fn from_config(source: Arc<S>, config: &ReportConfig) -> Self {
        Self::new(
            source,
            config.page_size,
            config.page_limit(),
            config.on_page_error,
        )
    }

    /// Fetch every record of `range`, in API order
    ///
    /// # Errors
    ///
    /// Under `abort`, the first page failure (or hitting `max_pages`) is
    /// returned and everything accumulated so far is dropped. Under
    /// `keep_partial` the accumulated records come back flagged as truncated,
    /// unless there are none, in which case the failure is returned.
    #[instrument(skip(self), fields(range = %range, page_size = self.page_size))]
    pub async fn fetch_all(&self, range: &DateRange) -> AppResult<FetchedRecords> {
        if self.page_size == 0 {
            return Err(AppError::Validation("page size must be positive".to_string()));
        }

        let limit = u64::from(self.page_size);
        let mut fetched = FetchedRecords::default();
        let mut offset = 0u64;

        loop {
            fetched.calls += 1;

            match self.source.fetch_page(range, offset, self.page_size).await {
                Ok(PageOutcome::End) => {
                    debug!("Page at offset {} is empty; end of data", offset);
                    break;
                }
                Ok(PageOutcome::Page(records)) => {
                    if let Some(max) = self.max_pages {
                        if fetched.pages >= max {
                            let err = AppError::PageLimitExceeded { pages: max };
                            return self.stop(fetched, offset, err);
                        }
                    }

                    debug!("Fetched {} records at offset {}", records.len(), offset);
                    fetched.pages += 1;
                    fetched.records.extend(records);
                    offset += limit;
                }
                Err(e) => {
                    let err = AppError::Report {
                        offset,
                        message: e.to_string(),
                    };
                    return self.stop(fetched, offset, err);
                }
            }
        }

        info!(
            "Fetched {} records in {} pages ({} requests)",
            fetched.len(),
            fetched.pages,
            fetched.calls
        );

        Ok(fetched)
    }

    /// Apply the page-error policy to a failure at `offset`
    ///
    /// A failure before any record arrived is returned as an error under
    /// both policies, so it never reads as an empty range.
    fn stop(&self, mut fetched: FetchedRecords, offset: u64, err: AppError) -> AppResult<FetchedRecords> {
        if fetched.is_empty() {
            error!("Fetch failed at offset {} before any record arrived: {}", offset, err);
            return Err(err);
        }

        match self.on_error {
            PageErrorPolicy::Abort => {
                error!(
                    "Aborting fetch at offset {} ({} records discarded): {}",
                    offset,
                    fetched.len(),
                    err
                );
                Err(err)
            }
            PageErrorPolicy::KeepPartial => {
                warn!(
                    "Stopping fetch at offset {}; keeping {} records: {}",
                    offset,
                    fetched.len(),
                    err
                );
                fetched.truncated = Some(Truncation {
                    offset,
                    reason: err.to_string(),
                });
                Ok(fetched)
            }
        }
    }
}
