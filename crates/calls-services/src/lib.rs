//! Pipeline services for calls-loader
//!
//! This crate contains the stages that turn a date range into rows in the
//! warehouse: pagination over the report API, record normalization, and the
//! run orchestration that ties them to a bulk loader.
//!
//! # Architecture
//!
//! Stages depend only on the `ReportSource` and `BulkLoader` seams from
//! `calls-core`, so every stage runs against stubs in tests:
//! - Stages run strictly in sequence, one page request at a time
//! - All operations are instrumented with tracing
//! - Failures surface as `AppError`; coercion problems never do
//!
//! # Services
//!
//! - `Paginator` - Offset/limit paging with a page bound and error policy
//! - `RecordNormalizer` - Employee flattening and type coercion
//! - `IngestPipeline` - Fetch, normalize, append; skips empty batches

pub mod normalizer;
pub mod paginator;
pub mod pipeline;

pub use normalizer::{NormalizeStats, RecordNormalizer};
pub use paginator::{FetchedRecords, Paginator, Truncation};
pub use pipeline::{IngestPipeline, LoadSettings, RunOutcome, RunSummary};
