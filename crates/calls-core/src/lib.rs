//! calls-loader Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the calls-loader batch job. It includes:
//!
//! - Domain models (DateRange, CallRecord, ResultBatch, TableSchema)
//! - The seams between pipeline stages (`ReportSource`, `BulkLoader`)
//! - Unified error handling with process exit code mapping
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
