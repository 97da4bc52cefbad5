//! Unified error handling for calls-loader
//!
//! This module provides the error type shared by every stage of the job,
//! with a mapping to process exit codes for the binary.

use thiserror::Error;

/// Main application error type
///
/// All errors in the application should be converted to this type.
/// Coercion failures inside the normalizer never become an `AppError`;
/// they are recovered to a null cell on the spot.
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Configuration Errors ====================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ==================== Report API Errors ====================
    #[error("Report API error at offset {offset}: {message}")]
    Report { offset: u64, message: String },

    #[error("Page limit exceeded: no end of data after {pages} pages")]
    PageLimitExceeded { pages: u32 },

    // ==================== Warehouse Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Warehouse authentication failed: {0}")]
    Auth(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Process exit code for this error
    ///
    /// Configuration problems exit with 2 so a scheduler can tell them apart
    /// from runtime failures (1).
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::MissingCredential(_) | AppError::Validation(_) => 2,
            _ => 1,
        }
    }

    /// Returns the error code used in the final log line
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::MissingCredential(_) => "missing_credential",
            AppError::Validation(_) => "validation_error",
            AppError::Report { .. } => "report_error",
            AppError::PageLimitExceeded { .. } => "page_limit_exceeded",
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Transaction(_) => "transaction_error",
            AppError::Warehouse(_) => "warehouse_error",
            AppError::Auth(_) => "warehouse_auth_error",
            AppError::Internal(_) => "internal_error",
            AppError::Serialization(_) => "serialization_error",
        }
    }

    /// True for errors raised while pulling pages from the report API
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            AppError::Report { .. } | AppError::PageLimitExceeded { .. }
        )
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
