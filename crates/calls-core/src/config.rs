//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration is layered: built-in defaults, `config/default.toml`,
//! `config/{RUN_MODE}.toml`, an optional file given on the command line, and
//! finally `CALLS__*` environment variables (e.g. `CALLS__REPORT__PAGE_SIZE`).

use crate::models::{TableRef, TableSchema};
use crate::{AppError, AppResult};
use chrono_tz::Tz;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use tracing::debug;

/// Largest page the report API accepts
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub report: ReportConfig,
    pub warehouse: WarehouseConfig,
}

/// What the paginator does when a page request fails
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorPolicy {
    /// Fail the run and upload nothing
    #[default]
    Abort,
    /// Stop fetching and load what was accumulated
    KeepPartial,
}

/// How the normalizer picks output columns
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSetMode {
    /// Columns of the versioned `calls_v1` schema
    #[default]
    Static,
    /// Union of the keys seen in the fetched records
    Observed,
}

/// Report API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    /// JSON-RPC endpoint
    #[serde(default = "default_report_url")]
    pub url: String,

    /// Data API access token
    pub access_token: Option<String>,

    /// Records per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Safety bound on non-empty pages per run, 0 disables it
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// HTTP timeout per page request in seconds
    #[serde(default = "default_report_timeout")]
    pub timeout_secs: u64,

    /// IANA time zone of the API's local timestamps
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub on_page_error: PageErrorPolicy,

    #[serde(default)]
    pub column_set: ColumnSetMode,
}

fn default_report_url() -> String {
    "https://dataapi.uiscom.ru/v2.0".to_string()
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_max_pages() -> u32 {
    1000
}

fn default_report_timeout() -> u64 {
    120
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            url: default_report_url(),
            access_token: None,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            timeout_secs: default_report_timeout(),
            timezone: default_timezone(),
            on_page_error: PageErrorPolicy::default(),
            column_set: ColumnSetMode::default(),
        }
    }
}

impl ReportConfig {
    /// Page bound for the paginator
    pub fn page_limit(&self) -> Option<u32> {
        (self.max_pages > 0).then_some(self.max_pages)
    }

    pub fn tz(&self) -> AppResult<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            AppError::Config(format!("report.timezone '{}': {}", self.timezone, e))
        })
    }
}

/// Warehouse backend
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseBackend {
    #[default]
    Bigquery,
    Postgres,
}

/// Write mode for the destination table
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Plain append; re-running a day duplicates its rows
    #[default]
    Append,
    /// Delete the run's `start_time` range first, then append
    ReplaceRange,
}

/// Warehouse configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub backend: WarehouseBackend,

    /// Destination as `project.dataset.table`
    pub destination: String,

    /// Send the static schema instead of relying on auto-detection
    #[serde(default = "default_explicit_schema")]
    pub explicit_schema: bool,

    #[serde(default)]
    pub write_mode: WriteMode,

    #[serde(default)]
    pub bigquery: BigQueryConfig,

    #[serde(default)]
    pub postgres: PostgresConfig,
}

fn default_explicit_schema() -> bool {
    true
}

impl WarehouseConfig {
    pub fn table_ref(&self) -> AppResult<TableRef> {
        self.destination.parse()
    }

    /// Schema handed to the loader, if any
    pub fn schema(&self) -> Option<TableSchema> {
        self.explicit_schema.then(TableSchema::calls_v1)
    }
}

/// BigQuery REST configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BigQueryConfig {
    /// Pre-minted OAuth access token
    pub access_token: Option<String>,

    /// Service-account JSON key file
    pub credentials_file: Option<String>,

    /// Job location (e.g. "EU", "US")
    pub location: Option<String>,

    #[serde(default = "default_bigquery_api_base")]
    pub api_base: String,

    /// Delay between job status polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Give up waiting on a load job after this many seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

fn default_bigquery_api_base() -> String {
    "https://bigquery.googleapis.com".to_string()
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_job_timeout() -> u64 {
    600
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            credentials_file: None,
            location: None,
            api_base: default_bigquery_api_base(),
            poll_interval_ms: default_poll_interval(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

/// PostgreSQL configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    2
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// `extra` is layered on top of `config/default` and `config/{RUN_MODE}`.
    /// The result is not validated; call [`AppConfig::validate`].
    pub fn load(extra: Option<&Path>) -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "production".to_string());
        debug!("Loading configuration (RUN_MODE={})", run_mode);

        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Some(path) = extra {
            builder = builder.add_source(File::from(path).required(true));
        }

        let builder = builder.add_source(
            Environment::with_prefix("CALLS")
                .separator("__")
                .try_parsing(true),
        );

        let mut config = Self::from_builder(builder)?;
        config.apply_fallbacks(|key| env::var(key).ok());
        Ok(config)
    }

    /// Deserialize from an already assembled builder
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> AppResult<Self> {
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Fill credentials from the variables the job used historically
    ///
    /// `ACCESS_TOKEN` feeds the report token and
    /// `GOOGLE_APPLICATION_CREDENTIALS` the BigQuery key file, each only when
    /// the namespaced setting is absent.
    pub fn apply_fallbacks<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if is_blank(&self.report.access_token) {
            self.report.access_token = lookup("ACCESS_TOKEN").filter(|v| !v.trim().is_empty());
            if self.report.access_token.is_some() {
                debug!("Report access token taken from ACCESS_TOKEN");
            }
        }

        if is_blank(&self.warehouse.bigquery.credentials_file) {
            self.warehouse.bigquery.credentials_file =
                lookup("GOOGLE_APPLICATION_CREDENTIALS").filter(|v| !v.trim().is_empty());
            if self.warehouse.bigquery.credentials_file.is_some() {
                debug!("BigQuery key file taken from GOOGLE_APPLICATION_CREDENTIALS");
            }
        }
    }

    /// Check everything the run needs before touching the network
    pub fn validate(&self) -> AppResult<()> {
        if is_blank(&self.report.access_token) {
            return Err(AppError::MissingCredential(
                "report access token (CALLS__REPORT__ACCESS_TOKEN or ACCESS_TOKEN)".to_string(),
            ));
        }

        if self.report.page_size == 0 || self.report.page_size > MAX_PAGE_SIZE {
            return Err(AppError::Config(format!(
                "report.page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.report.page_size
            )));
        }

        if self.report.url.trim().is_empty() {
            return Err(AppError::Config("report.url is empty".to_string()));
        }

        self.report.tz()?;
        self.warehouse.table_ref()?;

        if self.warehouse.explicit_schema && self.report.column_set == ColumnSetMode::Observed {
            return Err(AppError::Config(
                "warehouse.explicit_schema requires report.column_set = \"static\"".to_string(),
            ));
        }

        match self.warehouse.backend {
            WarehouseBackend::Bigquery => {
                let bq = &self.warehouse.bigquery;
                if is_blank(&bq.access_token) && is_blank(&bq.credentials_file) {
                    return Err(AppError::MissingCredential(
                        "BigQuery access token or service-account key \
                         (CALLS__WAREHOUSE__BIGQUERY__CREDENTIALS_FILE or GOOGLE_APPLICATION_CREDENTIALS)"
                            .to_string(),
                    ));
                }
                if bq.poll_interval_ms == 0 {
                    return Err(AppError::Config(
                        "warehouse.bigquery.poll_interval_ms must be positive".to_string(),
                    ));
                }
            }
            WarehouseBackend::Postgres => {
                if is_blank(&self.warehouse.postgres.url) {
                    return Err(AppError::MissingCredential(
                        "PostgreSQL URL (CALLS__WAREHOUSE__POSTGRES__URL)".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const MINIMAL: &str = r#"
        [report]
        access_token = "secret"

        [warehouse]
        destination = "proj.analytics.calls"
        bigquery = { access_token = "ya29.token" }
    "#;

    fn parse(toml: &str) -> AppConfig {
        AppConfig::from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.report.url, "https://dataapi.uiscom.ru/v2.0");
        assert_eq!(config.report.page_size, 10_000);
        assert_eq!(config.report.page_limit(), Some(1000));
        assert_eq!(config.report.on_page_error, PageErrorPolicy::Abort);
        assert_eq!(config.report.column_set, ColumnSetMode::Static);
        assert_eq!(config.warehouse.backend, WarehouseBackend::Bigquery);
        assert_eq!(config.warehouse.write_mode, WriteMode::Append);
        assert!(config.warehouse.schema().is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_report_token_is_credential_error() {
        let config = parse(
            r#"
            [report]
            [warehouse]
            destination = "p.d.t"
            bigquery = { access_token = "x" }
            "#,
        );
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AppError::MissingCredential(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_legacy_access_token_fallback() {
        let mut config = parse(
            r#"
            [warehouse]
            destination = "p.d.t"
            "#,
        );
        config.apply_fallbacks(|key| match key {
            "ACCESS_TOKEN" => Some("legacy".to_string()),
            "GOOGLE_APPLICATION_CREDENTIALS" => Some("credentials.json".to_string()),
            _ => None,
        });
        assert_eq!(config.report.access_token.as_deref(), Some("legacy"));
        assert_eq!(
            config.warehouse.bigquery.credentials_file.as_deref(),
            Some("credentials.json")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fallback_does_not_override() {
        let mut config = parse(MINIMAL);
        config.apply_fallbacks(|_| Some("other".to_string()));
        assert_eq!(config.report.access_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_page_size_bounds() {
        let mut config = parse(MINIMAL);
        config.report.page_size = 0;
        assert!(config.validate().is_err());
        config.report.page_size = 10_001;
        assert!(config.validate().is_err());
        config.report.page_size = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_pages_zero_disables_bound() {
        let mut config = parse(MINIMAL);
        config.report.max_pages = 0;
        assert_eq!(config.report.page_limit(), None);
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let mut config = parse(MINIMAL);
        config.report.timezone = "Mars/Olympus".to_string();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_observed_columns_need_autodetect() {
        let mut config = parse(MINIMAL);
        config.report.column_set = ColumnSetMode::Observed;
        assert!(config.validate().is_err());
        config.warehouse.explicit_schema = false;
        assert!(config.validate().is_ok());
        assert!(config.warehouse.schema().is_none());
    }

    #[test]
    fn test_postgres_requires_url() {
        let config = parse(
            r#"
            [report]
            access_token = "secret"
            on_page_error = "keep_partial"
            [warehouse]
            backend = "postgres"
            write_mode = "replace_range"
            destination = "calls_db.public.calls"
            "#,
        );
        assert_eq!(config.report.on_page_error, PageErrorPolicy::KeepPartial);
        assert_eq!(config.warehouse.write_mode, WriteMode::ReplaceRange);
        assert!(matches!(
            config.validate(),
            Err(AppError::MissingCredential(_))
        ));
    }
}
