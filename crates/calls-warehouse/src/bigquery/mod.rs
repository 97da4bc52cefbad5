//! BigQuery bulk loader
//!
//! A batch is written as one load job: the job configuration and the rows
//! (newline-delimited JSON) travel together in a `multipart/related` upload,
//! then the job is polled until BigQuery reports it `DONE`.
//!
//! Range replacement loads into a staging table instead and swaps the range
//! in with a single transactional script.
//!
//! # Uso
//!
//! ```rust,ignore
//! let loader = BigQueryLoader::from_config(&config.warehouse.bigquery)?;
//! let report = loader.append(&batch, &target).await?;
//! ```

mod auth;
mod types;

pub use auth::{build_assertion, AssertionClaims, ServiceAccountKey, TokenProvider, BIGQUERY_SCOPE};
pub use types::*;

use async_trait::async_trait;
use calls_core::config::BigQueryConfig;
use calls_core::models::{ResultBatch, TableRef, TableSchema};
use calls_core::traits::{BulkLoader, LoadReport, LoadTarget, WriteDisposition};
use calls_core::{AppError, AppResult};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const SOURCE_FORMAT: &str = "NEWLINE_DELIMITED_JSON";

const WRITE_APPEND: &str = "WRITE_APPEND";

const WRITE_TRUNCATE: &str = "WRITE_TRUNCATE";

/// BigQuery REST loader
pub struct BigQueryLoader {
    http_client: Client,
    auth: TokenProvider,
    api_base: String,
    location: Option<String>,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl BigQueryLoader {
    /// Create a loader from the `[warehouse.bigquery]` section
    ///
    /// A configured access token wins over a service-account key file.
    pub fn from_config(config: &BigQueryConfig) -> AppResult<Self> {
        let http_client = ClientBuilder::new()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let auth = match (config.access_token.as_deref(), config.credentials_file.as_deref()) {
            (Some(token), _) if !token.trim().is_empty() => {
                TokenProvider::from_token(token.trim(), http_client.clone())
            }
            (_, Some(path)) if !path.trim().is_empty() => {
                let key = ServiceAccountKey::from_file(Path::new(path.trim()))?;
                info!("Using service account {}", key.client_email);
                TokenProvider::from_service_account(key, http_client.clone())
            }
            _ => {
                return Err(AppError::MissingCredential(
                    "BigQuery access token or service-account key".to_string(),
                ))
            }
        };

        Ok(Self {
            http_client,
            auth,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            location: config.location.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
        })
    }

    fn jobs_url(&self, project: &str) -> String {
        format!("{}/bigquery/v2/projects/{}/jobs", self.api_base, project)
    }

    fn upload_url(&self, project: &str) -> String {
        format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.api_base, project
        )
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}",
            self.api_base, table.project, table.dataset, table.table
        )
    }

    fn job_reference(&self, project: &str) -> JobReference {
        JobReference {
            project_id: project.to_string(),
            job_id: format!("calls_loader_{}", Uuid::new_v4().simple()),
            location: self.location.clone(),
        }
    }

    /// Drop a table; a missing table is not an error
    #[instrument(skip(self), fields(table = %table))]
    async fn drop_table(&self, table: &TableRef) -> AppResult<()> {
        let token = self.auth.token().await?;

        let response = self
            .http_client
            .delete(self.table_url(table))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                error!("BigQuery table delete failed: {}", e);
                AppError::Warehouse(format!("Table delete failed: {}", e))
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(api_error("Table delete", status, &body))
            }
        }
    }

    /// Submit a query job and wait for it
    async fn run_query(&self, project: &str, query: QueryConfiguration, what: &str) -> AppResult<JobResource> {
        let insert = JobInsert {
            job_reference: self.job_reference(project),
            configuration: JobConfiguration {
                load: None,
                query: Some(query),
            },
        };

        let token = self.auth.token().await?;
        let response = self
            .http_client
            .post(self.jobs_url(project))
            .bearer_auth(token)
            .json(&insert)
            .send()
            .await
            .map_err(|e| {
                error!("BigQuery {} submission failed: {}", what, e);
                AppError::Warehouse(format!("{} submission failed: {}", what, e))
            })?;

        let job = read_job(response, what).await?;
        self.wait_for_job(job, &insert.job_reference).await
    }

    /// Replace the range through a staging table
    ///
    /// The batch is loaded into a fresh staging table first; the delete and
    /// the insert then run as one transaction, so a failed load or a failed
    /// insert leaves the destination untouched. The staging table is dropped
    /// whatever the outcome.
    #[instrument(skip(self, batch, target), fields(table = %target.table))]
    async fn replace_range(
        &self,
        batch: &ResultBatch,
        target: &LoadTarget,
        column: &str,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    ) -> AppResult<LoadReport> {
        let staging = staging_table(&target.table);
        debug!("Staging {} rows in {}", batch.len(), staging);

        let result = self
            .stage_and_swap(batch, target, &staging, column, from, till)
            .await;

        if let Err(e) = self.drop_table(&staging).await {
            warn!("Staging table {} was not dropped: {}", staging, e);
        }

        result
    }

    async fn stage_and_swap(
        &self,
        batch: &ResultBatch,
        target: &LoadTarget,
        staging: &TableRef,
        column: &str,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    ) -> AppResult<LoadReport> {
        let load_job = self
            .load(batch, staging, target.schema.as_ref(), WRITE_TRUNCATE)
            .await?;

        let query = replace_range_query(&target.table, staging, batch.columns(), column, from, till);
        let swap_job = self
            .run_query(&target.table.project, query, "Range replacement")
            .await?;

        info!("Replaced range {} .. {} in {}", from, till, target.table);

        // Scripts do not report per-statement row counts
        Ok(LoadReport {
            rows_written: load_job.output_rows().unwrap_or(batch.len() as u64),
            rows_deleted: None,
            job_id: swap_job.job_reference.map(|r| r.job_id),
        })
    }

    #[instrument(skip(self, batch, schema), fields(table = %table))]
    async fn load(
        &self,
        batch: &ResultBatch,
        table: &TableRef,
        schema: Option<&TableSchema>,
        write_disposition: &str,
    ) -> AppResult<JobResource> {
        let ndjson = encode_ndjson(batch)?;
        let reference = self.job_reference(&table.project);
        let insert = JobInsert {
            job_reference: reference.clone(),
            configuration: JobConfiguration {
                load: Some(load_configuration(table, schema, write_disposition)),
                query: None,
            },
        };

        let metadata = serde_json::to_string(&insert)?;
        let boundary = format!("calls_loader_{}", Uuid::new_v4().simple());
        let body = multipart_body(&boundary, &metadata, &ndjson);

        debug!(
            "Submitting load job {} ({} rows, {} bytes)",
            reference.job_id,
            batch.len(),
            body.len()
        );

        let token = self.auth.token().await?;
        let response = self
            .http_client
            .post(self.upload_url(&table.project))
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("BigQuery load job submission failed: {}", e);
                AppError::Warehouse(format!("Load job submission failed: {}", e))
            })?;

        let job = read_job(response, "Load job submission").await?;
        self.wait_for_job(job, &reference).await
    }

    /// Poll `jobs.get` until the job is done or the timeout elapses
    async fn wait_for_job(&self, mut job: JobResource, reference: &JobReference) -> AppResult<JobResource> {
        let started = Instant::now();
        let job_ref = job.job_reference.clone().unwrap_or_else(|| reference.clone());

        loop {
            if job.is_done() {
                return check_job(job);
            }

            if started.elapsed() >= self.job_timeout {
                error!("BigQuery job {} still running after {:?}", job_ref.job_id, self.job_timeout);
                return Err(AppError::Warehouse(format!(
                    "Job {} did not finish within {}s",
                    job_ref.job_id,
                    self.job_timeout.as_secs()
                )));
            }

            tokio::time::sleep(self.poll_interval).await;

            let mut request = self
                .http_client
                .get(format!("{}/{}", self.jobs_url(&job_ref.project_id), job_ref.job_id))
                .bearer_auth(self.auth.token().await?);
            if let Some(location) = &job_ref.location {
                request = request.query(&[("location", location)]);
            }

            let response = request.send().await.map_err(|e| {
                error!("BigQuery job status request failed: {}", e);
                AppError::Warehouse(format!("Job status request failed: {}", e))
            })?;

            job = read_job(response, "Job status").await?;
            debug!(
                "Job {} state: {}",
                job_ref.job_id,
                job.status.as_ref().map_or("UNKNOWN", |s| s.state.as_str())
            );
        }
    }
}

#[async_trait]
impl BulkLoader for BigQueryLoader {
    fn backend(&self) -> &'static str {
        "bigquery"
    }

    async fn append(&self, batch: &ResultBatch, target: &LoadTarget) -> AppResult<LoadReport> {
        if batch.is_empty() {
            return Ok(LoadReport::default());
        }

        match &target.disposition {
            WriteDisposition::Append => {
                let job = self
                    .load(batch, &target.table, target.schema.as_ref(), WRITE_APPEND)
                    .await?;

                Ok(LoadReport {
                    rows_written: job.output_rows().unwrap_or(batch.len() as u64),
                    rows_deleted: None,
                    job_id: job.job_reference.map(|r| r.job_id),
                })
            }
            WriteDisposition::ReplaceRange { column, from, till } => {
                self.replace_range(batch, target, column, *from, *till).await
            }
        }
    }
}

/// Rows as newline-delimited JSON objects
pub fn encode_ndjson(batch: &ResultBatch) -> AppResult<String> {
    let mut out = String::new();
    for row in batch.rows() {
        out.push_str(&serde_json::to_string(&batch.row_json(row))?);
        out.push('\n');
    }
    Ok(out)
}

/// Load configuration: create if needed, explicit schema or autodetect
pub fn load_configuration(
    table: &TableRef,
    schema: Option<&TableSchema>,
    write_disposition: &str,
) -> LoadConfiguration {
    LoadConfiguration {
        destination_table: TableReference {
            project_id: table.project.clone(),
            dataset_id: table.dataset.clone(),
            table_id: table.table.clone(),
        },
        source_format: SOURCE_FORMAT.to_string(),
        write_disposition: write_disposition.to_string(),
        create_disposition: "CREATE_IF_NEEDED".to_string(),
        schema: schema.map(|s| TableFieldSchema {
            fields: s
                .columns
                .iter()
                .map(|c| FieldSchema {
                    name: c.name.clone(),
                    field_type: c.column_type.as_str().to_string(),
                    mode: "NULLABLE".to_string(),
                })
                .collect(),
        }),
        autodetect: if schema.is_none() { Some(true) } else { None },
    }
}

/// Uniquely named table next to `table` for staging one batch
pub fn staging_table(table: &TableRef) -> TableRef {
    TableRef {
        project: table.project.clone(),
        dataset: table.dataset.clone(),
        table: format!("{}_staging_{}", table.table, Uuid::new_v4().simple()),
    }
}

/// Backtick-quoted identifier for standard SQL
fn sql_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn sql_table(table: &TableRef) -> String {
    sql_ident(&table.to_string())
}

/// Script swapping the range of `table` for the staged rows
///
/// The destination is created from the staging layout when absent; the
/// delete and the insert share one transaction.
pub fn replace_range_query(
    table: &TableRef,
    staging: &TableRef,
    columns: &[String],
    column: &str,
    from: DateTime<Utc>,
    till: DateTime<Utc>,
) -> QueryConfiguration {
    let timestamp_param = |name: &str, value: DateTime<Utc>| QueryParameter {
        name: name.to_string(),
        parameter_type: ParameterType {
            param_type: "TIMESTAMP".to_string(),
        },
        parameter_value: ParameterValue {
            value: value.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        },
    };

    let column_list = columns
        .iter()
        .map(|c| sql_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let query = format!(
        "CREATE TABLE IF NOT EXISTS {dest} LIKE {staging};\n\
         BEGIN TRANSACTION;\n\
         DELETE FROM {dest} WHERE {column} BETWEEN @from AND @till;\n\
         INSERT INTO {dest} ({columns}) SELECT {columns} FROM {staging};\n\
         COMMIT TRANSACTION;",
        dest = sql_table(table),
        staging = sql_table(staging),
        column = sql_ident(column),
        columns = column_list
    );

    QueryConfiguration {
        query,
        use_legacy_sql: false,
        parameter_mode: "NAMED".to_string(),
        query_parameters: vec![timestamp_param("from", from), timestamp_param("till", till)],
    }
}

/// `multipart/related` body: job metadata first, then the data
pub fn multipart_body(boundary: &str, metadata: &str, data: &str) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n\
         --{b}\r\nContent-Type: application/octet-stream\r\n\r\n{d}\r\n--{b}--\r\n",
        b = boundary,
        m = metadata,
        d = data
    )
}

/// Turn a finished job into success or a load error
pub fn check_job(job: JobResource) -> AppResult<JobResource> {
    if let Some(status) = &job.status {
        if let Some(err) = &status.error_result {
            for detail in status.errors.iter().flatten() {
                warn!("BigQuery job error: {}", detail);
            }
            error!("BigQuery job failed: {}", err);
            return Err(AppError::Warehouse(format!("Job failed: {}", err)));
        }
    }
    Ok(job)
}

async fn read_job(response: reqwest::Response, what: &str) -> AppResult<JobResource> {
    let status = response.status();
    let body = response.text().await.map_err(|e| {
        error!("{}: failed to read response: {}", what, e);
        AppError::Warehouse(format!("{}: failed to read response: {}", what, e))
    })?;

    if !status.is_success() {
        return Err(api_error(what, status, &body));
    }

    serde_json::from_str(&body).map_err(|e| {
        error!("{}: unexpected response: {}", what, e);
        AppError::Warehouse(format!("{}: unexpected response: {}", what, e))
    })
}

fn api_error(what: &str, status: StatusCode, body: &str) -> AppError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.error.message)
        .unwrap_or_else(|| body.chars().take(256).collect());

    error!("{} returned {}: {}", what, status, message);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AppError::Auth(format!("{} returned {}: {}", what, status.as_u16(), message))
        }
        _ => AppError::Warehouse(format!("{} returned {}: {}", what, status.as_u16(), message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calls_core::models::{CellValue, NormalizedRow};
    use chrono::TimeZone;
    use serde_json::json;

    fn table() -> TableRef {
        "proj.analytics.calls".parse().unwrap()
    }

    #[test]
    fn test_encode_ndjson() {
        let mut batch = ResultBatch::new(vec!["id".to_string(), "start_time".to_string()]);
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        batch.push_row(NormalizedRow::new(vec!["1".into(), CellValue::Timestamp(ts)]));
        batch.push_row(NormalizedRow::new(vec!["2".into(), CellValue::Null]));

        let ndjson = encode_ndjson(&batch).unwrap();
        let lines: Vec<&str> = ndjson.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"id":"1","start_time":"2025-01-01T09:00:00Z"}"#);
        assert_eq!(lines[1], r#"{"id":"2","start_time":null}"#);
        assert!(ndjson.ends_with('\n'));
    }

    #[test]
    fn test_load_configuration_with_schema() {
        let schema = TableSchema::calls_v1();
        let config = load_configuration(&table(), Some(&schema), WRITE_APPEND);
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["writeDisposition"], "WRITE_APPEND");
        assert_eq!(json["createDisposition"], "CREATE_IF_NEEDED");
        assert_eq!(json["sourceFormat"], "NEWLINE_DELIMITED_JSON");
        assert!(json.get("autodetect").is_none());

        let fields = json["schema"]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), schema.len());
        assert!(fields
            .iter()
            .any(|f| f == &json!({"name": "start_time", "type": "TIMESTAMP", "mode": "NULLABLE"})));
    }

    #[test]
    fn test_load_configuration_autodetect() {
        let config = load_configuration(&table(), None, WRITE_TRUNCATE);
        assert_eq!(config.autodetect, Some(true));
        assert!(config.schema.is_none());
        assert_eq!(config.write_disposition, "WRITE_TRUNCATE");
    }

    #[test]
    fn test_staging_table_is_unique_sibling() {
        let first = staging_table(&table());
        let second = staging_table(&table());

        assert_eq!(first.project, "proj");
        assert_eq!(first.dataset, "analytics");
        assert!(first.table.starts_with("calls_staging_"));
        assert_ne!(first.table, second.table);
    }

    #[test]
    fn test_replace_range_query_is_one_transaction() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let till = Utc.with_ymd_and_hms(2025, 1, 1, 23, 59, 59).unwrap();
        let staging: TableRef = "proj.analytics.calls_staging_1".parse().unwrap();
        let columns = vec!["id".to_string(), "start_time".to_string()];

        let query = replace_range_query(&table(), &staging, &columns, "start_time", from, till);
        let statements: Vec<&str> = query.query.lines().collect();

        assert_eq!(
            statements,
            vec![
                "CREATE TABLE IF NOT EXISTS `proj.analytics.calls` LIKE `proj.analytics.calls_staging_1`;",
                "BEGIN TRANSACTION;",
                "DELETE FROM `proj.analytics.calls` WHERE `start_time` BETWEEN @from AND @till;",
                "INSERT INTO `proj.analytics.calls` (`id`, `start_time`) SELECT `id`, `start_time` FROM `proj.analytics.calls_staging_1`;",
                "COMMIT TRANSACTION;",
            ]
        );
        assert!(!query.use_legacy_sql);
        assert_eq!(query.query_parameters[0].parameter_value.value, "2025-01-01T00:00:00Z");
        assert_eq!(query.query_parameters[1].parameter_value.value, "2025-01-01T23:59:59Z");
    }

    #[test]
    fn test_sql_ident_escapes_backticks() {
        assert_eq!(sql_ident("we`ird"), "`we\\`ird`");
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_body("xyz", "{}", "{\"id\":\"1\"}\n");
        assert!(body.starts_with("--xyz\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n"));
        assert!(body.contains("--xyz\r\nContent-Type: application/octet-stream\r\n\r\n{\"id\":\"1\"}\n"));
        assert!(body.ends_with("--xyz--\r\n"));
    }

    #[test]
    fn test_check_job_error_result() {
        let job: JobResource = serde_json::from_value(json!({
            "status": {
                "state": "DONE",
                "errorResult": {"reason": "invalid", "message": "schema mismatch"},
                "errors": [{"reason": "invalid", "message": "row 3"}]
            }
        }))
        .unwrap();

        assert!(matches!(check_job(job), Err(AppError::Warehouse(_))));
    }

    #[test]
    fn test_api_error_maps_auth_statuses() {
        let body = r#"{"error": {"code": 401, "message": "Invalid Credentials"}}"#;
        assert!(matches!(
            api_error("Load", StatusCode::UNAUTHORIZED, body),
            AppError::Auth(_)
        ));
        assert!(matches!(
            api_error("Load", StatusCode::BAD_REQUEST, "oops"),
            AppError::Warehouse(_)
        ));
    }

    #[test]
    fn test_from_config_requires_credential() {
        let config = BigQueryConfig::default();
        assert!(matches!(
            BigQueryLoader::from_config(&config),
            Err(AppError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_from_config_with_token() {
        let config = BigQueryConfig {
            access_token: Some("ya29.token".to_string()),
            api_base: "https://bigquery.example.com/".to_string(),
            ..BigQueryConfig::default()
        };
        let loader = BigQueryLoader::from_config(&config).unwrap();

        assert_eq!(
            loader.upload_url("proj"),
            "https://bigquery.example.com/upload/bigquery/v2/projects/proj/jobs?uploadType=multipart"
        );
        assert_eq!(
            loader.table_url(&table()),
            "https://bigquery.example.com/bigquery/v2/projects/proj/datasets/analytics/tables/calls"
        );
        assert!(loader.job_reference("proj").job_id.starts_with("calls_loader_"));
    }
}
