//! BigQuery REST v2 job resources
//!
//! Only the fields the loader reads or writes are modelled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableReference {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableFieldSchema {
    pub fields: Vec<FieldSchema>,
}

/// `configuration.load`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadConfiguration {
    pub destination_table: TableReference,
    pub source_format: String,
    pub write_disposition: String,
    pub create_disposition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableFieldSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autodetect: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameter {
    pub name: String,
    pub parameter_type: ParameterType,
    pub parameter_value: ParameterValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterType {
    #[serde(rename = "type")]
    pub param_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterValue {
    pub value: String,
}

/// `configuration.query`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfiguration {
    pub query: String,
    pub use_legacy_sql: bool,
    pub parameter_mode: String,
    pub query_parameters: Vec<QueryParameter>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryConfiguration>,
}

/// Job insert body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInsert {
    pub job_reference: JobReference,
    pub configuration: JobConfiguration,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorProto {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl std::fmt::Display for ErrorProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.reason.as_deref().unwrap_or("error"),
            self.message.as_deref().unwrap_or("no message")
        )
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: String,
    #[serde(default)]
    pub error_result: Option<ErrorProto>,
    #[serde(default)]
    pub errors: Option<Vec<ErrorProto>>,
}

/// Job resource as returned by `jobs.insert` / `jobs.get`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResource {
    #[serde(default)]
    pub job_reference: Option<JobReference>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub statistics: Option<Value>,
}

impl JobResource {
    pub fn is_done(&self) -> bool {
        self.status.as_ref().map_or(false, |s| s.state == "DONE")
    }

    /// Rows written by a finished load job
    pub fn output_rows(&self) -> Option<u64> {
        stat_u64(self.statistics.as_ref()?, &["load", "outputRows"])
    }
}

/// BigQuery reports int64 statistics as decimal strings
fn stat_u64(statistics: &Value, path: &[&str]) -> Option<u64> {
    let mut node = statistics;
    for key in path {
        node = node.get(key)?;
    }
    match node {
        Value::String(s) => s.parse().ok(),
        other => other.as_u64(),
    }
}

/// Body of an OAuth error or a BigQuery error response
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}
