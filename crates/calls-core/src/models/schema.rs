//! Field contract, warehouse column types and destination naming
//!
//! The field list below is the full extraction requested from
//! `get.calls_report`. `calls_v1` is the static table layout derived from it.

use crate::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scalar fields requested for every call
pub const CALL_SCALAR_FIELDS: &[&str] = &[
    "id",
    "start_time",
    "finish_time",
    "virtual_phone_number",
    "is_transfer",
    "finish_reason",
    "direction",
    "source",
    "communication_number",
    "communication_page_url",
    "communication_id",
    "communication_type",
    "is_lost",
    "cpn_region_id",
    "cpn_region_name",
    "cpn_country_name",
    "wait_duration",
    "total_wait_duration",
    "lost_call_processing_duration",
    "talk_duration",
    "clean_talk_duration",
    "total_duration",
    "postprocess_duration",
    "ua_client_id",
    "ym_client_id",
    "sale_date",
    "sale_cost",
    "search_query",
    "search_engine",
    "referrer_domain",
    "referrer",
    "entrance_page",
    "gclid",
    "yclid",
    "ymclid",
    "ef_id",
    "channel",
    "site_id",
    "site_domain_name",
    "campaign_id",
    "campaign_name",
    "auto_call_campaign_name",
    "visit_other_campaign",
    "visitor_id",
    "person_id",
    "visitor_type",
    "visitor_session_id",
    "visits_count",
    "visitor_first_campaign_id",
    "visitor_first_campaign_name",
    "visitor_city",
    "visitor_region",
    "visitor_country",
    "visitor_device",
    "last_answered_employee_id",
    "last_answered_employee_full_name",
    "last_answered_employee_rating",
    "first_answered_employee_id",
    "first_answered_employee_full_name",
    "scenario_id",
    "scenario_name",
    "call_api_external_id",
    "call_api_request_id",
    "contact_phone_number",
    "contact_full_name",
    "contact_id",
    "utm_source",
    "utm_medium",
    "utm_term",
    "utm_content",
    "utm_campaign",
    "openstat_ad",
    "openstat_campaign",
    "openstat_service",
    "openstat_source",
    "eq_utm_source",
    "eq_utm_medium",
    "eq_utm_term",
    "eq_utm_content",
    "eq_utm_campaign",
    "eq_utm_referrer",
    "eq_utm_expid",
    "operator_phone_number",
    "source_id",
    "source_name",
    "source_new",
    "channel_new",
    "channel_code",
    "ext_id",
    "properties",
];

/// Nested per-call list of employee interactions
pub const EMPLOYEES_FIELD: &str = "employees";

/// Sub-fields of an `employees` entry, in output column order
pub const EMPLOYEE_SUBFIELDS: [&str; 4] = [
    "employee_id",
    "employee_full_name",
    "is_talked",
    "is_answered",
];

/// Columns parsed into absolute instants
pub const TIMESTAMP_COLUMNS: [&str; 2] = ["start_time", "finish_time"];

/// Columns parsed into integers
pub const INTEGER_COLUMNS: [&str; 1] = ["talk_duration"];

/// Warehouse column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl ColumnType {
    /// BigQuery standard type name
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "FLOAT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One nullable column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column list with a version tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub version: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(version: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            version: version.into(),
            columns,
        }
    }

    /// Static layout of the calls table
    ///
    /// `id` STRING, `start_time`/`finish_time` TIMESTAMP, `talk_duration`
    /// INTEGER, every other requested field STRING, then the four flattened
    /// employee columns.
    pub fn calls_v1() -> Self {
        let mut columns: Vec<ColumnSpec> = CALL_SCALAR_FIELDS
            .iter()
            .map(|&name| {
                let column_type = if TIMESTAMP_COLUMNS.contains(&name) {
                    ColumnType::Timestamp
                } else if INTEGER_COLUMNS.contains(&name) {
                    ColumnType::Integer
                } else {
                    ColumnType::String
                };
                ColumnSpec::new(name, column_type)
            })
            .collect();

        columns.extend(
            EMPLOYEE_SUBFIELDS
                .iter()
                .map(|&name| ColumnSpec::new(name, ColumnType::String)),
        );

        Self::new("calls_v1", columns)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Destination table, `project.dataset.table`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl FromStr for TableRef {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(AppError::Config(format!(
                "destination '{}' must be project.dataset.table",
                s
            )));
        }

        Ok(Self {
            project: parts[0].trim().to_string(),
            dataset: parts[1].trim().to_string(),
            table: parts[2].trim().to_string(),
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}
