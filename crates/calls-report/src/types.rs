//! Tipos de datos para la API JSON-RPC de reportes de llamadas
//!
//! Estos tipos mapean las estructuras de `get.calls_report` según la
//! documentación del Data API.

use calls_core::models::DateRange;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============================================================================
// JSON-RPC 2.0 Types
// ============================================================================

/// Request JSON-RPC 2.0
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: T,
}

/// Response JSON-RPC 2.0
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

/// Error JSON-RPC 2.0
#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

// ============================================================================
// get.calls_report Types
// ============================================================================

/// Método del reporte de llamadas
pub const CALLS_REPORT_METHOD: &str = "get.calls_report";

/// Parámetros de `get.calls_report`
#[derive(Clone, Serialize)]
pub struct CallsReportParams {
    pub access_token: String,
    pub date_from: String,
    pub date_till: String,
    pub offset: u64,
    pub limit: u32,
    pub fields: Vec<String>,
}

impl CallsReportParams {
    pub fn new(
        access_token: &str,
        range: &DateRange,
        offset: u64,
        limit: u32,
        fields: Vec<String>,
    ) -> Self {
        Self {
            access_token: access_token.to_string(),
            date_from: range.from_param(),
            date_till: range.till_param(),
            offset,
            limit,
            fields,
        }
    }
}

// El token nunca debe terminar en los logs
impl fmt::Debug for CallsReportParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallsReportParams")
            .field("access_token", &"***")
            .field("date_from", &self.date_from)
            .field("date_till", &self.date_till)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Resultado de `get.calls_report`
///
/// `data` se deja como `Value` para distinguir "sin datos" de una
/// respuesta mal formada.
#[derive(Debug, Deserialize)]
pub struct CallsReportResult {
    pub data: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl CallsReportResult {
    /// Total de registros que reporta la API para el rango, si lo informa
    pub fn total_items(&self) -> Option<u64> {
        self.metadata.as_ref()?.get("total_items")?.as_u64()
    }
}
