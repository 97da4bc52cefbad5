//! Cliente HTTP JSON-RPC 2.0 para el Data API de reportes
//!
//! Una petición `get.calls_report` por página. Los fallos de transporte y
//! de protocolo se devuelven como `ReportError`; una página vacía es
//! `PageOutcome::End`.

use async_trait::async_trait;
use calls_core::config::ReportConfig;
use calls_core::models::{CallRecord, DateRange, CALL_SCALAR_FIELDS, EMPLOYEES_FIELD};
use calls_core::traits::{PageOutcome, ReportSource};
use reqwest::{Client, ClientBuilder};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use super::types::{
    CallsReportParams, CallsReportResult, JsonRpcRequest, JsonRpcResponse, CALLS_REPORT_METHOD,
};

/// Cliente para el Data API
pub struct ReportClient {
    http_client: Client,
    base_url: String,
    access_token: String,
    timeout_secs: u64,
    fields: Vec<String>,
    request_id: AtomicU64,
}

/// Errores del cliente de reportes
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: request took longer than {0}s")]
    Timeout(u64),

    #[error("HTTP error: status {status}")]
    HttpError { status: u16, body: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("RPC error {code}: {message}")]
    RpcError { code: i64, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Campos pedidos en cada página: los escalares más `employees`
pub fn requested_fields() -> Vec<String> {
    CALL_SCALAR_FIELDS
        .iter()
        .chain(std::iter::once(&EMPLOYEES_FIELD))
        .map(|f| f.to_string())
        .collect()
}

impl ReportClient {
    /// Crea un nuevo cliente
    ///
    /// # Arguments
    ///
    /// * `base_url` - URL del endpoint JSON-RPC (ej: "https://dataapi.uiscom.ru/v2.0")
    /// * `access_token` - Token de acceso del Data API
    /// * `timeout_secs` - Timeout por petición en segundos
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let client = ReportClient::new("https://dataapi.uiscom.ru/v2.0", "token", 120)?;
    /// ```
    pub fn new(base_url: &str, access_token: &str, timeout_secs: u64) -> Result<Self, ReportError> {
        if access_token.trim().is_empty() {
            return Err(ReportError::Config("access token is empty".to_string()));
        }

        let http_client = ClientBuilder::new()
            .timeout(Duration::from_secs(timeout_secs))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ReportError::Connection(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.to_string(),
            access_token: access_token.to_string(),
            timeout_secs,
            fields: requested_fields(),
            request_id: AtomicU64::new(1),
        })
    }

    /// Crea un cliente desde la sección `[report]` de la configuración
    pub fn from_config(config: &ReportConfig) -> Result<Self, ReportError> {
        let token = config
            .access_token
            .as_deref()
            .ok_or_else(|| ReportError::Config("report.access_token not set".to_string()))?;

        Self::new(&config.url, token, config.timeout_secs)
    }

    /// Obtiene el siguiente ID de request
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Construye el cuerpo JSON-RPC de una página
    pub fn build_request(
        &self,
        range: &DateRange,
        offset: u64,
        limit: u32,
    ) -> JsonRpcRequest<CallsReportParams> {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id(),
            method: CALLS_REPORT_METHOD.to_string(),
            params: CallsReportParams::new(
                &self.access_token,
                range,
                offset,
                limit,
                self.fields.clone(),
            ),
        }
    }

    /// Ejecuta `get.calls_report` para una página
    ///
    /// # Returns
    ///
    /// `PageOutcome::Page` con los registros, `PageOutcome::End` si la API no
    /// devolvió registros, o el error de transporte/protocolo (ya registrado
    /// en el log).
    #[instrument(skip(self, range), fields(range = %range))]
    pub async fn get_calls_report(
        &self,
        range: &DateRange,
        offset: u64,
        limit: u32,
    ) -> Result<PageOutcome, ReportError> {
        let request = self.build_request(range, offset, limit);

        debug!(
            "Report request: method={}, id={}, offset={}, limit={}",
            request.method, request.id, offset, limit
        );

        let response = self
            .http_client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let err = if e.is_timeout() {
                    ReportError::Timeout(self.timeout_secs)
                } else {
                    ReportError::Connection(e.to_string())
                };
                error!("Report request failed at offset {}: {}", offset, err);
                err
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            let err = ReportError::ParseError(format!("Failed to read response body: {}", e));
            error!("Report response unreadable at offset {}: {}", offset, err);
            err
        })?;

        debug!("Report response: status={}, {} bytes", status, body.len());

        interpret_response(status, &body).map_err(|err| {
            error!("Report API error at offset {}: {}", offset, err);
            err
        })
    }
}

/// Interpreta status + cuerpo de una respuesta de `get.calls_report`
///
/// Separado del transporte para poder probarlo sin red.
pub fn interpret_response(status: u16, body: &str) -> Result<PageOutcome, ReportError> {
    if !(200..300).contains(&status) {
        return Err(ReportError::HttpError {
            status,
            body: truncate(body, 512),
        });
    }

    let rpc_response: JsonRpcResponse<CallsReportResult> =
        serde_json::from_str(body).map_err(|e| {
            ReportError::ParseError(format!(
                "Failed to parse JSON: {} - Body: {}",
                e,
                truncate(body, 256)
            ))
        })?;

    if let Some(err) = rpc_response.error {
        return Err(ReportError::RpcError {
            code: err.code,
            message: err.message,
        });
    }

    let result = rpc_response
        .result
        .ok_or_else(|| ReportError::MalformedResponse("missing 'result'".to_string()))?;

    if let Some(total) = result.total_items() {
        debug!("Report metadata: total_items={}", total);
    }

    let data = match result.data {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(ReportError::MalformedResponse(format!(
                "'result.data' is not an array: {}",
                type_name(&other)
            )))
        }
        None => {
            return Err(ReportError::MalformedResponse(
                "missing 'result.data'".to_string(),
            ))
        }
    };

    let mut records = Vec::with_capacity(data.len());
    for item in data {
        match CallRecord::try_from(item) {
            Ok(record) => records.push(record),
            Err(other) => warn!("Skipping non-object report entry: {}", type_name(&other)),
        }
    }

    Ok(PageOutcome::from_records(records))
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl ReportSource for ReportClient {
    type Error = ReportError;

    async fn fetch_page(
        &self,
        range: &DateRange,
        offset: u64,
        limit: u32,
    ) -> Result<PageOutcome, ReportError> {
        self.get_calls_report(range, offset, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn client() -> ReportClient {
        ReportClient::new("http://localhost:8080/v2.0", "token", 5).unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.base_url(), "http://localhost:8080/v2.0");
        assert_eq!(client.fields().len(), CALL_SCALAR_FIELDS.len() + 1);
        assert_eq!(client.fields().last().map(String::as_str), Some("employees"));
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(
            ReportClient::new("http://localhost", " ", 5),
            Err(ReportError::Config(_))
        ));
    }

    #[test]
    fn test_request_id_increment() {
        let client = client();
        let range = DateRange::for_day(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());

        let id1 = client.build_request(&range, 0, 10).id;
        let id2 = client.build_request(&range, 10, 10).id;
        let id3 = client.build_request(&range, 20, 10).id;

        assert_eq!((id1, id2, id3), (1, 2, 3));
    }

    #[test]
    fn test_interpret_page() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"data":[{"id":1},{"id":2}]}}"#;
        match interpret_response(200, body).unwrap() {
            PageOutcome::Page(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[1].id().as_deref(), Some("2"));
            }
            PageOutcome::End => panic!("expected a page"),
        }
    }

    #[test]
    fn test_interpret_empty_data_is_end() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"data":[]}}"#;
        assert_eq!(interpret_response(200, body).unwrap(), PageOutcome::End);
    }

    #[test]
    fn test_interpret_http_error() {
        let err = interpret_response(502, "Bad Gateway").unwrap_err();
        assert!(matches!(err, ReportError::HttpError { status: 502, .. }));
    }

    #[test]
    fn test_interpret_non_json() {
        let err = interpret_response(200, "<html>oops</html>").unwrap_err();
        assert!(matches!(err, ReportError::ParseError(_)));
    }

    #[test]
    fn test_interpret_rpc_error() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"Invalid access token","data":{"mnemonic":"invalid_access_token"}}}"#;
        let err = interpret_response(200, body).unwrap_err();
        assert!(matches!(err, ReportError::RpcError { code: -32001, .. }));
    }

    #[test]
    fn test_interpret_missing_data() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"metadata":{}}}"#;
        assert!(matches!(
            interpret_response(200, body),
            Err(ReportError::MalformedResponse(_))
        ));

        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        assert!(matches!(
            interpret_response(200, body),
            Err(ReportError::MalformedResponse(_))
        ));

        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"data":{"id":1}}}"#;
        assert!(matches!(
            interpret_response(200, body),
            Err(ReportError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_interpret_skips_non_objects() {
        let body = r#"{"result":{"data":[{"id":1}, 42, null]}}"#;
        assert_eq!(interpret_response(200, body).unwrap().len(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("звонки", 3), "зво...");
        assert_eq!(truncate("ok", 3), "ok");
    }
}
