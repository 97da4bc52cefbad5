//! Integración con el Data API de reportes de telefonía
//!
//! Este crate proporciona el cliente JSON-RPC 2.0 para:
//! - `get.calls_report`: registros de llamadas (CDR) de un rango de fechas
//!
//! # Uso
//!
//! ```rust,ignore
//! use calls_report::ReportClient;
//!
//! let client = ReportClient::new(
//!     "https://dataapi.uiscom.ru/v2.0",
//!     &access_token,
//!     120,  // timeout_secs
//! )?;
//!
//! // Primera página del día anterior
//! let page = client.get_calls_report(&range, 0, 10_000).await?;
//! ```

mod client;
mod types;

pub use client::{interpret_response, requested_fields, ReportClient, ReportError};
pub use types::*;
