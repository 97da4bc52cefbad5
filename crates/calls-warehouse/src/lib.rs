//! calls-loader Warehouse Layer
//!
//! This crate provides the bulk-append write path for normalized call batches.
//! It includes:
//!
//! - BigQuery load jobs over the REST API (service-account or bearer auth)
//! - PostgreSQL loading with sqlx, one transaction per batch
//! - Optional range replacement for idempotent daily re-runs

pub mod bigquery;
pub mod pool;
pub mod postgres;

pub use bigquery::BigQueryLoader;
pub use pool::{create_pool, create_pool_from_config};
pub use postgres::PgBulkLoader;

// Re-export commonly used types
pub use calls_core::{AppError, AppResult};
pub use sqlx::PgPool;

use calls_core::config::{WarehouseBackend, WarehouseConfig};
use calls_core::traits::BulkLoader;
use tracing::info;

/// Build the loader selected by `warehouse.backend`
pub async fn connect_loader(config: &WarehouseConfig) -> AppResult<Box<dyn BulkLoader>> {
    let loader: Box<dyn BulkLoader> = match config.backend {
        WarehouseBackend::Bigquery => Box::new(BigQueryLoader::from_config(&config.bigquery)?),
        WarehouseBackend::Postgres => {
            let pool = create_pool_from_config(&config.postgres).await?;
            Box::new(PgBulkLoader::new(pool))
        }
    };

    info!("Warehouse backend: {}", loader.backend());
    Ok(loader)
}
