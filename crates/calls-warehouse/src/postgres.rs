//! PostgreSQL bulk loader
//!
//! `project.dataset.table` maps onto database / schema / table. The whole
//! batch (and the optional range delete) runs in a single transaction, so a
//! failed load leaves the destination untouched.

use async_trait::async_trait;
use calls_core::models::{CellValue, ColumnType, NormalizedRow, ResultBatch, TableRef, TableSchema};
use calls_core::traits::{BulkLoader, LoadReport, LoadTarget, WriteDisposition};
use calls_core::{AppError, AppResult};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, error, info, instrument, warn};

/// Postgres caps bind parameters per statement at u16::MAX
const MAX_BIND_PARAMS: usize = 65_535;

/// Bulk loader writing into a PostgreSQL table
pub struct PgBulkLoader {
    pool: PgPool,
}

impl PgBulkLoader {
    /// Create a new loader over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    async fn check_database(&self, table: &TableRef) -> AppResult<()> {
        let current: String = sqlx::query_scalar("SELECT current_database()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error reading current_database(): {}", e);
                AppError::Database(format!("Failed to read current database: {}", e))
            })?;

        if current != table.project {
            warn!(
                "Destination project '{}' does not match connected database '{}'; writing to '{}'",
                table.project, current, current
            );
        }

        Ok(())
    }
}

/// PostgreSQL type for a warehouse column type
pub fn pg_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

/// Double-quoted identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualified table name
pub fn qualified_table(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.dataset), quote_ident(&table.table))
}

pub fn create_table_sql(table: &TableRef, schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), pg_type(c.column_type)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table(table),
        columns
    )
}

/// Rows per INSERT statement for a given column count
pub fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// Column types in batch column order
///
/// Columns absent from `schema` are stored as text.
fn column_types(batch: &ResultBatch, schema: &TableSchema) -> Vec<ColumnType> {
    batch
        .columns()
        .iter()
        .map(|name| {
            schema
                .column(name)
                .map(|c| c.column_type)
                .unwrap_or(ColumnType::String)
        })
        .collect()
}

fn build_insert<'a>(
    table: &TableRef,
    columns: &[String],
    types: &'a [ColumnType],
    rows: &'a [NormalizedRow],
) -> QueryBuilder<'a, Postgres> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        qualified_table(table),
        column_list
    ));

    builder.push_values(rows, |mut b, row| {
        for (cell, column_type) in row.cells().iter().zip(types) {
            match column_type {
                ColumnType::String => b.push_bind(cell.as_text()),
                ColumnType::Integer => b.push_bind(cell.as_i64()),
                ColumnType::Float => b.push_bind(cell.as_f64()),
                ColumnType::Boolean => b.push_bind(cell.as_bool()),
                ColumnType::Timestamp => b.push_bind(cell.as_timestamp()),
            };
        }
    });

    builder
}

/// Number of non-null cells that do not fit their column type
fn count_mismatches(batch: &ResultBatch, types: &[ColumnType]) -> usize {
    batch
        .rows()
        .iter()
        .flat_map(|row| row.cells().iter().zip(types))
        .filter(|(cell, column_type)| !fits(cell, **column_type))
        .count()
}

fn fits(cell: &CellValue, column_type: ColumnType) -> bool {
    match column_type {
        _ if cell.is_null() => true,
        ColumnType::String => true,
        ColumnType::Integer => cell.as_i64().is_some(),
        ColumnType::Float => cell.as_f64().is_some(),
        ColumnType::Boolean => cell.as_bool().is_some(),
        ColumnType::Timestamp => cell.as_timestamp().is_some(),
    }
}

#[async_trait]
impl BulkLoader for PgBulkLoader {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, batch, target), fields(table = %target.table, rows = batch.len()))]
    async fn append(&self, batch: &ResultBatch, target: &LoadTarget) -> AppResult<LoadReport> {
        if batch.is_empty() {
            return Ok(LoadReport::default());
        }

        self.check_database(&target.table).await?;

        let schema = target
            .schema
            .clone()
            .unwrap_or_else(|| batch.inferred_schema());
        let types = column_types(batch, &schema);

        let mismatches = count_mismatches(batch, &types);
        if mismatches > 0 {
            warn!("{} cells do not match their column type and will be stored as NULL", mismatches);
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            AppError::Transaction(format!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&target.table.dataset)
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create schema {}: {}", target.table.dataset, e);
            AppError::Database(format!("Failed to create schema: {}", e))
        })?;

        sqlx::query(&create_table_sql(&target.table, &schema))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to create table {}: {}", target.table, e);
                AppError::Database(format!("Failed to create table: {}", e))
            })?;

        let rows_deleted = match &target.disposition {
            WriteDisposition::Append => None,
            WriteDisposition::ReplaceRange { column, from, till } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} BETWEEN $1 AND $2",
                    qualified_table(&target.table),
                    quote_ident(column)
                );
                let result = sqlx::query(&sql)
                    .bind(*from)
                    .bind(*till)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        error!("Failed to delete existing range from {}: {}", target.table, e);
                        AppError::Database(format!("Failed to delete existing rows: {}", e))
                    })?;
                info!("Deleted {} existing rows in range", result.rows_affected());
                Some(result.rows_affected())
            }
        };

        let chunk_size = rows_per_statement(batch.columns().len());
        let mut rows_written = 0u64;

        for chunk in batch.rows().chunks(chunk_size) {
            let mut builder = build_insert(&target.table, batch.columns(), &types, chunk);
            let result = builder.build().execute(&mut *tx).await.map_err(|e| {
                error!("Failed to insert into {}: {}", target.table, e);
                AppError::Database(format!("Failed to insert rows: {}", e))
            })?;
            rows_written += result.rows_affected();
            debug!("Inserted chunk of {} rows", chunk.len());
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit load into {}: {}", target.table, e);
            AppError::Transaction(format!("Failed to commit: {}", e))
        })?;

        Ok(LoadReport {
            rows_written,
            rows_deleted,
            job_id: None,
        })
    }
}
