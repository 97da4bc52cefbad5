//! calls-loader
//!
//! Daily batch job: pulls call-detail records for a date range from the
//! telephony report API, flattens and types them, and appends them to the
//! warehouse.

mod cli;

use calls_core::{AppConfig, AppError, AppResult};
use calls_report::ReportClient;
use calls_services::{IngestPipeline, LoadSettings, Paginator, RecordNormalizer, RunSummary};
use calls_warehouse::connect_loader;
use chrono::Utc;
use clap::Parser;
use cli::Args;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` wins; otherwise `LOG_LEVEL` applies to the job's own crates.
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "calls_loader={0},calls_core={0},calls_report={0},calls_services={0},calls_warehouse={0},sqlx=warn",
            log_level
        ))
    });

    let json = env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }
}

async fn run(args: &Args) -> AppResult<RunSummary> {
    // Bad flags and bad configuration fail before any network activity
    let range = args.resolve_range(Utc::now())?;

    let config = AppConfig::load(args.config.as_deref())?;
    config.validate()?;

    info!("📅 Range: {}", range);
    info!(
        "Report API: {} (page size {}, on_page_error={:?}, column_set={:?})",
        config.report.url,
        config.report.page_size,
        config.report.on_page_error,
        config.report.column_set
    );

    let client = ReportClient::from_config(&config.report)
        .map_err(|e| AppError::Config(format!("Report client: {}", e)))?;

    let paginator = Paginator::from_config(Arc::new(client), &config.report);
    let normalizer = RecordNormalizer::from_config(&config.report)?;
    let settings = LoadSettings::from_config(&config)?;

    info!(
        "Destination: {} (write_mode={:?}, explicit_schema={})",
        settings.table, settings.write_mode, config.warehouse.explicit_schema
    );

    let mut pipeline = IngestPipeline::new(paginator, normalizer, settings);

    if args.dry_run {
        warn!("⚠️  Dry run: the warehouse will not be written");
    } else {
        let loader = connect_loader(&config.warehouse).await?;
        info!("✅ Warehouse loader ready");
        pipeline = pipeline.with_loader(loader);
    }

    pipeline.run(&range).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing();

    info!("🚀 Starting calls-loader v{}", env!("CARGO_PKG_VERSION"));

    match run(&args).await {
        Ok(summary) => {
            if summary.is_partial_load() {
                warn!("⚠️  Range was loaded partially");
            }
            info!(
                outcome = %summary.outcome,
                pages = summary.pages,
                records = summary.records_fetched,
                rows_loaded = summary.rows_loaded,
                rows_deleted = ?summary.rows_deleted,
                coercion_failures = summary.coercion_failures,
                job_id = ?summary.job_id,
                "✅ Run finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.is_fetch_error() {
                warn!("Nothing was uploaded for this range");
            }
            error!(error_code = e.error_code(), "❌ Run failed: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
