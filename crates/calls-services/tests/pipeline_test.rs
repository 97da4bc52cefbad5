// tests/pipeline_test.rs
use async_trait::async_trait;
use calls_core::config::{ColumnSetMode, PageErrorPolicy, WriteMode};
use calls_core::models::{CallRecord, DateRange, ResultBatch, TableSchema};
use calls_core::traits::{BulkLoader, LoadReport, LoadTarget, PageOutcome, ReportSource};
use calls_core::{AppError, AppResult};
use calls_report::ReportError;
use calls_services::{IngestPipeline, LoadSettings, Paginator, RecordNormalizer, RunOutcome};
use chrono_tz::Tz;
use mockall::mock;
use proptest::prelude::*;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

mock! {
    pub Loader {}

    #[async_trait]
    impl BulkLoader for Loader {
        fn backend(&self) -> &'static str;
        async fn append(&self, batch: &ResultBatch, target: &LoadTarget) -> AppResult<LoadReport>;
    }
}

/// Replays a fixed list of page outcomes, then reports end of data
struct ScriptedSource {
    script: Mutex<VecDeque<Result<PageOutcome, ReportError>>>,
    offsets: Mutex<Vec<u64>>,
}

impl ScriptedSource {
    fn new(script: Vec<Result<PageOutcome, ReportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            offsets: Mutex::new(Vec::new()),
        })
    }

    fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSource for ScriptedSource {
    type Error = ReportError;

    async fn fetch_page(
        &self,
        _range: &DateRange,
        offset: u64,
        _limit: u32,
    ) -> Result<PageOutcome, ReportError> {
        self.offsets.lock().unwrap().push(offset);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PageOutcome::End))
    }
}

fn page(first_id: usize, count: usize) -> Result<PageOutcome, ReportError> {
    let records = (first_id..first_id + count)
        .map(|id| {
            CallRecord::try_from(json!({
                "id": id,
                "start_time": "2025-01-01 10:00:00",
                "talk_duration": 30,
                "employees": [{"employee_id": 1, "employee_full_name": "A", "is_talked": true, "is_answered": true}]
            }))
            .unwrap()
        })
        .collect();
    Ok(PageOutcome::from_records(records))
}

fn range() -> DateRange {
    DateRange::parse("2025-01-01 00:00:00", "2025-01-01 23:59:59").unwrap()
}

fn settings() -> LoadSettings {
    LoadSettings {
        table: "proj.analytics.calls".parse().unwrap(),
        schema: Some(TableSchema::calls_v1()),
        write_mode: WriteMode::Append,
        timezone: Tz::UTC,
    }
}

fn pipeline(
    source: Arc<ScriptedSource>,
    policy: PageErrorPolicy,
    loader: Option<MockLoader>,
) -> IngestPipeline<ScriptedSource> {
    let paginator = Paginator::new(source, 1000, Some(1000), policy);
    let normalizer = RecordNormalizer::new(ColumnSetMode::Static, Tz::UTC);
    let pipeline = IngestPipeline::new(paginator, normalizer, settings());

    match loader {
        Some(loader) => pipeline.with_loader(Box::new(loader)),
        None => pipeline,
    }
}

fn loader_expecting(rows: usize) -> MockLoader {
    let mut loader = MockLoader::new();
    loader.expect_backend().return_const("mock");
    loader
        .expect_append()
        .times(1)
        .withf(move |batch, target| {
            batch.len() == rows && target.table.to_string() == "proj.analytics.calls"
        })
        .returning(|batch, _| {
            Ok(LoadReport {
                rows_written: batch.len() as u64,
                rows_deleted: None,
                job_id: Some("job-1".to_string()),
            })
        });
    loader
}

fn loader_never_called() -> MockLoader {
    let mut loader = MockLoader::new();
    loader.expect_backend().return_const("mock");
    loader.expect_append().times(0);
    loader
}

#[tokio::test]
async fn test_two_full_pages_then_empty() {
    let source = ScriptedSource::new(vec![page(0, 1000), page(1000, 1000), page(0, 0)]);
    let pipeline = pipeline(source.clone(), PageErrorPolicy::Abort, Some(loader_expecting(2000)));

    let summary = pipeline.run(&range()).await.unwrap();

    assert_eq!(source.offsets(), vec![0, 1000, 2000]);
    assert_eq!(summary.outcome, RunOutcome::Loaded);
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.records_fetched, 2000);
    assert_eq!(summary.rows_loaded, 2000);
    assert_eq!(summary.job_id.as_deref(), Some("job-1"));
    assert!(summary.truncated.is_none());
}

#[tokio::test]
async fn test_empty_range_skips_loader() {
    let source = ScriptedSource::new(vec![page(0, 0)]);
    let pipeline = pipeline(source.clone(), PageErrorPolicy::Abort, Some(loader_never_called()));

    let summary = pipeline.run(&range()).await.unwrap();

    assert_eq!(source.offsets(), vec![0]);
    assert_eq!(summary.outcome, RunOutcome::NoData);
    assert_eq!(summary.rows_loaded, 0);
}

#[tokio::test]
async fn test_no_calls_after_end() {
    let source = ScriptedSource::new(vec![page(0, 5), page(0, 0), page(5, 5)]);
    let pipeline = pipeline(source.clone(), PageErrorPolicy::Abort, Some(loader_expecting(5)));

    let summary = pipeline.run(&range()).await.unwrap();

    assert_eq!(source.offsets(), vec![0, 1000]);
    assert_eq!(summary.records_fetched, 5);
}

#[tokio::test]
async fn test_page_error_aborts_without_upload() {
    let source = ScriptedSource::new(vec![
        page(0, 1000),
        Err(ReportError::Connection("connection reset".to_string())),
    ]);
    let pipeline = pipeline(source.clone(), PageErrorPolicy::Abort, Some(loader_never_called()));

    let err = pipeline.run(&range()).await.unwrap_err();

    assert!(matches!(err, AppError::Report { offset: 1000, .. }));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(source.offsets(), vec![0, 1000]);
}

#[tokio::test]
async fn test_page_error_keep_partial_loads_accumulated() {
    let source = ScriptedSource::new(vec![
        page(0, 1000),
        Err(ReportError::RpcError {
            code: -32001,
            message: "limit exceeded".to_string(),
        }),
    ]);
    let pipeline = pipeline(
        source,
        PageErrorPolicy::KeepPartial,
        Some(loader_expecting(1000)),
    );

    let summary = pipeline.run(&range()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Loaded);
    assert_eq!(summary.rows_loaded, 1000);
    assert!(summary.is_partial_load());
    let truncation = summary.truncated.unwrap();
    assert_eq!(truncation.offset, 1000);
    assert!(truncation.reason.contains("limit exceeded"));
}

#[tokio::test]
async fn test_keep_partial_first_page_error_is_not_no_data() {
    let source = ScriptedSource::new(vec![Err(ReportError::RpcError {
        code: -32001,
        message: "Invalid access token".to_string(),
    })]);
    let pipeline = pipeline(
        source.clone(),
        PageErrorPolicy::KeepPartial,
        Some(loader_never_called()),
    );

    let err = pipeline.run(&range()).await.unwrap_err();

    assert!(matches!(err, AppError::Report { offset: 0, .. }));
    assert!(err.is_fetch_error());
    assert_eq!(err.exit_code(), 1);
    assert_eq!(source.offsets(), vec![0]);
}

#[tokio::test]
async fn test_dry_run_skips_load() {
    let source = ScriptedSource::new(vec![page(0, 10)]);
    let pipeline = pipeline(source, PageErrorPolicy::Abort, None);

    assert!(pipeline.is_dry_run());
    let summary = pipeline.run(&range()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::DryRun);
    assert_eq!(summary.rows_normalized, 10);
    assert_eq!(summary.rows_loaded, 0);
}

#[tokio::test]
async fn test_load_failure_propagates() {
    let mut loader = MockLoader::new();
    loader.expect_backend().return_const("mock");
    loader
        .expect_append()
        .times(1)
        .returning(|_, _| Err(AppError::Warehouse("quota exceeded".to_string())));

    let source = ScriptedSource::new(vec![page(0, 3)]);
    let pipeline = pipeline(source, PageErrorPolicy::Abort, Some(loader));

    let err = pipeline.run(&range()).await.unwrap_err();
    assert!(matches!(err, AppError::Warehouse(_)));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_batch_carries_flattened_employees() {
    let mut loader = MockLoader::new();
    loader.expect_backend().return_const("mock");
    loader
        .expect_append()
        .times(1)
        .withf(|batch, target| {
            batch.column_index("employees").is_none()
                && batch.cell(0, "employee_full_name").and_then(|c| c.as_text()).as_deref() == Some("A")
                && batch.cell(0, "talk_duration").and_then(|c| c.as_i64()) == Some(30)
                && target.schema.as_ref().map(|s| s.version.as_str()) == Some("calls_v1")
        })
        .returning(|batch, _| {
            Ok(LoadReport {
                rows_written: batch.len() as u64,
                ..LoadReport::default()
            })
        });

    let source = ScriptedSource::new(vec![page(0, 2)]);
    let summary = pipeline(source, PageErrorPolicy::Abort, Some(loader))
        .run(&range())
        .await
        .unwrap();

    assert_eq!(summary.rows_loaded, 2);
}

proptest! {
    #[test]
    fn prop_paginator_preserves_every_record(sizes in prop::collection::vec(1usize..50, 0..8)) {
        let limit = 50u32;
        let mut script = Vec::new();
        let mut next_id = 0;
        for size in &sizes {
            script.push(page(next_id, *size));
            next_id += size;
        }

        let source = ScriptedSource::new(script);
        let paginator = Paginator::new(source.clone(), limit, None, PageErrorPolicy::Abort);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let fetched = runtime.block_on(paginator.fetch_all(&range())).unwrap();

        let total: usize = sizes.iter().sum();
        prop_assert_eq!(fetched.len(), total);
        prop_assert_eq!(fetched.pages as usize, sizes.len());
        prop_assert_eq!(fetched.calls as usize, sizes.len() + 1);

        let expected_offsets: Vec<u64> = (0..=sizes.len() as u64).map(|k| k * u64::from(limit)).collect();
        prop_assert_eq!(source.offsets(), expected_offsets);

        let ids: Vec<String> = fetched.records.iter().filter_map(|r| r.id()).collect();
        let expected_ids: Vec<String> = (0..total).map(|i| i.to_string()).collect();
        prop_assert_eq!(ids, expected_ids);
    }
}
