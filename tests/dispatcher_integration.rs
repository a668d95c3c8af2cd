//! End-to-end tests: typed operations through a real dispatcher, pool and
//! runtime.
//!
//! Run with: `cargo test --test dispatcher_integration`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use gridpool::config::Config;
use gridpool::wire::{
    AggregateOp, AggregatePayload, AggregationSpec, ExportOptions, ExportPayload,
    FilterCondition, FilterOperator, FilterPayload, OperationPayload, OperationTag, ParsePayload,
    Priority, RuleKind, SortKey, SortPayload, StatisticsPayload, TransformOp, TransformPayload,
    Transformation, ValidatePayload, ValidationRule,
};
use gridpool::{SubmitOptions, TabularOperations, TaskDispatcher};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> Config {
    let mut config = Config::default();
    config.pool.min_workers = 1;
    config.pool.max_workers = 2;
    config.dispatcher.default_timeout = TEST_TIMEOUT;
    config
}

async fn parsed(ops: &TaskDispatcher, rows: Vec<Value>) -> gridpool::table::TabularResult {
    ops.parse(ParsePayload {
        rows,
        ..ParsePayload::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn pipeline_parse_filter_sort_export() {
    let ops = TaskDispatcher::init(config()).unwrap();
    let table = parsed(
        &ops,
        vec![
            json!({"name": "carol", "score": 71}),
            json!({"name": "alice", "score": 93}),
            json!({"name": "bob", "score": 42}),
        ],
    )
    .await;
    assert_eq!(table.row_count(), 3);

    let filtered = ops
        .filter(FilterPayload {
            data: table,
            conditions: vec![FilterCondition::new(
                "score",
                FilterOperator::GreaterThanOrEqual,
                json!(50),
            )],
        })
        .await
        .unwrap();
    assert_eq!(filtered.row_count(), 2);

    let sorted = ops
        .sort(SortPayload {
            data: filtered,
            keys: vec![SortKey::desc("score")],
        })
        .await
        .unwrap();
    let names: Vec<_> = sorted.rows.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("alice"), json!("carol")]);

    let export = ops
        .export_csv(ExportPayload {
            data: sorted,
            options: ExportOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(export.row_count, 2);
    assert_eq!(export.mime_type, "text/csv");
    let content = export.content.unwrap();
    assert!(content.starts_with("name,score\n"));
    assert!(content.contains("alice,93\n"));

    ops.shutdown().await;
}

#[tokio::test]
async fn csv_export_quotes_special_fields() {
    let ops = TaskDispatcher::init(config()).unwrap();
    let table = parsed(&ops, vec![json!({"note": "a,\"b\""})]).await;

    let export = ops
        .export_csv(ExportPayload {
            data: table,
            options: ExportOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(export.content.unwrap(), "note\n\"a,\"\"b\"\"\"\n");

    ops.shutdown().await;
}

#[tokio::test]
async fn aggregate_without_groups_yields_one_row() {
    let ops = TaskDispatcher::init(config()).unwrap();
    let table = parsed(
        &ops,
        vec![json!({"v": 1}), json!({"v": 1}), json!({"v": 2})],
    )
    .await;

    let result = ops
        .aggregate(AggregatePayload {
            data: table,
            group_by: Vec::new(),
            aggregations: vec![
                AggregationSpec::count(),
                AggregationSpec::of(AggregateOp::CountDistinct, "v"),
            ],
            having: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["count"], json!(3));
    assert_eq!(result.rows[0]["count_distinct_v"], json!(2));

    ops.shutdown().await;
}

#[tokio::test]
async fn validate_statistics_and_transform() {
    let ops = TaskDispatcher::init(config()).unwrap();
    let table = parsed(
        &ops,
        vec![
            json!({"email": "ada@example.com", "city": " paris "}),
            json!({"email": "not-an-email", "city": "oslo"}),
        ],
    )
    .await;

    let report = ops
        .validate(ValidatePayload {
            data: table.clone(),
            rules: vec![ValidationRule::new("email", RuleKind::Email)],
            max_errors: None,
        })
        .await
        .unwrap();
    assert!(!report.valid);
    assert_eq!(report.error_count, 1);
    assert_eq!(report.errors[0].row, 1);

    let stats = ops
        .statistics(StatisticsPayload {
            data: table.clone(),
            columns: Some(vec!["city".into()]),
        })
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].unique, 2);

    let transformed = ops
        .transform(TransformPayload {
            data: table,
            transformations: vec![
                Transformation::new("city", TransformOp::Trim),
                Transformation::new("city", TransformOp::Uppercase),
            ],
        })
        .await
        .unwrap();
    assert_eq!(transformed.rows[0]["city"], json!("PARIS"));

    ops.shutdown().await;
}

#[tokio::test]
async fn operation_errors_keep_their_code() {
    let ops = TaskDispatcher::init(config()).unwrap();
    let table = parsed(&ops, vec![json!({"v": 1})]).await;

    let err = ops
        .sort(SortPayload {
            data: table,
            keys: vec![SortKey::asc("missing")],
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "COLUMN_NOT_FOUND");

    ops.shutdown().await;
}

#[tokio::test]
async fn progress_reaches_the_callback() {
    let ops = TaskDispatcher::init(config()).unwrap();
    let rows = (0..50).map(|i| json!({"i": i})).collect();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);

    let output = tokio::time::timeout(
        TEST_TIMEOUT,
        ops.run(
            OperationPayload::Parse(ParsePayload {
                rows,
                ..ParsePayload::default()
            }),
            Priority::High,
            SubmitOptions::default().on_progress(move |update| {
                assert!(update.current <= update.total);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ),
    )
    .await
    .expect("parse timed out")
    .unwrap();

    assert_eq!(output.kind(), "table");
    assert!(seen.load(Ordering::SeqCst) >= 1);

    ops.shutdown().await;
}

#[tokio::test]
async fn large_inputs_use_the_shared_buffer() {
    let mut config = config();
    config.dispatcher.shared_buffer_threshold = 100;
    let ops = TaskDispatcher::init(config).unwrap();

    let rows = (0..500)
        .map(|i| json!({"id": i, "label": format!("row-{i}")}))
        .collect();
    let table = parsed(&ops, rows).await;

    let filtered = ops
        .filter(FilterPayload {
            data: table,
            conditions: vec![FilterCondition::new(
                "id",
                FilterOperator::LessThan,
                json!(10),
            )],
        })
        .await
        .unwrap();
    assert_eq!(filtered.row_count(), 10);
    assert_eq!(filtered.rows[9]["label"], json!("row-9"));

    ops.shutdown().await;
}

#[tokio::test]
async fn every_settlement_is_recorded() {
    let ops = TaskDispatcher::init(config()).unwrap();
    let table = parsed(&ops, vec![json!({"v": 1})]).await;
    let _ = ops
        .sort(SortPayload {
            data: table,
            keys: vec![SortKey::asc("nope")],
        })
        .await;

    let report = ops.monitor().generate_report();
    assert_eq!(report.total_operations, 2);
    assert_eq!(report.failed_operations, 1);
    assert!(report.by_operation.contains_key(&OperationTag::Parse));
    assert!(report.by_operation.contains_key(&OperationTag::Sort));

    ops.shutdown().await;
}
