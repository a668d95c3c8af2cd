//! gridpool demo driver.
//!
//! Usage: `gridpool [rows.json]`
//!
//! Pushes a table through parse, validate, transform, filter, sort,
//! aggregate, statistics and CSV export on the worker pool, then prints the
//! performance report. Without an argument a synthetic sales table is used.

use std::path::Path;

use anyhow::{Context, bail};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};

use gridpool::config::LogConfig;
use gridpool::monitor::MetricsFormat;
use gridpool::wire::{
    AggregateOp, AggregatePayload, AggregationSpec, ExportOptions, ExportPayload,
    FilterCondition, FilterOperator, FilterPayload, ParsePayload, RuleKind, SortKey, SortPayload,
    StatisticsPayload, TransformOp, TransformPayload, Transformation, ValidatePayload,
    ValidationRule,
};
use gridpool::{Config, TabularOperations, TaskDispatcher, logging};

const SYNTHETIC_ROWS: usize = 25_000;
const REGIONS: [&str; 4] = ["north", "south", "east", "west"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init(&LogConfig::from_env())?;

    let config = Config::from_env();
    let rows = match std::env::args().nth(1) {
        Some(path) => load_rows(Path::new(&path))?,
        None => synthetic_rows(SYNTHETIC_ROWS),
    };

    eprintln!("gridpool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Workers: {}..{}",
        config.pool.min_workers, config.pool.max_workers
    );
    eprintln!("   Rows: {}\n", rows.len());

    let dispatcher = TaskDispatcher::init(config)?;
    let result = run_pipeline(&dispatcher, rows).await;

    match dispatcher.monitor().export_metrics(MetricsFormat::Json) {
        Ok(report) => println!("{report}"),
        Err(e) => tracing::warn!(error = %e, "Failed to export metrics"),
    }
    dispatcher.shutdown().await;
    result
}

async fn run_pipeline<O: TabularOperations>(ops: &O, rows: Vec<Value>) -> anyhow::Result<()> {
    let table = ops
        .parse(ParsePayload {
            rows,
            ..ParsePayload::default()
        })
        .await
        .context("parse")?;
    tracing::info!(rows = table.row_count(), columns = table.columns.len(), "Parsed input");

    if table.has_column("amount") {
        let report = ops
            .validate(ValidatePayload {
                data: table.clone(),
                rules: vec![
                    ValidationRule::new("amount", RuleKind::Required),
                    ValidationRule::new("amount", RuleKind::MinValue { value: 0.0 }),
                ],
                max_errors: Some(100),
            })
            .await
            .context("validate")?;
        tracing::info!(valid = report.valid, issues = report.errors.len(), "Validated input");
    }

    let table = if table.has_column("region") {
        ops.transform(TransformPayload {
            data: table,
            transformations: vec![
                Transformation::new("region", TransformOp::Trim),
                Transformation::new("region", TransformOp::Uppercase),
            ],
        })
        .await
        .context("transform")?
    } else {
        table
    };

    let table = if table.has_column("amount") {
        ops.filter(FilterPayload {
            data: table,
            conditions: vec![FilterCondition::new(
                "amount",
                FilterOperator::GreaterThanOrEqual,
                json!(100),
            )],
        })
        .await
        .context("filter")?
    } else {
        table
    };
    tracing::info!(rows = table.row_count(), "Filtered");

    let Some(first) = table.columns.first().map(|c| c.name.clone()) else {
        bail!("input has no columns");
    };
    let table = ops
        .sort(SortPayload {
            data: table,
            keys: vec![SortKey::asc(&first)],
        })
        .await
        .context("sort")?;

    if table.has_column("region") && table.has_column("amount") {
        let summary = ops
            .aggregate(AggregatePayload {
                data: table.clone(),
                group_by: vec!["region".to_string()],
                aggregations: vec![
                    AggregationSpec::count(),
                    AggregationSpec::of(AggregateOp::Sum, "amount"),
                    AggregationSpec::of(AggregateOp::Avg, "amount"),
                    AggregationSpec::percentile("amount", 95.0).alias("p95_amount"),
                ],
                having: Vec::new(),
            })
            .await
            .context("aggregate")?;
        println!("{}", serde_json::to_string_pretty(&summary.rows)?);
    }

    let stats = ops
        .statistics(StatisticsPayload {
            data: table.clone(),
            columns: None,
        })
        .await
        .context("statistics")?;
    for column in &stats {
        tracing::info!(
            column = %column.column,
            count = column.count,
            unique = column.unique,
            nulls = column.nulls,
            "Column statistics"
        );
    }

    let export = ops
        .export_csv(ExportPayload {
            data: table,
            options: ExportOptions::default(),
        })
        .await
        .context("export")?;
    tracing::info!(
        rows = export.row_count,
        bytes = export.byte_size,
        mime = %export.mime_type,
        "Exported CSV"
    );

    Ok(())
}

/// Reads a JSON array of row objects.
fn load_rows(path: &Path) -> anyhow::Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    match value {
        Value::Array(rows) => Ok(rows),
        _ => bail!("{} must contain a JSON array of rows", path.display()),
    }
}

fn synthetic_rows(count: usize) -> Vec<Value> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let region = REGIONS.choose(&mut rng).copied().unwrap_or("north");
            let amount = if rng.gen_bool(0.02) {
                Value::Null
            } else {
                json!(rng.gen_range(0..5_000))
            };
            json!({
                "order_id": i + 1,
                "region": format!(" {region} "),
                "amount": amount,
                "rush": rng.gen_bool(0.1),
            })
        })
        .collect()
}
