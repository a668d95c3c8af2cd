//! Performance monitor: a bounded ring of per-task metric snapshots and the
//! reports derived from it.
//!
//! Percentiles use the nearest-rank method on the sorted sample.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::MonitorConfig;
use crate::error::Error;
use crate::runtime::ops::escape_csv_field;
use crate::wire::{OperationTag, TaskId};
use crate::worker::TaskStatus;

/// One settled task, as recorded by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub task_id: TaskId,
    pub operation_tag: OperationTag,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    /// Time spent inside the unit, or wall clock when the unit never reported.
    pub execution_time_ms: u64,
    /// Dispatch to settlement, queueing included.
    pub total_time_ms: u64,
    pub memory_used: u64,
    pub queue_length: usize,
    pub active_units: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl OperationMetrics {
    pub fn is_error(&self) -> bool {
        self.status != TaskStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingSummary {
    pub average_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationBreakdown {
    pub count: usize,
    pub average_ms: f64,
    pub error_rate: f64,
}

/// One time bucket of the report series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub operations: usize,
    pub average_execution_ms: f64,
    pub average_memory: f64,
    pub average_queue_length: f64,
    pub average_active_units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub total_operations: usize,
    pub failed_operations: usize,
    pub error_rate: f64,
    pub execution_time: TimingSummary,
    /// Operations per second over the covered wall-clock span.
    pub throughput: f64,
    pub peak_memory: u64,
    pub average_memory: f64,
    pub by_operation: BTreeMap<OperationTag, OperationBreakdown>,
    pub series: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsFormat {
    Json,
    Csv,
}

#[derive(Serialize)]
struct MetricsExport<'a> {
    report: &'a PerformanceReport,
    snapshots: &'a [OperationMetrics],
}

const CSV_HEADER: &str = "task_id,operation_tag,status,timestamp,execution_time_ms,total_time_ms,memory_used,queue_length,active_units,error_code";

/// Thread-safe recorder of operation metrics.
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    snapshots: Mutex<VecDeque<OperationMetrics>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::with_capacity(config.max_snapshots.min(4096))),
            config,
        }
    }

    /// Append a snapshot, evicting the oldest once the ring is full.
    pub fn record_metrics(&self, metrics: OperationMetrics) {
        let mut snapshots = self.snapshots.lock();
        while snapshots.len() >= self.config.max_snapshots.max(1) {
            snapshots.pop_front();
        }
        snapshots.push_back(metrics);
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }

    pub fn snapshots(&self) -> Vec<OperationMetrics> {
        self.snapshots.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.snapshots.lock().clear();
    }

    /// Report over every retained snapshot.
    pub fn generate_report(&self) -> PerformanceReport {
        let snapshots = self.snapshots();
        build_report(&snapshots, self.config.bucket_width)
    }

    /// Report over the trailing `realtime_window`.
    pub fn realtime_metrics(&self) -> PerformanceReport {
        let window = chrono::Duration::from_std(self.config.realtime_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let since = Utc::now() - window;
        let recent: Vec<OperationMetrics> = self
            .snapshots
            .lock()
            .iter()
            .filter(|m| m.timestamp >= since)
            .cloned()
            .collect();
        build_report(&recent, self.config.bucket_width)
    }

    pub fn export_metrics(&self, format: MetricsFormat) -> Result<String, Error> {
        let snapshots = self.snapshots();
        match format {
            MetricsFormat::Json => {
                let report = build_report(&snapshots, self.config.bucket_width);
                let export = MetricsExport {
                    report: &report,
                    snapshots: &snapshots,
                };
                Ok(serde_json::to_string_pretty(&export)?)
            }
            MetricsFormat::Csv => {
                let mut out = String::from(CSV_HEADER);
                out.push('\n');
                for m in &snapshots {
                    let error = m
                        .error_code
                        .as_deref()
                        .map(|c| escape_csv_field(c, ',', '"', None))
                        .unwrap_or_default();
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{},{},{},{}\n",
                        m.task_id,
                        m.operation_tag,
                        m.status,
                        m.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                        m.execution_time_ms,
                        m.total_time_ms,
                        m.memory_used,
                        m.queue_length,
                        m.active_units,
                        error,
                    ));
                }
                Ok(out)
            }
        }
    }
}

/// Nearest-rank percentile of an ascending sample.
fn nearest_rank(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

fn build_report(snapshots: &[OperationMetrics], bucket_width: Duration) -> PerformanceReport {
    let total = snapshots.len();
    let failed = snapshots.iter().filter(|m| m.is_error()).count();
    let rate = |errors: usize, count: usize| {
        if count == 0 { 0.0 } else { errors as f64 / count as f64 }
    };

    let mut times: Vec<f64> = snapshots
        .iter()
        .map(|m| m.execution_time_ms as f64)
        .collect();
    times.sort_by(f64::total_cmp);
    let execution_time = TimingSummary {
        average_ms: mean(times.iter().copied()),
        median_ms: nearest_rank(&times, 50.0),
        p95_ms: nearest_rank(&times, 95.0),
        p99_ms: nearest_rank(&times, 99.0),
        min_ms: times.first().copied().unwrap_or(0.0),
        max_ms: times.last().copied().unwrap_or(0.0),
    };

    let window_start = snapshots.iter().map(|m| m.timestamp).min();
    let window_end = snapshots.iter().map(|m| m.timestamp).max();
    let throughput = match (window_start, window_end) {
        (Some(start), Some(end)) => {
            let span = (end - start).to_std().unwrap_or_default();
            total as f64 / span.max(Duration::from_secs(1)).as_secs_f64()
        }
        _ => 0.0,
    };

    let mut by_operation: BTreeMap<OperationTag, (usize, f64, usize)> = BTreeMap::new();
    for m in snapshots {
        let entry = by_operation.entry(m.operation_tag).or_default();
        entry.0 += 1;
        entry.1 += m.execution_time_ms as f64;
        entry.2 += usize::from(m.is_error());
    }

    PerformanceReport {
        generated_at: Utc::now(),
        window_start,
        window_end,
        total_operations: total,
        failed_operations: failed,
        error_rate: rate(failed, total),
        execution_time,
        throughput,
        peak_memory: snapshots.iter().map(|m| m.memory_used).max().unwrap_or(0),
        average_memory: mean(snapshots.iter().map(|m| m.memory_used as f64)),
        by_operation: by_operation
            .into_iter()
            .map(|(tag, (count, sum, errors))| {
                let breakdown = OperationBreakdown {
                    count,
                    average_ms: sum / count as f64,
                    error_rate: rate(errors, count),
                };
                (tag, breakdown)
            })
            .collect(),
        series: window_start
            .map(|start| series(snapshots, start, bucket_width))
            .unwrap_or_default(),
    }
}

fn series(
    snapshots: &[OperationMetrics],
    start: DateTime<Utc>,
    bucket_width: Duration,
) -> Vec<SeriesPoint> {
    let width_ms = (bucket_width.as_millis() as i64).max(1);
    let mut buckets: BTreeMap<i64, Vec<&OperationMetrics>> = BTreeMap::new();
    for m in snapshots {
        let offset = (m.timestamp - start).num_milliseconds().max(0);
        buckets.entry(offset / width_ms).or_default().push(m);
    }

    buckets
        .into_iter()
        .map(|(index, members)| SeriesPoint {
            bucket_start: start + chrono::Duration::milliseconds(index * width_ms),
            operations: members.len(),
            average_execution_ms: mean(members.iter().map(|m| m.execution_time_ms as f64)),
            average_memory: mean(members.iter().map(|m| m.memory_used as f64)),
            average_queue_length: mean(members.iter().map(|m| m.queue_length as f64)),
            average_active_units: mean(members.iter().map(|m| m.active_units as f64)),
        })
        .collect()
}
