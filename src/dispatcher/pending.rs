//! The pending table: one entry per dispatched task until it settles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, oneshot};

use crate::error::TaskError;
use crate::monitor::{OperationMetrics, PerformanceMonitor};
use crate::wire::{OperationOutput, OperationTag, ProgressUpdate, TaskId};
use crate::worker::{SettleMetrics, TaskOutcome, TaskStatus};

/// Invoked for every progress update of a task.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

pub(crate) struct PendingEntry {
    pub settle: oneshot::Sender<TaskOutcome>,
    pub on_progress: Option<ProgressCallback>,
    pub tag: OperationTag,
    pub dispatched_at: Instant,
}

pub(crate) type PendingTable = Arc<Mutex<HashMap<TaskId, PendingEntry>>>;

/// Where settlements get recorded, if anywhere.
#[derive(Clone)]
pub(crate) struct Recorder {
    pub monitor: Option<Arc<PerformanceMonitor>>,
}

impl Recorder {
    pub fn record(
        &self,
        id: TaskId,
        tag: OperationTag,
        dispatched_at: Instant,
        outcome: Result<(), &TaskError>,
        metrics: Option<&SettleMetrics>,
    ) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let total_time_ms = dispatched_at.elapsed().as_millis() as u64;
        let status = match (outcome, metrics) {
            (Err(TaskError::Timeout { .. }), _) => TaskStatus::Timeout,
            (Err(TaskError::Cancelled { .. }), _) => TaskStatus::Cancelled,
            (_, Some(m)) => m.status,
            (Ok(()), None) => TaskStatus::Completed,
            (Err(_), None) => TaskStatus::Failed,
        };
        monitor.record_metrics(OperationMetrics {
            task_id: id,
            operation_tag: tag,
            status,
            timestamp: Utc::now(),
            execution_time_ms: metrics
                .and_then(|m| m.execution_time_ms)
                .unwrap_or(total_time_ms),
            total_time_ms,
            memory_used: metrics.and_then(|m| m.memory).map(|m| m.used).unwrap_or(0),
            queue_length: metrics.map(|m| m.queue_length).unwrap_or(0),
            active_units: metrics.map(|m| m.active_units).unwrap_or(0),
            error_code: outcome.err().map(|e| e.code().to_string()),
        });
    }
}

/// A dispatched task. Await [`PendingTask::wait`] for its outcome.
pub struct PendingTask {
    pub(crate) id: TaskId,
    pub(crate) tag: OperationTag,
    pub(crate) timeout: Duration,
    pub(crate) deadline: tokio::time::Instant,
    pub(crate) dispatched_at: Instant,
    pub(crate) rx: oneshot::Receiver<TaskOutcome>,
    pub(crate) pending: PendingTable,
    pub(crate) recorder: Recorder,
}

impl std::fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTask")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PendingTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn tag(&self) -> OperationTag {
        self.tag
    }

    /// Wait for settlement or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Result<OperationOutput, TaskError> {
        let id = self.id;
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TaskError::Shutdown { id }),
            Err(_) => {
                let entry = self.pending.lock().await.remove(&id);
                if entry.is_none() {
                    // The router claimed the entry first; its send is imminent.
                    return self.rx.await.unwrap_or(Err(TaskError::Shutdown { id }));
                }
                let err = TaskError::Timeout {
                    id,
                    timeout: self.timeout,
                };
                tracing::warn!(task_id = %id, operation = %self.tag, timeout = ?self.timeout, "Task timed out");
                self.recorder
                    .record(id, self.tag, self.dispatched_at, Err(&err), None);
                Err(err)
            }
        }
    }
}
