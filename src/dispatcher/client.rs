//! The task dispatcher: the future-based front door to the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::pending::{PendingEntry, PendingTable, PendingTask, ProgressCallback, Recorder};
use crate::buffer::{BufferOptions, Overflow, SharedBufferManager, transfers_exactly};
use crate::config::{Config, DispatcherConfig};
use crate::error::{Error, TaskError};
use crate::monitor::PerformanceMonitor;
use crate::runtime::{OperationExecutor, Runtime};
use crate::wire::{OperationOutput, OperationPayload, Priority, ProgressUpdate, TaskId, UnitMessage};
use crate::worker::{PoolEvent, PoolHandle, PoolStats, WorkerPool};

/// Per-submission knobs.
#[derive(Clone, Default)]
pub struct SubmitOptions {
    /// Overrides the dispatcher's default timeout.
    pub timeout: Option<Duration>,
    pub on_progress: Option<ProgressCallback>,
}

impl SubmitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("timeout", &self.timeout)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Owns a worker pool and routes its events back to waiting callers.
pub struct TaskDispatcher {
    config: DispatcherConfig,
    pool: PoolHandle,
    pending: PendingTable,
    monitor: Arc<PerformanceMonitor>,
    recorder: Recorder,
    buffers: SharedBufferManager,
    router: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TaskDispatcher {
    /// Start a pool running the tabular [`Runtime`].
    pub fn init(config: Config) -> Result<Self, Error> {
        Self::with_executor(config, Arc::new(Runtime::new()))
    }

    /// Start a pool running `executor`. Must be called inside a tokio runtime.
    pub fn with_executor(
        config: Config,
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (pool, events) =
            WorkerPool::start(config.pool.clone(), config.runtime.unit_settings(), executor)?;

        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let recorder = Recorder {
            monitor: config
                .dispatcher
                .record_metrics
                .then(|| Arc::clone(&monitor)),
        };
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let router = tokio::spawn(route(events, Arc::clone(&pending), recorder.clone()));

        // Fast-path buffers must never lose data.
        let buffers = SharedBufferManager::new(BufferOptions {
            overflow: Overflow::Error,
            ..config.buffer.clone()
        });

        Ok(Self {
            config: config.dispatcher,
            pool,
            pending,
            monitor,
            recorder,
            buffers,
            router: parking_lot::Mutex::new(Some(router)),
        })
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub async fn pool_stats(&self) -> Result<PoolStats, TaskError> {
        self.pool
            .stats()
            .await
            .map_err(|e| TaskError::from_pool(TaskId::new(), e))
    }

    /// Tasks dispatched and not yet settled.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Admit a task and return a handle to its outcome.
    pub async fn dispatch(
        &self,
        payload: OperationPayload,
        priority: Priority,
        options: SubmitOptions,
    ) -> Result<PendingTask, TaskError> {
        let id = TaskId::new();
        let tag = payload.tag();
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let mut message = UnitMessage::new(id, payload, priority);
        self.attach_buffer(&mut message);

        let (tx, rx) = oneshot::channel();
        let dispatched_at = Instant::now();
        self.pending.lock().await.insert(
            id,
            PendingEntry {
                settle: tx,
                on_progress: options.on_progress,
                tag,
                dispatched_at,
            },
        );

        if let Err(e) = self.pool.enqueue(message).await {
            self.pending.lock().await.remove(&id);
            tracing::warn!(task_id = %id, error = %e, "Task rejected by pool");
            return Err(TaskError::from_pool(id, e));
        }
        tracing::debug!(task_id = %id, operation = %tag, priority = %priority, "Task dispatched");

        Ok(PendingTask {
            id,
            tag,
            timeout,
            deadline: tokio::time::Instant::from_std(dispatched_at) + timeout,
            dispatched_at,
            rx,
            pending: Arc::clone(&self.pending),
            recorder: self.recorder.clone(),
        })
    }

    /// Dispatch and wait.
    pub async fn submit(
        &self,
        payload: OperationPayload,
        priority: Priority,
        options: SubmitOptions,
    ) -> Result<OperationOutput, TaskError> {
        self.dispatch(payload, priority, options).await?.wait().await
    }

    /// Cancel a task. Its future rejects with `CANCELLED` right away; a
    /// response that arrives later is dropped.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let known = self.pool.cancel(id).await.unwrap_or(false);
        let Some(entry) = self.pending.lock().await.remove(&id) else {
            return known;
        };
        let err = TaskError::Cancelled { id };
        self.recorder
            .record(id, entry.tag, entry.dispatched_at, Err(&err), None);
        let _ = entry.settle.send(Err(err));
        true
    }

    /// Shut the pool down; every outstanding future rejects with `SHUTDOWN`.
    pub async fn shutdown(&self) {
        if let Err(e) = self.pool.shutdown().await {
            tracing::debug!(error = %e, "Pool already shut down");
        }
        let router = self.router.lock().take();
        if let Some(router) = router {
            if let Err(e) = router.await {
                tracing::warn!(error = %e, "Response router failed");
            }
        }
    }

    /// Move a large input table into a shared buffer. Falls back to inline
    /// rows on any failure.
    fn attach_buffer(&self, message: &mut UnitMessage) {
        let threshold = self.config.shared_buffer_threshold;
        if threshold == 0 {
            return;
        }
        let Some(table) = message.payload.input_table_mut() else {
            return;
        };
        if table.rows.len() < threshold {
            return;
        }
        if !transfers_exactly(table) {
            tracing::debug!(task_id = %message.id, "Input cells would not survive the shared buffer, sending rows inline");
            return;
        }

        let buffer = match self.buffers.create_buffer(table.rows.len(), &table.columns) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::debug!(task_id = %message.id, error = %e, "Shared buffer unavailable, sending rows inline");
                return;
            }
        };
        match buffer.write_data(table) {
            Ok(report) => {
                table.rows = Vec::new();
                message.transferable = Some(buffer);
                tracing::debug!(task_id = %message.id, rows = report.rows_written, "Input moved to shared buffer");
            }
            Err(e) => {
                buffer.destroy();
                tracing::debug!(task_id = %message.id, error = %e, "Shared buffer write failed, sending rows inline");
            }
        }
    }
}

/// Route pool events to pending entries until the pool goes away.
async fn route(
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
    pending: PendingTable,
    recorder: Recorder,
) {
    while let Some(event) = events.recv().await {
        match event {
            PoolEvent::Progress(update) => {
                let callback = pending
                    .lock()
                    .await
                    .get(&update.id)
                    .and_then(|entry| entry.on_progress.clone());
                if let Some(callback) = callback {
                    callback(&update);
                }
            }
            PoolEvent::Settled {
                id,
                outcome,
                metrics,
            } => {
                let entry = pending.lock().await.remove(&id);
                let Some(entry) = entry else {
                    if matches!(outcome, Err(TaskError::Cancelled { .. })) {
                        tracing::debug!(task_id = %id, "Late cancellation ignored");
                    } else {
                        tracing::warn!(task_id = %id, status = %metrics.status, "Late response ignored");
                    }
                    continue;
                };
                recorder.record(
                    id,
                    entry.tag,
                    entry.dispatched_at,
                    outcome.as_ref().map(|_| ()),
                    Some(&metrics),
                );
                let _ = entry.settle.send(outcome);
            }
        }
    }

    let orphaned: Vec<_> = pending.lock().await.drain().collect();
    for (id, entry) in orphaned {
        let _ = entry.settle.send(Err(TaskError::Shutdown { id }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ColumnDef, ColumnType, TabularResult};
    use crate::wire::{FilterCondition, FilterOperator, FilterPayload};
    use serde_json::json;

    fn config() -> Config {
        let mut config = Config::default();
        config.pool.min_workers = 1;
        config.pool.max_workers = 2;
        config.dispatcher.shared_buffer_threshold = 4;
        config
    }

    fn filter_payload(rows: i64) -> OperationPayload {
        let data = TabularResult::new(
            vec![
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("name", ColumnType::String),
            ],
            (0..rows)
                .filter_map(|i| json!({"id": i, "name": format!("row {i}")}).as_object().cloned())
                .collect(),
        );
        OperationPayload::Filter(FilterPayload {
            data,
            conditions: vec![FilterCondition::new(
                "id",
                FilterOperator::LessThan,
                json!(3),
            )],
        })
    }

    #[tokio::test]
    async fn large_inputs_travel_through_shared_buffer() {
        let dispatcher = TaskDispatcher::init(config()).unwrap();
        let mut message = UnitMessage::new(TaskId::new(), filter_payload(10), Priority::Normal);
        dispatcher.attach_buffer(&mut message);
        assert!(message.transferable.is_some());
        assert_eq!(message.payload.input_rows(), 0);

        let out = dispatcher
            .submit(filter_payload(10), Priority::Normal, SubmitOptions::default())
            .await
            .unwrap()
            .into_table()
            .unwrap();
        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.rows[2]["name"], "row 2");
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn small_inputs_stay_inline() {
        let dispatcher = TaskDispatcher::init(config()).unwrap();
        let mut message = UnitMessage::new(TaskId::new(), filter_payload(2), Priority::Normal);
        dispatcher.attach_buffer(&mut message);
        assert!(message.transferable.is_none());
        assert_eq!(message.payload.input_rows(), 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn mistyped_columns_fall_back_to_inline() {
        let dispatcher = TaskDispatcher::init(config()).unwrap();
        let data = TabularResult::new(
            vec![ColumnDef::new("id", ColumnType::Integer)],
            (0..5)
                .filter_map(|_| json!({"id": "not a number"}).as_object().cloned())
                .collect(),
        );
        let mut message = UnitMessage::new(
            TaskId::new(),
            OperationPayload::Filter(FilterPayload {
                data,
                conditions: vec![],
            }),
            Priority::Normal,
        );
        dispatcher.attach_buffer(&mut message);
        assert!(message.transferable.is_none());
        assert_eq!(message.payload.input_rows(), 5);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn buffered_and_inline_results_match() {
        let data = TabularResult::new(
            vec![
                ColumnDef::new("amount", ColumnType::Float),
                ColumnDef::new("at", ColumnType::Datetime),
            ],
            [
                json!({"amount": 1, "at": "2024-01-15T10:30:00+02:00"}),
                json!({"amount": 2.5, "at": "2024-01-15T08:30:00.000Z"}),
                json!({"amount": 3, "at": "2024-02-01"}),
                json!({"amount": 4.25, "at": null}),
            ]
            .iter()
            .filter_map(|row| row.as_object().cloned())
            .collect(),
        );
        let payload = || {
            OperationPayload::Filter(FilterPayload {
                data: data.clone(),
                conditions: vec![],
            })
        };

        let mut results = Vec::new();
        for threshold in [0, 4] {
            let mut cfg = config();
            cfg.dispatcher.shared_buffer_threshold = threshold;
            let dispatcher = TaskDispatcher::init(cfg).unwrap();

            let mut message = UnitMessage::new(TaskId::new(), payload(), Priority::Normal);
            dispatcher.attach_buffer(&mut message);
            assert!(message.transferable.is_none());

            let out = dispatcher
                .submit(payload(), Priority::Normal, SubmitOptions::default())
                .await
                .unwrap()
                .into_table()
                .unwrap();
            results.push(out.rows);
            dispatcher.shutdown().await;
        }
        assert_eq!(results[0], data.rows);
        assert_eq!(results[1], data.rows);
    }

    #[tokio::test]
    async fn settlements_are_recorded() {
        let dispatcher = TaskDispatcher::init(config()).unwrap();
        dispatcher
            .submit(filter_payload(2), Priority::High, SubmitOptions::default())
            .await
            .unwrap();
        let snapshots = dispatcher.monitor().snapshots();
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].is_error());
        assert_eq!(dispatcher.pending_count().await, 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.pool.min_workers = 3;
        cfg.pool.max_workers = 1;
        assert!(matches!(
            TaskDispatcher::init(cfg),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_rejects_later_submissions() {
        let dispatcher = TaskDispatcher::init(config()).unwrap();
        dispatcher.shutdown().await;
        let err = dispatcher
            .submit(filter_payload(1), Priority::Normal, SubmitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SHUTDOWN");
    }
}
