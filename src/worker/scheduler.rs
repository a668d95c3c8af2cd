//! Worker pool: owns execution units, the task queue and scaling.
//!
//! The pool is an actor: one tokio task owns the queue, the running table
//! and the unit registry. [`PoolHandle`] talks to it over a request channel;
//! units report back over their own event channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::handle::{UnitHandle, UnitInfo};
use super::queue::TaskQueue;
use super::state::{TaskStatus, UnitStatus};
use super::task::Task;
use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::runtime::{self, OperationExecutor, UnitEvent, UnitSettings};
use crate::wire::{
    ErrorInfo, MemoryUsage, OperationOutput, OperationTag, ProgressUpdate, TaskId, UnitCommand,
    UnitId, UnitMessage, UnitResponse,
};

/// How a task ended, as seen by the caller.
pub type TaskOutcome = Result<OperationOutput, TaskError>;

/// Figures captured when a task settles.
#[derive(Debug, Clone, PartialEq)]
pub struct SettleMetrics {
    pub operation_tag: OperationTag,
    pub status: TaskStatus,
    pub unit: Option<UnitId>,
    pub execution_time_ms: Option<u64>,
    pub memory: Option<MemoryUsage>,
    pub queue_length: usize,
    pub active_units: usize,
}

/// Events the pool publishes to its owner.
#[derive(Debug)]
pub enum PoolEvent {
    Progress(ProgressUpdate),
    Settled {
        id: TaskId,
        outcome: TaskOutcome,
        metrics: SettleMetrics,
    },
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_units: usize,
    pub idle_units: usize,
    pub busy_units: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub spawned: u64,
    pub reaped: u64,
    pub units: Vec<UnitInfo>,
}

enum PoolRequest {
    Enqueue {
        message: Box<UnitMessage>,
        ack: oneshot::Sender<Result<(), PoolError>>,
    },
    Cancel {
        id: TaskId,
        ack: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable handle to a running pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    requests: mpsc::UnboundedSender<PoolRequest>,
}

impl PoolHandle {
    /// Admit a task. Fails synchronously when the queue is full.
    pub async fn enqueue(&self, message: UnitMessage) -> Result<(), PoolError> {
        let (ack, rx) = oneshot::channel();
        self.requests
            .send(PoolRequest::Enqueue {
                message: Box::new(message),
                ack,
            })
            .map_err(|_| PoolError::ShutDown)?;
        rx.await.map_err(|_| PoolError::ShutDown)?
    }

    /// Cancel a queued or running task. Returns whether the pool knew it.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, PoolError> {
        let (ack, rx) = oneshot::channel();
        self.requests
            .send(PoolRequest::Cancel { id, ack })
            .map_err(|_| PoolError::ShutDown)?;
        rx.await.map_err(|_| PoolError::ShutDown)
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(PoolRequest::Stats { reply })
            .map_err(|_| PoolError::ShutDown)?;
        rx.await.map_err(|_| PoolError::ShutDown)
    }

    /// Reject outstanding work, stop every unit and wait for the actor to exit.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let (done, rx) = oneshot::channel();
        self.requests
            .send(PoolRequest::Shutdown { done })
            .map_err(|_| PoolError::ShutDown)?;
        rx.await.map_err(|_| PoolError::ShutDown)
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    spawned: u64,
    reaped: u64,
}

/// The pool actor. Construct with [`WorkerPool::start`].
pub struct WorkerPool {
    config: PoolConfig,
    settings: UnitSettings,
    executor: Arc<dyn OperationExecutor>,
    units: BTreeMap<UnitId, UnitHandle>,
    queue: TaskQueue,
    running: HashMap<TaskId, Task>,
    events: mpsc::UnboundedSender<PoolEvent>,
    unit_events: mpsc::UnboundedSender<UnitEvent>,
    next_unit: u64,
    next_seq: u64,
    counters: Counters,
}

impl WorkerPool {
    /// Spawn `min_workers` units and the actor task. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: PoolConfig,
        settings: UnitSettings,
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<(PoolHandle, mpsc::UnboundedReceiver<PoolEvent>), PoolError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let mut pool = WorkerPool {
            config,
            settings,
            executor,
            units: BTreeMap::new(),
            queue: TaskQueue::new(),
            running: HashMap::new(),
            events: events_tx,
            unit_events: unit_tx,
            next_unit: 1,
            next_seq: 0,
            counters: Counters::default(),
        };
        for _ in 0..pool.config.min_workers {
            pool.spawn_unit()?;
        }

        tracing::info!(
            min_workers = pool.config.min_workers,
            max_workers = pool.config.max_workers,
            max_queue = pool.config.max_queue_size,
            "Worker pool started"
        );
        tokio::spawn(pool.run(request_rx, unit_rx));

        Ok((
            PoolHandle {
                requests: request_tx,
            },
            events_rx,
        ))
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<PoolRequest>,
        mut unit_events: mpsc::UnboundedReceiver<UnitEvent>,
    ) {
        let mut reaper = tokio::time::interval(self.config.reap_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reaper.tick().await;

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(PoolRequest::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    // Every handle dropped.
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = unit_events.recv() => self.handle_unit_event(event),
                _ = reaper.tick() => self.reap_idle(),
            }
        }

        tracing::info!("Worker pool stopped");
    }

    fn handle_request(&mut self, request: PoolRequest) {
        match request {
            PoolRequest::Enqueue { message, ack } => {
                let _ = ack.send(self.admit(*message));
            }
            PoolRequest::Cancel { id, ack } => {
                let _ = ack.send(self.cancel(id));
            }
            PoolRequest::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PoolRequest::Shutdown { .. } => {}
        }
    }

    // ── Admission & assignment ──────────────────────────────────────

    fn admit(&mut self, message: UnitMessage) -> Result<(), PoolError> {
        let id = message.id;
        if self.queue.contains(id) || self.running.contains_key(&id) {
            return Err(PoolError::DuplicateTask { id });
        }
        let must_wait =
            self.idle_unit().is_none() && self.units.len() >= self.config.max_workers;
        if must_wait && self.queue.len() >= self.config.max_queue_size {
            tracing::warn!(task_id = %id, queued = self.queue.len(), "Task queue full");
            return Err(PoolError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        let task = Task::new(message, self.next_seq, self.config.max_retries);
        self.next_seq += 1;
        tracing::debug!(
            task_id = %id,
            priority = %task.priority,
            operation = %task.tag,
            "Task admitted"
        );
        self.queue.push(task);
        self.dispatch_queued();
        Ok(())
    }

    fn idle_unit(&self) -> Option<UnitId> {
        self.units
            .values()
            .find(|u| u.status.is_available())
            .map(|u| u.id)
    }

    /// Hand queued tasks to idle units, scaling up while below the ceiling.
    fn dispatch_queued(&mut self) {
        while !self.queue.is_empty() {
            let unit_id = match self.idle_unit() {
                Some(id) => id,
                None if self.units.len() < self.config.max_workers => match self.spawn_unit() {
                    Ok(id) => {
                        tracing::info!(unit_id = %id, units = self.units.len(), "Scaled up");
                        id
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to scale up");
                        if self.units.is_empty() {
                            let reason = e.to_string();
                            self.reject_queued(|_| TaskError::WorkerInit {
                                reason: reason.clone(),
                            });
                        }
                        break;
                    }
                },
                None => break,
            };
            let Some(task) = self.queue.pop() else {
                break;
            };
            self.assign(unit_id, task);
        }
    }

    fn assign(&mut self, unit_id: UnitId, mut task: Task) {
        let Some(message) = task.take_message() else {
            let id = task.id;
            let _ = task.transition_to(TaskStatus::Failed, Some("message lost".into()));
            self.counters.failed += 1;
            self.settle(
                task,
                Err(TaskError::WorkerRuntime {
                    id,
                    reason: "task message was already consumed".into(),
                }),
                None,
                None,
            );
            return;
        };
        let Some(unit) = self.units.get_mut(&unit_id) else {
            task.restore_message(message);
            self.queue.push(task);
            return;
        };
        if let Err(e) = unit.assign(task.id) {
            tracing::warn!(unit_id = %unit_id, error = %e, "Unit not assignable");
            task.restore_message(message);
            self.queue.push(task);
            return;
        }

        match unit.send(UnitCommand::Execute(message)) {
            Ok(()) => {
                task.assigned_unit = Some(unit_id);
                if let Err(e) = task.transition_to(TaskStatus::Running, None) {
                    tracing::warn!(task_id = %task.id, error = %e, "Invalid task transition");
                }
                tracing::debug!(task_id = %task.id, unit_id = %unit_id, "Task assigned");
                self.running.insert(task.id, task);
            }
            Err(command) => {
                if let UnitCommand::Execute(message) = command {
                    task.restore_message(message);
                }
                self.queue.push(task);
                self.fail_unit(unit_id, "unit inbox disconnected".into());
            }
        }
    }

    fn spawn_unit(&mut self) -> Result<UnitId, PoolError> {
        let id = UnitId(self.next_unit);
        self.next_unit += 1;
        let channel = runtime::spawn_unit(
            id,
            Arc::clone(&self.executor),
            self.settings,
            self.unit_events.clone(),
        )
        .map_err(|e| PoolError::WorkerInit {
            reason: e.to_string(),
        })?;
        self.units.insert(id, UnitHandle::new(id, channel));
        self.counters.spawned += 1;
        tracing::debug!(unit_id = %id, "Spawned execution unit");
        Ok(id)
    }

    // ── Unit events ─────────────────────────────────────────────────

    fn handle_unit_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Progress { update, .. } => {
                let _ = self.events.send(PoolEvent::Progress(update));
            }
            UnitEvent::Finished { unit, response } => self.on_finished(unit, response),
            UnitEvent::Fatal { unit, reason, .. } => self.fail_unit(unit, reason),
            UnitEvent::Exited { unit } => {
                if self.units.contains_key(&unit) {
                    self.fail_unit(unit, "execution unit exited unexpectedly".into());
                }
            }
        }
    }

    fn on_finished(&mut self, unit_id: UnitId, response: UnitResponse) {
        let id = response.id;
        if let Some(unit) = self.units.get_mut(&unit_id) {
            if let Err(e) = unit.release(response.success) {
                tracing::warn!(unit_id = %unit_id, error = %e, "Invalid unit transition");
            }
        }

        let Some(mut task) = self.running.remove(&id) else {
            tracing::debug!(task_id = %id, "Response for unknown task ignored");
            self.dispatch_queued();
            return;
        };

        let (status, outcome) = if response.success {
            match response.result {
                Some(output) => (TaskStatus::Completed, Ok(output)),
                None => (
                    TaskStatus::Failed,
                    Err(TaskError::UnexpectedOutput("empty result".into())),
                ),
            }
        } else {
            let info = response.error.unwrap_or_else(|| {
                ErrorInfo::new("WORKER_RUNTIME_ERROR", "response carried no error")
            });
            let err = TaskError::from_response(id, info);
            let status = if matches!(err, TaskError::Cancelled { .. }) {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Failed
            };
            (status, Err(err))
        };

        if let Err(e) = task.transition_to(status, None) {
            tracing::warn!(task_id = %id, error = %e, "Invalid task transition");
        }
        match status {
            TaskStatus::Completed => self.counters.completed += 1,
            TaskStatus::Cancelled => self.counters.cancelled += 1,
            _ => self.counters.failed += 1,
        }
        self.settle(
            task,
            outcome,
            response.execution_time_ms,
            response.memory_usage,
        );
        self.dispatch_queued();
    }

    /// Take a dead unit out of service, resolve its task, and backfill.
    fn fail_unit(&mut self, unit_id: UnitId, reason: String) {
        let Some(mut unit) = self.units.remove(&unit_id) else {
            return;
        };
        tracing::error!(unit_id = %unit_id, reason = %reason, "Execution unit failed");
        if let Err(e) = unit.transition_to(UnitStatus::Error, Some(reason.clone())) {
            tracing::warn!(unit_id = %unit_id, error = %e, "Invalid unit transition");
        }

        if let Some(task_id) = unit.current_task.take() {
            if let Some(task) = self.running.remove(&task_id) {
                self.recover_task(task, &reason);
            }
        }
        self.retire(unit);

        if self.units.len() < self.config.min_workers {
            match self.spawn_unit() {
                Ok(id) => tracing::info!(unit_id = %id, "Replaced failed unit"),
                Err(e) => tracing::error!(error = %e, "Failed to replace unit"),
            }
        }
        self.dispatch_queued();
    }

    fn recover_task(&mut self, mut task: Task, reason: &str) {
        let id = task.id;
        if task.can_retry() && task.requeue(reason.to_string()).is_ok() {
            tracing::warn!(task_id = %id, retry = task.retry_count, "Requeueing task after unit failure");
            self.queue.push(task);
            return;
        }
        let _ = task.transition_to(TaskStatus::Failed, Some(reason.to_string()));
        self.counters.failed += 1;
        self.settle(
            task,
            Err(TaskError::WorkerRuntime {
                id,
                reason: reason.to_string(),
            }),
            None,
            None,
        );
    }

    /// Ask the unit to stop and join its thread off the actor.
    fn retire(&mut self, mut unit: UnitHandle) {
        let _ = unit.transition_to(UnitStatus::Terminating, None);
        let _ = unit.send(UnitCommand::Shutdown);
        let join = unit.take_join();
        let _ = unit.transition_to(UnitStatus::Terminated, None);
        if let Some(join) = join {
            let id = unit.id;
            tokio::task::spawn_blocking(move || {
                if join.join().is_err() {
                    tracing::warn!(unit_id = %id, "Execution unit thread panicked");
                }
            });
        }
    }

    fn reap_idle(&mut self) {
        let excess = self.units.len().saturating_sub(self.config.min_workers);
        if excess == 0 {
            return;
        }
        let idle_timeout = self.config.idle_timeout;
        let victims: Vec<UnitId> = self
            .units
            .values()
            .filter(|u| u.status.is_available() && u.idle_for() >= idle_timeout)
            .map(|u| u.id)
            .take(excess)
            .collect();

        for id in victims {
            if let Some(unit) = self.units.remove(&id) {
                tracing::info!(unit_id = %id, units = self.units.len(), "Reaped idle unit");
                self.counters.reaped += 1;
                self.retire(unit);
            }
        }
    }

    // ── Cancellation, settlement, stats ─────────────────────────────

    fn cancel(&mut self, id: TaskId) -> bool {
        if let Some(mut task) = self.queue.remove(id) {
            let _ = task.transition_to(TaskStatus::Cancelled, Some("cancelled while queued".into()));
            self.counters.cancelled += 1;
            tracing::debug!(task_id = %id, "Queued task cancelled");
            self.settle(task, Err(TaskError::Cancelled { id }), None, None);
            return true;
        }

        let Some(task) = self.running.get_mut(&id) else {
            return false;
        };
        task.cancel_requested = true;
        if let Some(unit) = task.assigned_unit.and_then(|u| self.units.get(&u)) {
            // A dead inbox surfaces as an Exited event.
            let _ = unit.send(UnitCommand::Cancel { id });
        }
        tracing::debug!(task_id = %id, "Cancel forwarded to unit");
        true
    }

    fn settle(
        &mut self,
        task: Task,
        outcome: TaskOutcome,
        execution_time_ms: Option<u64>,
        memory: Option<MemoryUsage>,
    ) {
        let metrics = SettleMetrics {
            operation_tag: task.tag,
            status: task.status,
            unit: task.assigned_unit,
            execution_time_ms,
            memory,
            queue_length: self.queue.len(),
            active_units: self.busy_units(),
        };
        tracing::debug!(task_id = %task.id, status = %task.status, "Task settled");
        let _ = self.events.send(PoolEvent::Settled {
            id: task.id,
            outcome,
            metrics,
        });
    }

    fn reject_queued(&mut self, error: impl Fn(TaskId) -> TaskError) {
        let queued: Vec<Task> = self.queue.drain().collect();
        for mut task in queued {
            let id = task.id;
            let _ = task.transition_to(TaskStatus::Failed, None);
            self.counters.failed += 1;
            self.settle(task, Err(error(id)), None, None);
        }
    }

    fn busy_units(&self) -> usize {
        self.units
            .values()
            .filter(|u| u.status == UnitStatus::Busy)
            .count()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total_units: self.units.len(),
            idle_units: self
                .units
                .values()
                .filter(|u| u.status.is_available())
                .count(),
            busy_units: self.busy_units(),
            queued: self.queue.len(),
            running: self.running.len(),
            completed: self.counters.completed,
            failed: self.counters.failed,
            cancelled: self.counters.cancelled,
            spawned: self.counters.spawned,
            reaped: self.counters.reaped,
            units: self.units.values().map(UnitHandle::info).collect(),
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!(
            queued = self.queue.len(),
            running = self.running.len(),
            units = self.units.len(),
            "Shutting down worker pool"
        );

        let mut abandoned: Vec<Task> = self.queue.drain().collect();
        abandoned.extend(self.running.drain().map(|(_, task)| task));
        for mut task in abandoned {
            let id = task.id;
            let _ = task.transition_to(TaskStatus::Cancelled, Some("pool shut down".into()));
            self.settle(task, Err(TaskError::Shutdown { id }), None, None);
        }

        let mut joins = Vec::new();
        for (id, mut unit) in std::mem::take(&mut self.units) {
            let _ = unit.transition_to(UnitStatus::Terminating, Some("pool shutdown".into()));
            let _ = unit.send(UnitCommand::Shutdown);
            if let Some(join) = unit.take_join() {
                joins.push(tokio::task::spawn_blocking(move || (id, join.join().is_ok())));
            }
        }

        let grace = self.config.shutdown_grace;
        match tokio::time::timeout(grace, futures::future::join_all(joins)).await {
            Ok(results) => {
                for (id, clean) in results.into_iter().flatten() {
                    if !clean {
                        tracing::warn!(unit_id = %id, "Execution unit thread panicked");
                    }
                }
            }
            Err(_) => tracing::warn!(?grace, "Execution units still running after grace period"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use crate::runtime::{CheckpointPolicy, ExecutionContext};
    use crate::table::TabularResult;
    use crate::wire::{OperationPayload, Priority, StatisticsPayload};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Blocks every task until opened. Panics while `panics` is non-zero.
    #[derive(Default)]
    struct Gate {
        open: AtomicBool,
        panics: AtomicUsize,
        seen: Mutex<Vec<TaskId>>,
    }

    impl Gate {
        fn open(&self) {
            self.open.store(true, Ordering::SeqCst);
        }

        fn seen(&self) -> Vec<TaskId> {
            self.seen.lock().clone()
        }
    }

    impl OperationExecutor for Gate {
        fn execute(
            &self,
            _: OperationPayload,
            ctx: &mut ExecutionContext<'_>,
        ) -> Result<OperationOutput, OperationError> {
            self.seen.lock().push(ctx.task_id());
            if self
                .panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("gate told to panic");
            }
            let mut done = 0;
            while !self.open.load(Ordering::SeqCst) {
                done += 1;
                ctx.checkpoint(done, usize::MAX)?;
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(OperationOutput::Statistics(vec![]))
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            max_queue_size: 100,
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(1),
            max_retries: 0,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    fn settings() -> UnitSettings {
        UnitSettings {
            policy: CheckpointPolicy {
                chunk_size: 1,
                progress_interval: Duration::from_millis(50),
            },
            memory_limit: None,
        }
    }

    fn message(priority: Priority) -> UnitMessage {
        UnitMessage::new(
            TaskId::new(),
            OperationPayload::Statistics(StatisticsPayload {
                data: TabularResult::default(),
                columns: None,
            }),
            priority,
        )
    }

    async fn next_settled(
        events: &mut mpsc::UnboundedReceiver<PoolEvent>,
    ) -> (TaskId, TaskOutcome, SettleMetrics) {
        loop {
            let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
                .await
                .expect("timed out waiting for settlement")
                .expect("pool event channel closed");
            if let PoolEvent::Settled {
                id,
                outcome,
                metrics,
            } = event
            {
                return (id, outcome, metrics);
            }
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn single_unit_runs_by_priority() {
        let gate = Arc::new(Gate::default());
        let (pool, mut events) =
            WorkerPool::start(config(1, 1), settings(), gate.clone()).unwrap();

        let blocker = message(Priority::Normal);
        let blocker_id = blocker.id;
        pool.enqueue(blocker).await.unwrap();
        wait_until(|| gate.seen().len() == 1).await;

        let low = message(Priority::Low);
        let normal = message(Priority::Normal);
        let high = message(Priority::High);
        let critical = message(Priority::Critical);
        let expected = vec![blocker_id, critical.id, high.id, normal.id, low.id];
        for m in [low, normal, high, critical] {
            pool.enqueue(m).await.unwrap();
        }

        gate.open();
        for _ in 0..5 {
            let (_, outcome, _) = next_settled(&mut events).await;
            assert!(outcome.is_ok());
        }
        assert_eq!(gate.seen(), expected);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn scales_between_min_and_max() {
        let gate = Arc::new(Gate::default());
        let (pool, mut events) =
            WorkerPool::start(config(2, 4), settings(), gate.clone()).unwrap();
        assert_eq!(pool.stats().await.unwrap().total_units, 2);

        for _ in 0..6 {
            pool.enqueue(message(Priority::Normal)).await.unwrap();
        }
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.total_units, 4);
        assert_eq!(stats.busy_units, 4);
        assert_eq!(stats.queued, 2);

        gate.open();
        for _ in 0..6 {
            let (_, outcome, metrics) = next_settled(&mut events).await;
            assert!(outcome.is_ok());
            assert_eq!(metrics.status, TaskStatus::Completed);
            assert!(metrics.execution_time_ms.is_some());
        }
        let stats = pool.stats().await.unwrap();
        assert!((2..=4).contains(&stats.total_units));
        assert_eq!(stats.completed, 6);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_rejects_admission() {
        let gate = Arc::new(Gate::default());
        let mut cfg = config(1, 1);
        cfg.max_queue_size = 2;
        let (pool, _events) = WorkerPool::start(cfg, settings(), gate.clone()).unwrap();

        for _ in 0..3 {
            pool.enqueue(message(Priority::Normal)).await.unwrap();
        }
        match pool.enqueue(message(Priority::Critical)).await {
            Err(PoolError::QueueFull { capacity }) => assert_eq!(capacity, 2),
            other => panic!("unexpected: {other:?}"),
        }
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let gate = Arc::new(Gate::default());
        let (pool, _events) = WorkerPool::start(config(1, 1), settings(), gate).unwrap();
        let msg = message(Priority::Normal);
        pool.enqueue(msg.clone()).await.unwrap();
        assert!(matches!(
            pool.enqueue(msg).await,
            Err(PoolError::DuplicateTask { .. })
        ));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn queued_cancel_never_reaches_a_unit() {
        let gate = Arc::new(Gate::default());
        let (pool, mut events) =
            WorkerPool::start(config(1, 1), settings(), gate.clone()).unwrap();

        pool.enqueue(message(Priority::Normal)).await.unwrap();
        let queued = message(Priority::High);
        let queued_id = queued.id;
        pool.enqueue(queued).await.unwrap();

        assert!(pool.cancel(queued_id).await.unwrap());
        let (id, outcome, metrics) = next_settled(&mut events).await;
        assert_eq!(id, queued_id);
        assert_eq!(outcome.unwrap_err(), TaskError::Cancelled { id: queued_id });
        assert_eq!(metrics.status, TaskStatus::Cancelled);

        gate.open();
        let _ = next_settled(&mut events).await;
        assert!(!gate.seen().contains(&queued_id));
        assert!(!pool.cancel(TaskId::new()).await.unwrap());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn running_cancel_stops_at_checkpoint() {
        let gate = Arc::new(Gate::default());
        let (pool, mut events) =
            WorkerPool::start(config(1, 1), settings(), gate.clone()).unwrap();
        let msg = message(Priority::Normal);
        let id = msg.id;
        pool.enqueue(msg).await.unwrap();
        wait_until(|| gate.seen().len() == 1).await;

        assert!(pool.cancel(id).await.unwrap());
        let (settled, outcome, _) = next_settled(&mut events).await;
        assert_eq!(settled, id);
        assert_eq!(outcome.unwrap_err().code(), "CANCELLED");
        assert_eq!(pool.stats().await.unwrap().cancelled, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unit_panic_fails_task_and_replaces_unit() {
        let gate = Arc::new(Gate::default());
        gate.panics.store(1, Ordering::SeqCst);
        gate.open();
        let (pool, mut events) =
            WorkerPool::start(config(1, 2), settings(), gate.clone()).unwrap();

        let msg = message(Priority::Normal);
        let id = msg.id;
        pool.enqueue(msg).await.unwrap();
        let (_, outcome, metrics) = next_settled(&mut events).await;
        match outcome {
            Err(TaskError::WorkerRuntime { id: failed, reason }) => {
                assert_eq!(failed, id);
                assert!(reason.contains("gate told to panic"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(metrics.status, TaskStatus::Failed);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.total_units, 1);
        assert_eq!(stats.spawned, 2);

        pool.enqueue(message(Priority::Normal)).await.unwrap();
        let (_, outcome, _) = next_settled(&mut events).await;
        assert!(outcome.is_ok());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn retry_budget_requeues_after_unit_failure() {
        let gate = Arc::new(Gate::default());
        gate.panics.store(1, Ordering::SeqCst);
        gate.open();
        let mut cfg = config(1, 1);
        cfg.max_retries = 1;
        let (pool, mut events) = WorkerPool::start(cfg, settings(), gate.clone()).unwrap();

        let msg = message(Priority::Normal);
        let id = msg.id;
        pool.enqueue(msg).await.unwrap();
        let (settled, outcome, _) = next_settled(&mut events).await;
        assert_eq!(settled, id);
        assert!(outcome.is_ok());
        assert_eq!(gate.seen(), vec![id, id]);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn idle_units_above_min_are_reaped() {
        let gate = Arc::new(Gate::default());
        let mut cfg = config(1, 3);
        cfg.idle_timeout = Duration::from_millis(50);
        cfg.reap_interval = Duration::from_millis(20);
        let (pool, mut events) = WorkerPool::start(cfg, settings(), gate.clone()).unwrap();

        for _ in 0..3 {
            pool.enqueue(message(Priority::Normal)).await.unwrap();
        }
        assert_eq!(pool.stats().await.unwrap().total_units, 3);
        gate.open();
        for _ in 0..3 {
            let _ = next_settled(&mut events).await;
        }

        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let stats = pool.stats().await.unwrap();
                if stats.total_units == 1 {
                    assert_eq!(stats.reaped, 2);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("units were not reaped");
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_outstanding_work() {
        let gate = Arc::new(Gate::default());
        let (pool, mut events) =
            WorkerPool::start(config(1, 1), settings(), gate.clone()).unwrap();
        pool.enqueue(message(Priority::Normal)).await.unwrap();
        pool.enqueue(message(Priority::Normal)).await.unwrap();
        wait_until(|| gate.seen().len() == 1).await;

        pool.shutdown().await.unwrap();
        for _ in 0..2 {
            let (_, outcome, _) = next_settled(&mut events).await;
            assert_eq!(outcome.unwrap_err().code(), "SHUTDOWN");
        }
        assert!(matches!(
            pool.enqueue(message(Priority::Normal)).await,
            Err(PoolError::ShutDown)
        ));
        assert!(matches!(pool.stats().await, Err(PoolError::ShutDown)));
    }
}
