//! Pool behaviour seen through the dispatcher: scaling, priorities,
//! timeouts, cancellation and shutdown.
//!
//! Uses a gated executor so tests control exactly when tasks finish.
//!
//! Run with: `cargo test --test pool_integration`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use gridpool::config::Config;
use gridpool::error::OperationError;
use gridpool::runtime::{ExecutionContext, OperationExecutor};
use gridpool::table::TabularResult;
use gridpool::wire::{
    OperationOutput, OperationPayload, Priority, StatisticsPayload, TaskId,
};
use gridpool::worker::TaskStatus;
use gridpool::{SubmitOptions, TaskDispatcher};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Holds every task at a checkpoint loop until opened.
#[derive(Default)]
struct Gate {
    open: AtomicBool,
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
        let mut done = 0;
        while !self.open.load(Ordering::SeqCst) {
            done += 1;
            ctx.checkpoint(done, usize::MAX)?;
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(OperationOutput::Statistics(vec![]))
    }
}

fn config(min: usize, max: usize) -> Config {
    let mut config = Config::default();
    config.pool.min_workers = min;
    config.pool.max_workers = max;
    config.runtime.chunk_size = 1;
    config.dispatcher.default_timeout = TEST_TIMEOUT;
    config
}

fn payload() -> OperationPayload {
    OperationPayload::Statistics(StatisticsPayload {
        data: TabularResult::default(),
        columns: None,
    })
}

/// Wait until the gate has seen `n` tasks start.
async fn wait_for_started(gate: &Gate, n: usize) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while gate.seen().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tasks never started");
}

async fn wait_for_completed(dispatcher: &TaskDispatcher, n: u64) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while dispatcher.pool_stats().await.map(|s| s.completed).unwrap_or(0) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tasks never completed");
}

#[tokio::test]
async fn scales_up_to_max_and_queues_the_rest() {
    let gate = Arc::new(Gate::default());
    let dispatcher = TaskDispatcher::with_executor(config(2, 4), gate.clone()).unwrap();

    let stats = dispatcher.pool_stats().await.unwrap();
    assert_eq!(stats.total_units, 2);

    let mut tasks = Vec::new();
    for _ in 0..6 {
        tasks.push(
            dispatcher
                .dispatch(payload(), Priority::Normal, SubmitOptions::default())
                .await
                .unwrap(),
        );
    }

    wait_for_started(&gate, 4).await;
    let stats = dispatcher.pool_stats().await.unwrap();
    assert_eq!(stats.total_units, 4);
    assert_eq!(stats.busy_units, 4);
    assert_eq!(stats.queued, 2);

    gate.open();
    for task in tasks {
        let output = tokio::time::timeout(TEST_TIMEOUT, task.wait())
            .await
            .expect("task never settled");
        assert!(output.is_ok());
    }

    let stats = dispatcher.pool_stats().await.unwrap();
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.total_units, 4);
    assert_eq!(dispatcher.pending_count().await, 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn higher_priority_runs_first() {
    let gate = Arc::new(Gate::default());
    let dispatcher = TaskDispatcher::with_executor(config(1, 1), gate.clone()).unwrap();

    let blocker = dispatcher
        .dispatch(payload(), Priority::Normal, SubmitOptions::default())
        .await
        .unwrap();
    wait_for_started(&gate, 1).await;

    let low = dispatcher
        .dispatch(payload(), Priority::Low, SubmitOptions::default())
        .await
        .unwrap();
    let critical = dispatcher
        .dispatch(payload(), Priority::Critical, SubmitOptions::default())
        .await
        .unwrap();
    let expected = vec![blocker.id(), critical.id(), low.id()];

    gate.open();
    for task in [blocker, low, critical] {
        assert!(task.wait().await.is_ok());
    }
    assert_eq!(gate.seen(), expected);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn timeout_rejects_once_and_ignores_the_late_response() {
    let gate = Arc::new(Gate::default());
    let dispatcher = TaskDispatcher::with_executor(config(1, 1), gate.clone()).unwrap();

    let task = dispatcher
        .dispatch(
            payload(),
            Priority::Normal,
            SubmitOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    let id = task.id();

    let err = task.wait().await.unwrap_err();
    assert_eq!(err.code(), "TASK_TIMEOUT");
    assert_eq!(dispatcher.pending_count().await, 0);

    gate.open();
    wait_for_completed(&dispatcher, 1).await;

    let recorded: Vec<_> = dispatcher
        .monitor()
        .snapshots()
        .into_iter()
        .filter(|m| m.task_id == id)
        .collect();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, TaskStatus::Timeout);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_running_task_rejects_its_future() {
    let gate = Arc::new(Gate::default());
    let dispatcher = TaskDispatcher::with_executor(config(1, 1), gate.clone()).unwrap();

    let task = dispatcher
        .dispatch(payload(), Priority::Normal, SubmitOptions::default())
        .await
        .unwrap();
    wait_for_started(&gate, 1).await;

    assert!(dispatcher.cancel(task.id()).await);
    let err = task.wait().await.unwrap_err();
    assert_eq!(err.code(), "CANCELLED");

    // The unit is free again.
    gate.open();
    let next = dispatcher
        .submit(payload(), Priority::Normal, SubmitOptions::default())
        .await;
    assert!(next.is_ok());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn cancelling_an_unknown_task_is_a_no_op() {
    let dispatcher =
        TaskDispatcher::with_executor(config(1, 1), Arc::new(Gate::default())).unwrap();
    assert!(!dispatcher.cancel(TaskId::new()).await);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_outstanding_and_later_tasks() {
    let gate = Arc::new(Gate::default());
    let dispatcher = TaskDispatcher::with_executor(config(1, 1), gate.clone()).unwrap();

    let running = dispatcher
        .dispatch(payload(), Priority::Normal, SubmitOptions::default())
        .await
        .unwrap();
    let queued = dispatcher
        .dispatch(payload(), Priority::Normal, SubmitOptions::default())
        .await
        .unwrap();
    wait_for_started(&gate, 1).await;

    tokio::time::timeout(TEST_TIMEOUT, dispatcher.shutdown())
        .await
        .expect("shutdown hung");

    assert_eq!(running.wait().await.unwrap_err().code(), "SHUTDOWN");
    assert_eq!(queued.wait().await.unwrap_err().code(), "SHUTDOWN");

    let late = dispatcher
        .submit(payload(), Priority::Normal, SubmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(late.code(), "SHUTDOWN");
}
