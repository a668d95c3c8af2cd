//! Execution unit: a dedicated thread that runs one task at a time.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Instant;

use tokio::sync::mpsc;

use super::{CheckpointPolicy, ExecutionContext, OperationExecutor};
use crate::error::OperationError;
use crate::wire::{
    MemoryUsage, OperationOutput, ProgressUpdate, TaskId, UnitCommand, UnitId, UnitMessage,
    UnitResponse,
};

/// Knobs a unit needs at spawn time.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitSettings {
    pub policy: CheckpointPolicy,
    /// Reported alongside memory usage.
    pub memory_limit: Option<u64>,
}

/// What a unit reports back to its pool.
#[derive(Debug)]
pub enum UnitEvent {
    Progress {
        unit: UnitId,
        update: ProgressUpdate,
    },
    Finished {
        unit: UnitId,
        response: UnitResponse,
    },
    /// The unit cannot continue. Its thread exits after sending this.
    Fatal {
        unit: UnitId,
        task: Option<TaskId>,
        reason: String,
    },
    Exited {
        unit: UnitId,
    },
}

impl UnitEvent {
    pub fn unit(&self) -> UnitId {
        match self {
            Self::Progress { unit, .. }
            | Self::Finished { unit, .. }
            | Self::Fatal { unit, .. }
            | Self::Exited { unit } => *unit,
        }
    }
}

/// Pool-side ends of a spawned unit.
#[derive(Debug)]
pub struct UnitChannel {
    pub inbox: std_mpsc::Sender<UnitCommand>,
    pub join: JoinHandle<()>,
}

/// Spawn a unit thread named `gridpool-unit-<id>`.
pub fn spawn_unit(
    id: UnitId,
    executor: Arc<dyn OperationExecutor>,
    settings: UnitSettings,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> std::io::Result<UnitChannel> {
    let (inbox_tx, inbox_rx) = std_mpsc::channel();
    let join = std::thread::Builder::new()
        .name(format!("gridpool-unit-{}", id.0))
        .spawn(move || {
            let mut unit = Unit {
                id,
                executor,
                settings,
                events,
                inbox: inbox_rx,
                peak_bytes: 0,
            };
            unit.run();
        })?;
    Ok(UnitChannel {
        inbox: inbox_tx,
        join,
    })
}

enum Flow {
    Continue,
    Stop,
}

struct Unit {
    id: UnitId,
    executor: Arc<dyn OperationExecutor>,
    settings: UnitSettings,
    events: mpsc::UnboundedSender<UnitEvent>,
    inbox: std_mpsc::Receiver<UnitCommand>,
    peak_bytes: u64,
}

impl Unit {
    fn run(&mut self) {
        tracing::debug!(unit_id = %self.id, "Execution unit started");
        let mut backlog: VecDeque<UnitCommand> = VecDeque::new();

        loop {
            let command = match backlog.pop_front() {
                Some(c) => c,
                None => match self.inbox.recv() {
                    Ok(c) => c,
                    // Pool side dropped the inbox.
                    Err(_) => break,
                },
            };

            match command {
                UnitCommand::Execute(message) => {
                    let (flow, deferred) = self.execute(message);
                    backlog.extend(deferred);
                    if let Flow::Stop = flow {
                        break;
                    }
                }
                // Nothing is running, so there is nothing to cancel.
                UnitCommand::Cancel { .. } => {}
                UnitCommand::Shutdown => break,
            }
        }

        tracing::debug!(unit_id = %self.id, "Execution unit exiting");
        let _ = self.events.send(UnitEvent::Exited { unit: self.id });
    }

    fn execute(&mut self, message: UnitMessage) -> (Flow, Vec<UnitCommand>) {
        let UnitMessage {
            id,
            mut payload,
            transferable,
            ..
        } = message;
        let tag = payload.tag();
        let started = Instant::now();
        tracing::debug!(unit_id = %self.id, task_id = %id, operation = %tag, "Running task");

        if let Some(buffer) = transferable {
            if let Some(table) = payload.input_table_mut() {
                let hydrated = buffer.read_data(&table.columns);
                if let Err(e) = buffer.clear() {
                    tracing::warn!(unit_id = %self.id, error = %e, "Failed to clear shared buffer");
                }
                buffer.destroy();
                match hydrated {
                    Ok(data) => table.rows = data.rows,
                    Err(e) => {
                        return (self.fatal(Some(id), OperationError::from(e).to_string()), vec![]);
                    }
                }
            }
        }

        let input_bytes = payload.input_table().map(|t| t.estimated_bytes()).unwrap_or(0);
        let events = self.events.clone();
        let unit = self.id;
        let mut sink = move |update: ProgressUpdate| {
            let _ = events.send(UnitEvent::Progress { unit, update });
        };

        let mut ctx = ExecutionContext::new(id, self.settings.policy)
            .with_inbox(&self.inbox)
            .with_progress(&mut sink);
        let executor = Arc::clone(&self.executor);
        let result = catch_unwind(AssertUnwindSafe(|| executor.execute(payload, &mut ctx)));
        let deferred = ctx.take_deferred();
        let stop_after = ctx.shutdown_requested() || ctx.inbox_closed();
        drop(ctx);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut used = input_bytes;
        let response = match result {
            Err(panic) => {
                let reason = panic_message(&panic);
                return (self.fatal(Some(id), format!("operation panicked: {reason}")), deferred);
            }
            Ok(Err(e)) if e.is_fatal() => return (self.fatal(Some(id), e.to_string()), deferred),
            Ok(Err(e)) => {
                tracing::debug!(unit_id = %self.id, task_id = %id, code = e.code(), "Task failed");
                UnitResponse::failure(id, tag, e.to_info())
            }
            Ok(Ok(mut output)) => {
                if let OperationOutput::Table(table) = &mut output {
                    table.metadata.get_or_insert_with(Default::default).execution_time_ms =
                        Some(elapsed_ms);
                }
                used += output.estimated_bytes();
                UnitResponse::success(id, tag, output)
            }
        };
        self.peak_bytes = self.peak_bytes.max(used);
        let response = response.with_timing(
            elapsed_ms,
            MemoryUsage::new(used, self.peak_bytes, self.settings.memory_limit),
        );

        if self
            .events
            .send(UnitEvent::Finished {
                unit: self.id,
                response,
            })
            .is_err()
        {
            return (Flow::Stop, deferred);
        }

        if stop_after {
            (Flow::Stop, deferred)
        } else {
            (Flow::Continue, deferred)
        }
    }

    fn fatal(&self, task: Option<TaskId>, reason: String) -> Flow {
        tracing::error!(unit_id = %self.id, reason = %reason, "Execution unit failed");
        let _ = self.events.send(UnitEvent::Fatal {
            unit: self.id,
            task,
            reason,
        });
        Flow::Stop
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferOptions, Overflow, SharedBufferManager};
    use crate::runtime::Runtime;
    use crate::table::{ColumnDef, ColumnType, TabularResult};
    use crate::wire::{
        FilterCondition, FilterOperator, FilterPayload, OperationPayload, Priority,
        StatisticsPayload,
    };
    use serde_json::json;
    use std::time::Duration;

    fn table(n: i64) -> TabularResult {
        TabularResult::new(
            vec![ColumnDef::new("v", ColumnType::Integer)],
            (0..n)
                .filter_map(|i| json!({"v": i}).as_object().cloned())
                .collect(),
        )
    }

    fn filter_message(data: TabularResult) -> UnitMessage {
        UnitMessage::new(
            TaskId::new(),
            OperationPayload::Filter(FilterPayload {
                data,
                conditions: vec![FilterCondition::new(
                    "v",
                    FilterOperator::GreaterThanOrEqual,
                    json!(5),
                )],
            }),
            Priority::Normal,
        )
    }

    fn spawn(
        executor: Arc<dyn OperationExecutor>,
    ) -> (UnitChannel, mpsc::UnboundedReceiver<UnitEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = UnitSettings {
            policy: CheckpointPolicy {
                chunk_size: 1,
                progress_interval: Duration::ZERO,
            },
            memory_limit: Some(1 << 20),
        };
        let channel = spawn_unit(UnitId(7), executor, settings, tx).unwrap();
        (channel, rx)
    }

    fn next_finished(rx: &mut mpsc::UnboundedReceiver<UnitEvent>) -> UnitResponse {
        loop {
            match rx.blocking_recv() {
                Some(UnitEvent::Finished { response, .. }) => return response,
                Some(UnitEvent::Progress { .. }) => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn runs_task_and_reports_progress() {
        let (unit, mut rx) = spawn(Arc::new(Runtime::new()));
        let msg = filter_message(table(10));
        let id = msg.id;
        unit.inbox.send(UnitCommand::Execute(msg)).unwrap();

        let mut progress = 0;
        let response = loop {
            match rx.blocking_recv() {
                Some(UnitEvent::Progress { update, .. }) => {
                    assert_eq!(update.id, id);
                    progress += 1;
                }
                Some(UnitEvent::Finished { response, .. }) => break response,
                other => panic!("unexpected event: {other:?}"),
            }
        };
        assert!(progress > 0);
        assert!(response.success);
        assert_eq!(response.id, id);
        let memory = response.memory_usage.unwrap();
        assert!(memory.used > 0);
        assert_eq!(memory.limit, Some(1 << 20));
        let out = response.result.unwrap().into_table().unwrap();
        assert_eq!(out.rows.len(), 5);
        assert!(out.metadata.unwrap().execution_time_ms.is_some());

        unit.inbox.send(UnitCommand::Shutdown).unwrap();
        assert!(matches!(rx.blocking_recv(), Some(UnitEvent::Exited { .. })));
        unit.join.join().unwrap();
    }

    #[test]
    fn operation_errors_become_error_responses() {
        let (unit, mut rx) = spawn(Arc::new(Runtime::new()));
        let mut msg = filter_message(table(1));
        if let OperationPayload::Filter(p) = &mut msg.payload {
            p.conditions[0].column = "missing".into();
        }
        unit.inbox.send(UnitCommand::Execute(msg)).unwrap();
        let response = next_finished(&mut rx);
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "COLUMN_NOT_FOUND");
        drop(unit.inbox);
        unit.join.join().unwrap();
    }

    struct Panics;

    impl OperationExecutor for Panics {
        fn execute(
            &self,
            _: OperationPayload,
            _: &mut ExecutionContext<'_>,
        ) -> Result<OperationOutput, OperationError> {
            panic!("boom")
        }
    }

    #[test]
    fn panic_is_fatal() {
        let (unit, mut rx) = spawn(Arc::new(Panics));
        let msg = filter_message(table(1));
        let id = msg.id;
        unit.inbox.send(UnitCommand::Execute(msg)).unwrap();
        match rx.blocking_recv() {
            Some(UnitEvent::Fatal { task, reason, .. }) => {
                assert_eq!(task, Some(id));
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.blocking_recv(), Some(UnitEvent::Exited { .. })));
        unit.join.join().unwrap();
    }

    /// Spins on checkpoints until cancelled.
    struct Spins;

    impl OperationExecutor for Spins {
        fn execute(
            &self,
            _: OperationPayload,
            ctx: &mut ExecutionContext<'_>,
        ) -> Result<OperationOutput, OperationError> {
            let mut done = 0;
            loop {
                done += 1;
                ctx.checkpoint(done, usize::MAX)?;
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn cancel_reaches_running_task() {
        let (unit, mut rx) = spawn(Arc::new(Spins));
        let msg = filter_message(table(1));
        let id = msg.id;
        unit.inbox.send(UnitCommand::Execute(msg)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        unit.inbox.send(UnitCommand::Cancel { id }).unwrap();

        let response = next_finished(&mut rx);
        assert_eq!(response.error.unwrap().code, "CANCELLED");
        unit.inbox.send(UnitCommand::Shutdown).unwrap();
        unit.join.join().unwrap();
    }

    #[test]
    fn hydrates_input_from_shared_buffer() {
        let manager = SharedBufferManager::new(BufferOptions {
            overflow: Overflow::Error,
            ..Default::default()
        });
        let data = table(8);
        let buffer = manager.create_buffer(8, &data.columns).unwrap();
        buffer.write_data(&data).unwrap();

        let mut msg = UnitMessage::new(
            TaskId::new(),
            OperationPayload::Statistics(StatisticsPayload {
                data: TabularResult::new(data.columns.clone(), vec![]),
                columns: None,
            }),
            Priority::High,
        );
        msg.transferable = Some(buffer.clone());

        let (unit, mut rx) = spawn(Arc::new(Runtime::new()));
        unit.inbox.send(UnitCommand::Execute(msg)).unwrap();
        let response = next_finished(&mut rx);
        let stats = response.result.unwrap().into_statistics().unwrap();
        assert_eq!(stats[0].count, 8);
        assert!(buffer.is_destroyed());

        unit.inbox.send(UnitCommand::Shutdown).unwrap();
        unit.join.join().unwrap();
    }

    #[test]
    fn unreadable_buffer_is_fatal() {
        let manager = SharedBufferManager::default();
        let data = table(2);
        let buffer = manager.create_buffer(2, &data.columns).unwrap();
        buffer.destroy();

        let mut msg = filter_message(TabularResult::new(data.columns.clone(), vec![]));
        msg.transferable = Some(buffer);

        let (unit, mut rx) = spawn(Arc::new(Runtime::new()));
        unit.inbox.send(UnitCommand::Execute(msg)).unwrap();
        assert!(matches!(rx.blocking_recv(), Some(UnitEvent::Fatal { .. })));
        unit.join.join().unwrap();
    }
}
