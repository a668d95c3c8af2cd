//! Per-task execution context: cooperative cancellation and progress.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::OperationError;
use crate::wire::{ProgressUpdate, TaskId, UnitCommand};

/// How often a context looks at its inbox and reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Rows between inbox polls.
    pub chunk_size: usize,
    /// Minimum gap between progress updates.
    pub progress_interval: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            progress_interval: Duration::from_millis(100),
        }
    }
}

/// Threaded through every row loop of an operation.
pub struct ExecutionContext<'a> {
    task_id: TaskId,
    policy: CheckpointPolicy,
    token: CancellationToken,
    inbox: Option<&'a Receiver<UnitCommand>>,
    progress: Option<&'a mut dyn FnMut(ProgressUpdate)>,
    last_progress: Option<Instant>,
    stage: Option<&'static str>,
    /// Commands read from the inbox that belong to later tasks.
    deferred: Vec<UnitCommand>,
    shutdown_requested: bool,
    inbox_closed: bool,
}

impl<'a> ExecutionContext<'a> {
    /// A context with no inbox and no progress sink.
    pub fn new(task_id: TaskId, policy: CheckpointPolicy) -> Self {
        Self {
            task_id,
            policy: CheckpointPolicy {
                chunk_size: policy.chunk_size.max(1),
                ..policy
            },
            token: CancellationToken::new(),
            inbox: None,
            progress: None,
            last_progress: None,
            stage: None,
            deferred: Vec::new(),
            shutdown_requested: false,
            inbox_closed: false,
        }
    }

    /// Poll `inbox` for cancel commands at every chunk boundary.
    pub fn with_inbox(mut self, inbox: &'a Receiver<UnitCommand>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn with_progress(mut self, sink: &'a mut dyn FnMut(ProgressUpdate)) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Token cancelled when a `Cancel` for this task arrives.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Label attached to subsequent progress updates.
    pub fn set_stage(&mut self, stage: &'static str) {
        self.stage = Some(stage);
    }

    /// Called once per row. Every `chunk_size` rows the inbox is drained and
    /// a progress update may be emitted.
    pub fn checkpoint(&mut self, done: usize, total: usize) -> Result<(), OperationError> {
        if done > 0 && done % self.policy.chunk_size == 0 {
            self.poll_inbox();
            if !self.is_cancelled() {
                self.report(done, total, false);
            }
        }
        if self.is_cancelled() {
            return Err(OperationError::Cancelled);
        }
        Ok(())
    }

    /// Emit the final 100 % update.
    pub fn finish(&mut self, total: usize) {
        self.report(total, total, true);
    }

    fn report(&mut self, done: usize, total: usize, force: bool) {
        let Some(sink) = self.progress.as_deref_mut() else {
            return;
        };
        let due = force
            || self
                .last_progress
                .is_none_or(|at| at.elapsed() >= self.policy.progress_interval);
        if !due {
            return;
        }
        let mut update = ProgressUpdate::new(self.task_id, done, total);
        if let Some(stage) = self.stage {
            update = update.with_message(stage);
        }
        sink(update);
        self.last_progress = Some(Instant::now());
    }

    fn poll_inbox(&mut self) {
        let Some(inbox) = self.inbox else {
            return;
        };
        loop {
            match inbox.try_recv() {
                Ok(UnitCommand::Cancel { id }) if id == self.task_id => self.token.cancel(),
                Ok(UnitCommand::Cancel { .. }) => {}
                Ok(UnitCommand::Shutdown) => {
                    self.shutdown_requested = true;
                    self.token.cancel();
                }
                Ok(other) => self.deferred.push(other),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.inbox_closed = true;
                    self.token.cancel();
                    break;
                }
            }
        }
    }

    /// Whether a `Shutdown` arrived while the task was running.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Whether the pool side of the inbox went away mid-task.
    pub fn inbox_closed(&self) -> bool {
        self.inbox_closed
    }

    /// Commands that arrived mid-task and are meant for the unit loop.
    pub fn take_deferred(&mut self) -> Vec<UnitCommand> {
        std::mem::take(&mut self.deferred)
    }
}
