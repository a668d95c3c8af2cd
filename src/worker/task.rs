//! Task records owned by the pool.

use chrono::{DateTime, Utc};

use super::state::{StateTransition, TaskStatus, apply_transition};
use crate::wire::{OperationTag, Priority, TaskId, UnitId, UnitMessage};

/// One unit of work tracked by the pool from admission to settlement.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub tag: OperationTag,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Admission order; ties within a priority go to the lower value.
    pub seq: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_unit: Option<UnitId>,
    /// Set once a cancel has been forwarded to the running unit.
    pub cancel_requested: bool,
    pub transitions: Vec<StateTransition<TaskStatus>>,
    /// `None` once handed to a unit without a retry budget.
    message: Option<UnitMessage>,
}

impl Task {
    pub fn new(message: UnitMessage, seq: u64, max_retries: u32) -> Self {
        Self {
            id: message.id,
            tag: message.tag(),
            priority: message.priority,
            status: TaskStatus::Pending,
            seq,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_unit: None,
            cancel_requested: false,
            transitions: Vec::new(),
            message: Some(message),
        }
    }

    pub fn transition_to(
        &mut self,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        apply_transition(
            &mut self.status,
            &mut self.transitions,
            status,
            reason,
            TaskStatus::can_transition_to,
        )?;

        match status {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Pending => self.assigned_unit = None,
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// The message to hand to a unit. A copy is kept while retries remain.
    pub fn take_message(&mut self) -> Option<UnitMessage> {
        if self.retry_count < self.max_retries {
            self.message.clone()
        } else {
            self.message.take()
        }
    }

    /// Put back a message that never reached a unit.
    pub fn restore_message(&mut self, message: UnitMessage) {
        self.message = Some(message);
    }

    /// Whether the task can run again after its unit died.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
            && !self.cancel_requested
            && self.message.as_ref().is_some_and(|m| {
                m.transferable
                    .as_ref()
                    .is_none_or(|buffer| !buffer.is_destroyed())
            })
    }

    /// Move a running task back to the queue.
    pub fn requeue(&mut self, reason: String) -> Result<(), String> {
        self.retry_count += 1;
        self.transition_to(TaskStatus::Pending, Some(reason))
    }
}
