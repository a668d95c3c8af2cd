//! Pool-side bookkeeping for one execution unit.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::{StateTransition, UnitStatus, apply_transition};
use crate::runtime::UnitChannel;
use crate::wire::{TaskId, UnitCommand, UnitId};

#[derive(Debug)]
pub struct UnitHandle {
    pub id: UnitId,
    pub status: UnitStatus,
    pub current_task: Option<TaskId>,
    pub completed: u64,
    pub failed: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub transitions: Vec<StateTransition<UnitStatus>>,
    inbox: std_mpsc::Sender<UnitCommand>,
    join: Option<JoinHandle<()>>,
}

/// Serializable view of a unit, reported in pool stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitInfo {
    pub id: UnitId,
    pub status: UnitStatus,
    pub current_task: Option<TaskId>,
    pub completed: u64,
    pub failed: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl UnitHandle {
    pub fn new(id: UnitId, channel: UnitChannel) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: UnitStatus::Idle,
            current_task: None,
            completed: 0,
            failed: 0,
            created_at: now,
            last_activity: now,
            transitions: Vec::new(),
            inbox: channel.inbox,
            join: Some(channel.join),
        }
    }

    pub fn transition_to(
        &mut self,
        status: UnitStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        apply_transition(
            &mut self.status,
            &mut self.transitions,
            status,
            reason,
            UnitStatus::can_transition_to,
        )?;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Idle → Busy with `task` as the current task.
    pub fn assign(&mut self, task: TaskId) -> Result<(), String> {
        self.transition_to(UnitStatus::Busy, None)?;
        self.current_task = Some(task);
        Ok(())
    }

    /// Busy → Idle after the current task settled.
    pub fn release(&mut self, success: bool) -> Result<Option<TaskId>, String> {
        self.transition_to(UnitStatus::Idle, None)?;
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        Ok(self.current_task.take())
    }

    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_activity).to_std().unwrap_or_default()
    }

    /// Send a command. The command comes back if the unit thread is gone.
    pub fn send(&self, command: UnitCommand) -> Result<(), UnitCommand> {
        self.inbox.send(command).map_err(|e| e.0)
    }

    /// Take the thread handle for joining. Only the first call returns it.
    pub fn take_join(&mut self) -> Option<JoinHandle<()>> {
        self.join.take()
    }

    pub fn info(&self) -> UnitInfo {
        UnitInfo {
            id: self.id,
            status: self.status,
            current_task: self.current_task,
            completed: self.completed,
            failed: self.failed,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}
