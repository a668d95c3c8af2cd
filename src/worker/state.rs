//! Task and execution unit state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transition history kept per record.
pub const MAX_TRANSITIONS: usize = 200;

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue for a unit.
    Pending,
    /// Assigned to a unit.
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The caller stopped waiting. Only the dispatcher records this.
    Timeout,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            // Requeue after the unit died
            (Running, Pending) |
            (Pending, Timeout) | (Running, Timeout)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// State of an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Idle,
    /// Running exactly one task.
    Busy,
    /// Asked to stop; the thread has not been joined yet.
    Terminating,
    Terminated,
    /// Died or reported a fatal error.
    Error,
}

impl UnitStatus {
    pub fn can_transition_to(&self, target: UnitStatus) -> bool {
        use UnitStatus::*;

        matches!(
            (self, target),
            (Idle, Busy) | (Idle, Terminating) | (Idle, Error) |
            (Busy, Idle) | (Busy, Error) | (Busy, Terminating) |
            (Error, Terminated) | (Error, Terminating) |
            (Terminating, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether the unit can be handed a task.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Check and record a transition, keeping at most [`MAX_TRANSITIONS`].
pub(crate) fn apply_transition<S>(
    current: &mut S,
    history: &mut Vec<StateTransition<S>>,
    target: S,
    reason: Option<String>,
    allowed: fn(&S, S) -> bool,
) -> Result<(), String>
where
    S: Copy + std::fmt::Display,
{
    if !allowed(current, target) {
        return Err(format!("Cannot transition from {} to {}", current, target));
    }

    history.push(StateTransition {
        from: *current,
        to: target,
        timestamp: Utc::now(),
        reason,
    });
    if history.len() > MAX_TRANSITIONS {
        let drain_count = history.len() - MAX_TRANSITIONS;
        history.drain(..drain_count);
    }

    *current = target;
    Ok(())
}
