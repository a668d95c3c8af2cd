//! Messages exchanged between the pool and its execution units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::output::OperationOutput;
use super::payload::OperationPayload;
use super::{OperationTag, Priority, TaskId};
use crate::buffer::SharedBuffer;

/// Work handed to an execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitMessage {
    pub id: TaskId,
    #[serde(flatten)]
    pub payload: OperationPayload,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    /// Input table moved through shared memory instead of `payload`.
    #[serde(skip)]
    pub transferable: Option<SharedBuffer>,
}

impl UnitMessage {
    pub fn new(id: TaskId, payload: OperationPayload, priority: Priority) -> Self {
        Self {
            id,
            payload,
            timestamp: Utc::now(),
            priority,
            transferable: None,
        }
    }

    pub fn tag(&self) -> OperationTag {
        self.payload.tag()
    }
}

/// Inbox protocol of an execution unit.
#[derive(Debug, Clone)]
pub enum UnitCommand {
    Execute(UnitMessage),
    /// Abort the task at the next checkpoint, if it is the current one.
    Cancel { id: TaskId },
    Shutdown,
}

impl UnitCommand {
    pub fn tag(&self) -> OperationTag {
        match self {
            Self::Execute(msg) => msg.tag(),
            Self::Cancel { .. } | Self::Shutdown => OperationTag::Cancel,
        }
    }
}

/// Structured error carried on a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Approximate working-set figures reported by a unit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub peak: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

impl MemoryUsage {
    pub fn new(used: u64, peak: u64, limit: Option<u64>) -> Self {
        let percentage = limit
            .filter(|l| *l > 0)
            .map(|l| used as f64 / l as f64 * 100.0);
        Self {
            used,
            peak,
            limit,
            percentage,
        }
    }
}

/// Outcome of one task, produced by the unit that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitResponse {
    pub id: TaskId,
    pub operation_tag: OperationTag,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MemoryUsage>,
}

impl UnitResponse {
    pub fn success(id: TaskId, tag: OperationTag, result: OperationOutput) -> Self {
        Self {
            id,
            operation_tag: tag,
            success: true,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
            execution_time_ms: None,
            memory_usage: None,
        }
    }

    pub fn failure(id: TaskId, tag: OperationTag, error: ErrorInfo) -> Self {
        Self {
            id,
            operation_tag: tag,
            success: false,
            result: None,
            error: Some(error),
            timestamp: Utc::now(),
            execution_time_ms: None,
            memory_usage: None,
        }
    }

    pub fn with_timing(mut self, execution_time_ms: u64, memory: MemoryUsage) -> Self {
        self.execution_time_ms = Some(execution_time_ms);
        self.memory_usage = Some(memory);
        self
    }
}

/// Progress of a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: TaskId,
    pub current: usize,
    pub total: usize,
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(id: TaskId, current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (current.min(total) as f64 / total as f64) * 100.0
        };
        Self {
            id,
            current,
            total,
            percentage,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
