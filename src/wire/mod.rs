//! Wire contracts: ids, priorities, operation tags, payloads, outputs, and
//! the message/response/progress records exchanged with execution units.
//!
//! - `payload`: one payload variant per operation tag
//! - `options`: per-operation configuration (filters, sort keys, export knobs, ...)
//! - `output`: one output variant per operation family
//! - `message`: unit messages, responses, progress updates

pub mod message;
pub mod options;
pub mod output;
pub mod payload;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use message::{ErrorInfo, MemoryUsage, ProgressUpdate, UnitCommand, UnitMessage, UnitResponse};
pub use options::*;
pub use output::{
    ColumnStatistics, ExportOutput, NumericSummary, OperationOutput, TextSummary, ValidationIssue,
    ValidationReport,
};
pub use payload::*;

/// Correlation id of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of an execution unit, unique within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Task priority. Higher values dispatch first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Operation tags understood by the execution runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationTag {
    Parse,
    Filter,
    Sort,
    ExportCsv,
    ExportJson,
    ExportTabular,
    Aggregate,
    Statistics,
    Validate,
    Transform,
    Cancel,
}

impl OperationTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "PARSE",
            Self::Filter => "FILTER",
            Self::Sort => "SORT",
            Self::ExportCsv => "EXPORT_CSV",
            Self::ExportJson => "EXPORT_JSON",
            Self::ExportTabular => "EXPORT_TABULAR",
            Self::Aggregate => "AGGREGATE",
            Self::Statistics => "STATISTICS",
            Self::Validate => "VALIDATE",
            Self::Transform => "TRANSFORM",
            Self::Cancel => "CANCEL",
        }
    }
}

impl std::fmt::Display for OperationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
