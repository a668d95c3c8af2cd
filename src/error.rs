//! Error types for gridpool.

use std::time::Duration;

use crate::wire::{ErrorInfo, TaskId};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Shared buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

/// Worker pool errors raised at the pool boundary.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to spawn execution unit: {reason}")]
    WorkerInit { reason: String },

    #[error("Task queue is full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },

    #[error("Task {id} is already queued or running")]
    DuplicateTask { id: TaskId },

    #[error("Worker pool has been shut down")]
    ShutDown,
}

/// Shared buffer errors.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Invalid buffer layout: {0}")]
    InvalidLayout(String),

    #[error("Too many columns: {count} (max {max})")]
    TooManyColumns { count: usize, max: usize },

    #[error("Row count {rows} exceeds buffer capacity {capacity}")]
    CapacityExceeded { rows: usize, capacity: usize },

    #[error("Column {0} is not part of the buffer layout")]
    ColumnNotFound(String),

    #[error("Column {column} row {row}: expected {expected} value")]
    TypeMismatch {
        column: String,
        row: usize,
        expected: String,
    },

    #[error("Column {column} row {row}: value of {len} bytes exceeds capacity {capacity}")]
    ValueTooLong {
        column: String,
        row: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Column {column} row {row}: value out of range for column type")]
    OutOfRange { column: String, row: usize },

    #[error("Timed out after {0:?} waiting for buffer lock")]
    LockTimeout(Duration),

    #[error("Buffer has been destroyed")]
    Destroyed,

    #[error("Corrupted buffer: {0}")]
    Corrupted(String),
}

/// Errors produced by an operation running inside an execution unit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Column {0} not found")]
    ColumnNotFound(String),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// Unrecoverable unit state (e.g. a corrupted shared buffer read).
    #[error("Fatal unit error: {0}")]
    Fatal(String),
}

impl OperationError {
    /// Stable code carried on the error response.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "VALIDATION_ERROR",
            Self::InvalidPattern { .. } => "INVALID_PATTERN",
            Self::ColumnNotFound(_) => "COLUMN_NOT_FOUND",
            Self::UnsupportedCompression(_) => "VALIDATION_ERROR",
            Self::Export(_) => "EXPORT_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Fatal(_) => "WORKER_RUNTIME_ERROR",
        }
    }

    /// Whether this error takes the whole unit down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Convert into the wire error record.
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

impl From<BufferError> for OperationError {
    fn from(e: BufferError) -> Self {
        Self::Fatal(e.to_string())
    }
}

/// The error a caller's future rejects with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Execution unit failed to start: {reason}")]
    WorkerInit { reason: String },

    #[error("Task {id} timed out after {timeout:?}")]
    Timeout { id: TaskId, timeout: Duration },

    #[error("Execution unit failed while running task {id}: {reason}")]
    WorkerRuntime { id: TaskId, reason: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Task {id} was cancelled")]
    Cancelled { id: TaskId },

    #[error("Task queue is full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },

    #[error("Worker pool shut down before task {id} settled")]
    Shutdown { id: TaskId },

    #[error("{code}: {message}")]
    Operation { code: String, message: String },

    #[error("Operation returned an unexpected output kind: {0}")]
    UnexpectedOutput(String),
}

impl TaskError {
    /// Stable code, safe to display or log.
    pub fn code(&self) -> &str {
        match self {
            Self::WorkerInit { .. } => "WORKER_INIT_ERROR",
            Self::Timeout { .. } => "TASK_TIMEOUT",
            Self::WorkerRuntime { .. } => "WORKER_RUNTIME_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::Shutdown { .. } => "SHUTDOWN",
            Self::Operation { code, .. } => code,
            Self::UnexpectedOutput(_) => "UNEXPECTED_OUTPUT",
        }
    }

    /// Normalise an error response coming back from a unit.
    pub fn from_response(id: TaskId, info: ErrorInfo) -> Self {
        match info.code.as_str() {
            "CANCELLED" => Self::Cancelled { id },
            "VALIDATION_ERROR" => Self::Validation(info.message),
            "WORKER_RUNTIME_ERROR" => Self::WorkerRuntime {
                id,
                reason: info.message,
            },
            _ => Self::Operation {
                code: info.code,
                message: info.message,
            },
        }
    }

    /// Map a pool admission failure onto the caller-facing taxonomy.
    pub fn from_pool(id: TaskId, e: PoolError) -> Self {
        match e {
            PoolError::WorkerInit { reason } => Self::WorkerInit { reason },
            PoolError::QueueFull { capacity } => Self::QueueFull { capacity },
            PoolError::DuplicateTask { id } => {
                Self::Validation(format!("task id {id} is already in use"))
            }
            PoolError::ShutDown => Self::Shutdown { id },
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
