//! Configuration types.
//!
//! Every section has a `Default`; [`Config::from_env`] overlays `GRIDPOOL_*`
//! environment variables. Unparsable values fall back to the default.

use std::path::PathBuf;
use std::time::Duration;

use crate::buffer::BufferOptions;
use crate::error::ConfigError;
use crate::runtime::{CheckpointPolicy, UnitSettings};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Units kept alive even when idle.
    pub min_workers: usize,
    /// Hard ceiling on concurrently live units.
    pub max_workers: usize,
    /// Tasks allowed to wait for a unit before admission fails.
    pub max_queue_size: usize,
    /// Idle time after which a unit above `min_workers` is reaped.
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// Requeues allowed when the unit running a task dies.
    pub max_retries: u32,
    /// Upper bound on joining each unit thread at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            min_workers: 1,
            max_workers: cores.max(2),
            max_queue_size: 1000,
            idle_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(5),
            max_retries: 0,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Task dispatcher configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Timeout applied when a submission does not set its own.
    pub default_timeout: Duration,
    /// Input tables with at least this many rows travel through a shared buffer.
    pub shared_buffer_threshold: usize,
    /// Record every settlement to the performance monitor.
    pub record_metrics: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            shared_buffer_threshold: 10_000,
            record_metrics: true,
        }
    }
}

/// Execution runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Rows between cancellation checks.
    pub chunk_size: usize,
    pub progress_interval: Duration,
    /// Reported on responses as the memory limit.
    pub memory_limit: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let policy = CheckpointPolicy::default();
        Self {
            chunk_size: policy.chunk_size,
            progress_interval: policy.progress_interval,
            memory_limit: None,
        }
    }
}

impl RuntimeConfig {
    pub fn policy(&self) -> CheckpointPolicy {
        CheckpointPolicy {
            chunk_size: self.chunk_size,
            progress_interval: self.progress_interval,
        }
    }

    pub fn unit_settings(&self) -> UnitSettings {
        UnitSettings {
            policy: self.policy(),
            memory_limit: self.memory_limit,
        }
    }
}

/// Performance monitor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Ring capacity; the oldest snapshot is evicted first.
    pub max_snapshots: usize,
    /// Trailing window of [`crate::monitor::PerformanceMonitor::realtime_metrics`].
    pub realtime_window: Duration,
    /// Width of one time-series bucket in reports.
    pub bucket_width: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 1000,
            realtime_window: Duration::from_secs(5),
            bucket_width: Duration::from_secs(1),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub default_filter: Option<String>,
    /// Also write a daily-rotated log file here.
    pub directory: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
            default_filter: None,
            directory: std::env::var("GRIDPOOL_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Full gridpool configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub pool: PoolConfig,
    pub dispatcher: DispatcherConfig,
    pub runtime: RuntimeConfig,
    pub monitor: MonitorConfig,
    pub buffer: BufferOptions,
}

impl Config {
    /// Build config from `GRIDPOOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let millis = |key: &str| num(key).map(Duration::from_millis);

        let mut config = Self::default();

        let pool = &mut config.pool;
        if let Some(v) = num("GRIDPOOL_MIN_WORKERS") {
            pool.min_workers = v as usize;
        }
        if let Some(v) = num("GRIDPOOL_MAX_WORKERS") {
            pool.max_workers = v as usize;
        }
        if let Some(v) = num("GRIDPOOL_MAX_QUEUE") {
            pool.max_queue_size = v as usize;
        }
        if let Some(v) = millis("GRIDPOOL_IDLE_TIMEOUT_MS") {
            pool.idle_timeout = v;
        }
        if let Some(v) = millis("GRIDPOOL_REAP_INTERVAL_MS") {
            pool.reap_interval = v;
        }
        if let Some(v) = num("GRIDPOOL_MAX_RETRIES") {
            pool.max_retries = v.min(u32::MAX as u64) as u32;
        }

        if let Some(v) = millis("GRIDPOOL_TASK_TIMEOUT_MS") {
            config.dispatcher.default_timeout = v;
        }
        if let Some(v) = num("GRIDPOOL_SHARED_BUFFER_ROWS") {
            config.dispatcher.shared_buffer_threshold = v as usize;
        }

        if let Some(v) = num("GRIDPOOL_CHUNK_SIZE") {
            config.runtime.chunk_size = v as usize;
        }
        if let Some(v) = millis("GRIDPOOL_PROGRESS_INTERVAL_MS") {
            config.runtime.progress_interval = v;
        }
        config.runtime.memory_limit = num("GRIDPOOL_MEMORY_LIMIT");

        if let Some(v) = num("GRIDPOOL_MAX_SNAPSHOTS") {
            config.monitor.max_snapshots = v as usize;
        }
        if let Some(v) = num("GRIDPOOL_STRING_CAPACITY") {
            config.buffer.string_capacity = v as usize;
        }

        config
    }

    /// Reject combinations the pool and runtime cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.pool.max_workers == 0 {
            return Err(invalid("max_workers", "must be at least 1"));
        }
        if self.pool.min_workers > self.pool.max_workers {
            return Err(invalid(
                "min_workers",
                &format!(
                    "{} exceeds max_workers {}",
                    self.pool.min_workers, self.pool.max_workers
                ),
            ));
        }
        if self.pool.reap_interval.is_zero() {
            return Err(invalid("reap_interval", "must be non-zero"));
        }
        if self.dispatcher.default_timeout.is_zero() {
            return Err(invalid("default_timeout", "must be non-zero"));
        }
        if self.runtime.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be at least 1"));
        }
        if self.monitor.max_snapshots == 0 {
            return Err(invalid("max_snapshots", "must be at least 1"));
        }
        if self.monitor.bucket_width.is_zero() {
            return Err(invalid("bucket_width", "must be non-zero"));
        }
        if self.buffer.string_capacity == 0 {
            return Err(invalid("string_capacity", "must be at least 1"));
        }
        Ok(())
    }
}
