//! Worker pool: execution units, scheduling and recovery.
//!
//! - `state`: task and unit state machines
//! - `task`: task records owned by the pool
//! - `queue`: priority queue (priority descending, FIFO within a priority)
//! - `handle`: pool-side bookkeeping per unit
//! - `scheduler`: the pool actor and its handle

pub mod handle;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod task;

pub use handle::{UnitHandle, UnitInfo};
pub use queue::TaskQueue;
pub use scheduler::{PoolEvent, PoolHandle, PoolStats, SettleMetrics, TaskOutcome, WorkerPool};
pub use state::{StateTransition, TaskStatus, UnitStatus};
pub use task::Task;
