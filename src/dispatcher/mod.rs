//! Task dispatcher: correlation ids, pending futures, timeouts, progress
//! routing and the typed operations callers use.
//!
//! - `client`: [`TaskDispatcher`] and [`SubmitOptions`]
//! - `pending`: the pending table and [`PendingTask`]
//! - `ops`: the [`TabularOperations`] trait

pub mod client;
pub mod ops;
pub mod pending;

pub use client::{SubmitOptions, TaskDispatcher};
pub use ops::TabularOperations;
pub use pending::{PendingTask, ProgressCallback};
