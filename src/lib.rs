//! gridpool: offload tabular operations onto a pool of execution units.

pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod runtime;
pub mod table;
pub mod wire;
pub mod worker;

pub use config::Config;
pub use dispatcher::{SubmitOptions, TabularOperations, TaskDispatcher};
pub use error::{Error, Result, TaskError};
