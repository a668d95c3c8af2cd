//! Shared buffer manager: tabular data packed into a fixed binary layout
//! that one producer writes and one consumer reads, guarded by a single
//! lock byte in the header.
//!
//! - `layout`: header, column table, offset computation
//! - `codec`: per-type cell encoding
//! - `region`: the byte region and its lock
//! - `manager`: buffer creation, whole-table write/read, clear, destroy

pub mod codec;
pub mod layout;
pub mod manager;
mod region;

pub use codec::{Overflow, encodes_exactly, timestamp_millis};
pub use layout::{BufferLayout, ColumnSlot, MAX_COLUMNS, METADATA_SIZE, Storage};
pub use manager::{
    BufferOptions, SharedBuffer, SharedBufferManager, WriteReport, transfers_exactly,
};
