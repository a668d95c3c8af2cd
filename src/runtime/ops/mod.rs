//! One function per operation tag.

pub mod aggregate;
pub mod export;
pub mod filter;
pub mod parse;
pub mod sort;
pub mod statistics;
pub mod transform;
pub mod validate;

pub use aggregate::aggregate;
pub use export::{ExportFormat, escape_csv_field, export};
pub use filter::{RowPredicate, filter};
pub use parse::parse;
pub use sort::sort;
pub use statistics::statistics;
pub use transform::transform;
pub use validate::validate;
