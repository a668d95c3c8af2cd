//! Shared buffer creation and whole-table transfer.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::codec::{CellWrite, Overflow, encodes_exactly};
use super::layout::{BufferLayout, METADATA_SIZE, ROWS_OFFSET};
use super::region::Region;
use crate::error::BufferError;
use crate::table::{ColumnDef, Row, TabularResult};

/// Knobs applied to every buffer a manager creates.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferOptions {
    /// Byte capacity of each string slot.
    pub string_capacity: usize,
    pub overflow: Overflow,
    /// Overall deadline for acquiring the lock byte.
    pub lock_timeout: Duration,
    /// Largest buffer the manager will allocate.
    pub max_bytes: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            string_capacity: 256,
            overflow: Overflow::Truncate,
            lock_timeout: Duration::from_secs(5),
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Outcome of [`SharedBuffer::write_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteReport {
    pub rows_written: usize,
    /// String cells cut to fit their slot.
    pub truncated_cells: usize,
}

/// Creates shared buffers.
#[derive(Debug, Default)]
pub struct SharedBufferManager {
    options: BufferOptions,
    created: AtomicU64,
}

impl SharedBufferManager {
    pub fn new(options: BufferOptions) -> Self {
        Self {
            options,
            created: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    /// Number of buffers created so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Allocate a zeroed buffer for `row_count` rows of `columns`.
    pub fn create_buffer(
        &self,
        row_count: usize,
        columns: &[ColumnDef],
    ) -> Result<SharedBuffer, BufferError> {
        let layout =
            BufferLayout::compute(row_count, columns, self.options.string_capacity)?;
        if layout.total_size > self.options.max_bytes {
            return Err(BufferError::InvalidLayout(format!(
                "{} bytes requested, limit is {}",
                layout.total_size, self.options.max_bytes
            )));
        }

        let region = Region::zeroed(layout.total_size);
        region.write(0, &layout.encode())?;
        self.created.fetch_add(1, Ordering::Relaxed);

        debug!(
            rows = row_count,
            columns = columns.len(),
            bytes = layout.total_size,
            "Created shared buffer"
        );

        Ok(SharedBuffer {
            region: Arc::new(region),
            layout: Arc::new(layout),
            options: self.options.clone(),
        })
    }
}

/// A fixed-layout region holding one table. Clones share the same bytes.
#[derive(Clone)]
pub struct SharedBuffer {
    region: Arc<Region>,
    layout: Arc<BufferLayout>,
    options: BufferOptions,
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("bytes", &self.layout.total_size)
            .field("row_capacity", &self.layout.row_capacity)
            .field("columns", &self.layout.column_count())
            .field("destroyed", &self.region.is_destroyed())
            .finish()
    }
}

impl SharedBuffer {
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn byte_size(&self) -> usize {
        self.layout.total_size
    }

    pub fn is_destroyed(&self) -> bool {
        self.region.is_destroyed()
    }

    /// Whether some holder currently owns the lock byte.
    pub fn is_locked(&self) -> bool {
        self.region.is_locked()
    }

    fn ensure_live(&self) -> Result<(), BufferError> {
        if self.region.is_destroyed() {
            return Err(BufferError::Destroyed);
        }
        Ok(())
    }

    fn read_row_count(&self) -> Result<usize, BufferError> {
        let b = self.region.read(ROWS_OFFSET, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    /// Rebuild the layout from the metadata region alone.
    pub fn persisted_layout(&self) -> Result<BufferLayout, BufferError> {
        self.ensure_live()?;
        let _guard = self.region.lock(self.options.lock_timeout)?;
        BufferLayout::from_region(&self.region)
    }

    /// Rows populated by the last write.
    pub fn row_count(&self) -> Result<usize, BufferError> {
        self.ensure_live()?;
        let _guard = self.region.lock(self.options.lock_timeout)?;
        self.read_row_count()
    }

    /// Pack `table` into the buffer. Columns must match the layout by position.
    pub fn write_data(&self, table: &TabularResult) -> Result<WriteReport, BufferError> {
        self.ensure_live()?;
        self.layout.check_columns(&table.columns)?;
        if table.rows.len() > self.layout.row_capacity {
            return Err(BufferError::CapacityExceeded {
                rows: table.rows.len(),
                capacity: self.layout.row_capacity,
            });
        }

        let _guard = self.region.lock(self.options.lock_timeout)?;
        // The row count is published last; a failed write leaves it at zero.
        self.region.write(ROWS_OFFSET, &0u32.to_le_bytes())?;

        let mut report = WriteReport::default();
        for (row_index, row) in table.rows.iter().enumerate() {
            for (col_index, def) in table.columns.iter().enumerate() {
                let value = row.get(&def.name).unwrap_or(&Value::Null);
                let written = self
                    .layout
                    .write_column_value(
                        &self.region,
                        col_index,
                        row_index,
                        value,
                        self.options.overflow,
                    )
                    .map_err(|e| name_column(e, &def.name))?;
                if written == CellWrite::Truncated {
                    report.truncated_cells += 1;
                }
            }
            report.rows_written += 1;
        }

        self.region
            .write(ROWS_OFFSET, &(report.rows_written as u32).to_le_bytes())?;

        if report.truncated_cells > 0 {
            warn!(
                truncated = report.truncated_cells,
                capacity = self.layout.string_capacity,
                "Shared buffer write truncated string cells"
            );
        }
        Ok(report)
    }

    /// Unpack the populated rows. The layout is re-read from the region header.
    pub fn read_data(&self, columns: &[ColumnDef]) -> Result<TabularResult, BufferError> {
        self.ensure_live()?;
        let _guard = self.region.lock(self.options.lock_timeout)?;

        let layout = BufferLayout::from_region(&self.region)?;
        layout.check_columns(columns)?;
        let populated = self.read_row_count()?;
        if populated > layout.row_capacity {
            return Err(BufferError::Corrupted(format!(
                "{populated} rows recorded, capacity is {}",
                layout.row_capacity
            )));
        }

        let mut rows = Vec::with_capacity(populated);
        for row_index in 0..populated {
            let mut row = Row::new();
            for (col_index, def) in columns.iter().enumerate() {
                let value = layout
                    .read_column_value(&self.region, col_index, row_index)
                    .map_err(|e| name_column(e, &def.name))?;
                row.insert(def.name.clone(), value);
            }
            rows.push(row);
        }
        Ok(TabularResult::new(columns.to_vec(), rows).with_row_count())
    }

    /// Read one cell through the layout's typed accessor.
    pub fn read_value(&self, column: usize, row: usize) -> Result<Value, BufferError> {
        self.ensure_live()?;
        let _guard = self.region.lock(self.options.lock_timeout)?;
        self.layout.read_column_value(&self.region, column, row)
    }

    /// Write one cell through the layout's typed accessor. Does not change the
    /// populated row count.
    pub fn write_value(&self, column: usize, row: usize, value: &Value) -> Result<(), BufferError> {
        self.ensure_live()?;
        let _guard = self.region.lock(self.options.lock_timeout)?;
        self.layout
            .write_column_value(&self.region, column, row, value, self.options.overflow)?;
        Ok(())
    }

    /// Zero every column area and reset the row count.
    pub fn clear(&self) -> Result<(), BufferError> {
        self.ensure_live()?;
        let _guard = self.region.lock(self.options.lock_timeout)?;
        self.region.fill(
            METADATA_SIZE,
            self.layout.total_size - METADATA_SIZE,
            0,
        )?;
        self.region.write(ROWS_OFFSET, &0u32.to_le_bytes())
    }

    /// Release the buffer. Every later call on any clone returns `Destroyed`.
    pub fn destroy(&self) {
        self.region.mark_destroyed();
    }
}

/// Whether every row of `table` reads back from a buffer unchanged: each
/// row holds exactly the declared columns, and every cell survives its
/// column codec.
pub fn transfers_exactly(table: &TabularResult) -> bool {
    table.rows.iter().all(|row| {
        row.len() == table.columns.len()
            && table.columns.iter().all(|def| {
                row.get(&def.name)
                    .is_some_and(|value| encodes_exactly(def.column_type, value))
            })
    })
}

fn name_column(e: BufferError, name: &str) -> BufferError {
    match e {
        BufferError::TypeMismatch { row, expected, .. } => BufferError::TypeMismatch {
            column: name.to_string(),
            row,
            expected,
        },
        BufferError::ValueTooLong { row, len, capacity, .. } => BufferError::ValueTooLong {
            column: name.to_string(),
            row,
            len,
            capacity,
        },
        BufferError::OutOfRange { row, .. } => BufferError::OutOfRange {
            column: name.to_string(),
            row,
        },
        other => other,
    }
}
