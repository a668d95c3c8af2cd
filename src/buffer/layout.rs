//! Buffer layout: the offset/size table for every column, persisted in a
//! fixed metadata region at the start of the buffer.
//!
//! ```text
//! 0      magic "GRDP" (u32 LE)
//! 4      version (u16 LE)
//! 6      lock byte
//! 8      row capacity (u32)
//! 12     column count (u32)
//! 16     populated rows (u32)
//! 20     string capacity (u32)
//! 24     total size (u64)
//! 32..   column entries, 24 bytes each:
//!          type (u8), 3 reserved, element size (u32), offset (u64), size (u64)
//! ```
//!
//! Each column region starts with a validity bitmap (1 bit per row, padded to
//! 8 bytes) followed by the data area.

use crate::error::BufferError;
use crate::table::{ColumnDef, ColumnType};

pub const MAGIC: u32 = 0x4752_4450;
pub const VERSION: u16 = 1;
pub const MAX_COLUMNS: usize = 256;

pub(crate) const LOCK_OFFSET: usize = 6;
pub(crate) const ROWS_OFFSET: usize = 16;
const HEADER_SIZE: usize = 32;
const ENTRY_SIZE: usize = 24;

/// Bytes reserved for the header and the column table.
pub const METADATA_SIZE: usize = HEADER_SIZE + ENTRY_SIZE * MAX_COLUMNS;

/// Bytes per row for integer cells.
pub const INTEGER_WIDTH: usize = 4;
/// Bytes per row for float, date and datetime cells.
pub const WIDE_WIDTH: usize = 8;
/// Length prefix in front of every string slot.
pub const STRING_PREFIX: usize = 4;

fn align8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

fn bitmap_bytes(rows: usize) -> usize {
    rows.div_ceil(8)
}

fn type_code(t: ColumnType) -> u8 {
    match t {
        ColumnType::Integer => 1,
        ColumnType::Float => 2,
        ColumnType::Boolean => 3,
        ColumnType::String => 4,
        ColumnType::Date => 5,
        ColumnType::Datetime => 6,
        ColumnType::Json => 7,
        ColumnType::Array => 8,
        ColumnType::Unknown => 9,
    }
}

fn type_from_code(code: u8) -> Option<ColumnType> {
    Some(match code {
        1 => ColumnType::Integer,
        2 => ColumnType::Float,
        3 => ColumnType::Boolean,
        4 => ColumnType::String,
        5 => ColumnType::Date,
        6 => ColumnType::Datetime,
        7 => ColumnType::Json,
        8 => ColumnType::Array,
        9 => ColumnType::Unknown,
        _ => return None,
    })
}

/// Storage class of a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// i32, 4 bytes per row.
    Int32,
    /// f64, 8 bytes per row.
    Float64,
    /// i64 milliseconds since the epoch, 8 bytes per row.
    Timestamp,
    /// 1 bit per row.
    Bit,
    /// u32 length prefix plus a fixed-capacity UTF-8 slot.
    Text,
    /// JSON-encoded text in a string slot.
    JsonText,
}

impl Storage {
    pub fn for_type(t: ColumnType) -> Self {
        match t {
            ColumnType::Integer => Self::Int32,
            ColumnType::Float => Self::Float64,
            ColumnType::Date | ColumnType::Datetime => Self::Timestamp,
            ColumnType::Boolean => Self::Bit,
            ColumnType::String => Self::Text,
            ColumnType::Json | ColumnType::Array | ColumnType::Unknown => Self::JsonText,
        }
    }
}

/// Placement of one column inside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSlot {
    pub column_type: ColumnType,
    /// Bytes per row; 0 for bit-packed columns.
    pub element_size: usize,
    pub offset: usize,
    pub size: usize,
    rows: usize,
}

impl ColumnSlot {
    pub fn storage(&self) -> Storage {
        Storage::for_type(self.column_type)
    }

    pub fn validity_offset(&self) -> usize {
        self.offset
    }

    pub fn data_offset(&self) -> usize {
        self.offset + align8(bitmap_bytes(self.rows))
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// The offset/size table of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    pub total_size: usize,
    pub row_capacity: usize,
    pub string_capacity: usize,
    pub columns: Vec<ColumnSlot>,
}

impl BufferLayout {
    /// Assign offsets for `columns` in declaration order.
    pub fn compute(
        row_capacity: usize,
        columns: &[ColumnDef],
        string_capacity: usize,
    ) -> Result<Self, BufferError> {
        if columns.is_empty() {
            return Err(BufferError::InvalidLayout("no columns".into()));
        }
        if columns.len() > MAX_COLUMNS {
            return Err(BufferError::TooManyColumns {
                count: columns.len(),
                max: MAX_COLUMNS,
            });
        }
        if row_capacity == 0 {
            return Err(BufferError::InvalidLayout("row capacity is zero".into()));
        }
        if row_capacity > u32::MAX as usize || string_capacity > u32::MAX as usize {
            return Err(BufferError::InvalidLayout("capacity exceeds u32".into()));
        }

        let overflow = || BufferError::InvalidLayout("layout size overflows usize".into());
        let validity = align8(bitmap_bytes(row_capacity));
        let mut offset = METADATA_SIZE;
        let mut slots = Vec::with_capacity(columns.len());

        for def in columns {
            let storage = Storage::for_type(def.column_type);
            let element_size = match storage {
                Storage::Int32 => INTEGER_WIDTH,
                Storage::Float64 | Storage::Timestamp => WIDE_WIDTH,
                Storage::Bit => 0,
                Storage::Text | Storage::JsonText => STRING_PREFIX + string_capacity,
            };
            let data = match storage {
                Storage::Bit => bitmap_bytes(row_capacity),
                _ => row_capacity.checked_mul(element_size).ok_or_else(overflow)?,
            };
            let size = validity
                .checked_add(align8(data))
                .ok_or_else(overflow)?;
            slots.push(ColumnSlot {
                column_type: def.column_type,
                element_size,
                offset,
                size,
                rows: row_capacity,
            });
            offset = offset.checked_add(size).ok_or_else(overflow)?;
        }

        let layout = Self {
            total_size: offset,
            row_capacity,
            string_capacity,
            columns: slots,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Check that column ranges are disjoint and inside the buffer.
    pub fn validate(&self) -> Result<(), BufferError> {
        let mut ranges: Vec<(usize, usize)> =
            self.columns.iter().map(|c| (c.offset, c.end())).collect();
        ranges.sort_unstable();

        let mut prev_end = METADATA_SIZE;
        for (start, end) in ranges {
            if start < prev_end {
                return Err(BufferError::InvalidLayout(format!(
                    "column range starting at {start} overlaps previous range ending at {prev_end}"
                )));
            }
            if end > self.total_size {
                return Err(BufferError::InvalidLayout(format!(
                    "column range {start}..{end} exceeds buffer size {}",
                    self.total_size
                )));
            }
            prev_end = end;
        }
        Ok(())
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Slot for column `index`, with `row` checked against the capacity.
    pub fn slot(&self, index: usize, row: usize) -> Result<&ColumnSlot, BufferError> {
        let slot = self
            .columns
            .get(index)
            .ok_or_else(|| BufferError::ColumnNotFound(format!("#{index}")))?;
        if row >= self.row_capacity {
            return Err(BufferError::CapacityExceeded {
                rows: row + 1,
                capacity: self.row_capacity,
            });
        }
        Ok(slot)
    }

    /// Check a caller's column list against this layout, position by position.
    pub fn check_columns(&self, columns: &[ColumnDef]) -> Result<(), BufferError> {
        if columns.len() != self.columns.len() {
            return Err(BufferError::InvalidLayout(format!(
                "expected {} columns, got {}",
                self.columns.len(),
                columns.len()
            )));
        }
        for (def, slot) in columns.iter().zip(&self.columns) {
            if Storage::for_type(def.column_type) != slot.storage() {
                return Err(BufferError::InvalidLayout(format!(
                    "column {} is {} but the buffer stores {}",
                    def.name, def.column_type, slot.column_type
                )));
            }
        }
        Ok(())
    }

    /// Serialise header and column table (lock byte and row count left at zero).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; METADATA_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&(self.row_capacity as u32).to_le_bytes());
        out[12..16].copy_from_slice(&(self.columns.len() as u32).to_le_bytes());
        out[20..24].copy_from_slice(&(self.string_capacity as u32).to_le_bytes());
        out[24..32].copy_from_slice(&(self.total_size as u64).to_le_bytes());

        for (i, slot) in self.columns.iter().enumerate() {
            let base = HEADER_SIZE + i * ENTRY_SIZE;
            out[base] = type_code(slot.column_type);
            out[base + 4..base + 8].copy_from_slice(&(slot.element_size as u32).to_le_bytes());
            out[base + 8..base + 16].copy_from_slice(&(slot.offset as u64).to_le_bytes());
            out[base + 16..base + 24].copy_from_slice(&(slot.size as u64).to_le_bytes());
        }
        out
    }

    /// Rebuild a layout from the raw metadata region.
    pub fn decode(meta: &[u8]) -> Result<Self, BufferError> {
        if meta.len() < METADATA_SIZE {
            return Err(BufferError::Corrupted(format!(
                "metadata region is {} bytes, expected {METADATA_SIZE}",
                meta.len()
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([meta[at], meta[at + 1], meta[at + 2], meta[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&meta[at..at + 8]);
            u64::from_le_bytes(b)
        };

        if u32_at(0) != MAGIC {
            return Err(BufferError::Corrupted("bad magic".into()));
        }
        let version = u16::from_le_bytes([meta[4], meta[5]]);
        if version != VERSION {
            return Err(BufferError::Corrupted(format!("unsupported version {version}")));
        }

        let row_capacity = u32_at(8) as usize;
        let column_count = u32_at(12) as usize;
        let string_capacity = u32_at(20) as usize;
        let total_size = u64_at(24) as usize;
        if column_count == 0 || column_count > MAX_COLUMNS {
            return Err(BufferError::Corrupted(format!(
                "column count {column_count} out of range"
            )));
        }

        let mut columns = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let base = HEADER_SIZE + i * ENTRY_SIZE;
            let column_type = type_from_code(meta[base]).ok_or_else(|| {
                BufferError::Corrupted(format!("unknown type code {} in column {i}", meta[base]))
            })?;
            columns.push(ColumnSlot {
                column_type,
                element_size: u32_at(base + 4) as usize,
                offset: u64_at(base + 8) as usize,
                size: u64_at(base + 16) as usize,
                rows: row_capacity,
            });
        }

        let layout = Self {
            total_size,
            row_capacity,
            string_capacity,
            columns,
        };
        layout
            .validate()
            .map_err(|e| BufferError::Corrupted(e.to_string()))?;
        Ok(layout)
    }
}
