//! Cell codecs: JSON values to and from the fixed-width column areas.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

use super::layout::{BufferLayout, ColumnSlot, METADATA_SIZE, STRING_PREFIX, Storage};
use super::region::Region;
use crate::error::BufferError;
use crate::table::ColumnType;

/// What to do with a string longer than the slot capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Cut at the last char boundary that fits, and count it.
    #[default]
    Truncate,
    /// Reject the write.
    Error,
}

/// Result of writing one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellWrite {
    Stored,
    Truncated,
}

/// Milliseconds since the epoch for a date or datetime cell.
pub fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(dt.and_utc().timestamp_millis());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn render_timestamp(column_type: ColumnType, millis: i64) -> Option<Value> {
    let dt = DateTime::<Utc>::from_timestamp_millis(millis)?;
    let text = match column_type {
        ColumnType::Date => dt.format("%Y-%m-%d").to_string(),
        _ => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    Some(Value::String(text))
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_at_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn mismatch(index: usize, row: usize, expected: &str) -> BufferError {
    BufferError::TypeMismatch {
        column: format!("#{index}"),
        row,
        expected: expected.to_string(),
    }
}

fn set_bit(region: &Region, base: usize, row: usize, on: bool) -> Result<(), BufferError> {
    let at = base + row / 8;
    let mask = 1u8 << (row % 8);
    let byte = region.read_byte(at)?;
    let next = if on { byte | mask } else { byte & !mask };
    region.write_byte(at, next)
}

fn get_bit(region: &Region, base: usize, row: usize) -> Result<bool, BufferError> {
    Ok(region.read_byte(base + row / 8)? & (1u8 << (row % 8)) != 0)
}

impl BufferLayout {
    /// Rebuild the layout from the metadata stored in the region itself.
    pub(crate) fn from_region(region: &Region) -> Result<Self, BufferError> {
        let meta = region.read(0, METADATA_SIZE)?;
        let layout = Self::decode(&meta)?;
        if layout.total_size != region.len() {
            return Err(BufferError::Corrupted(format!(
                "header declares {} bytes, region has {}",
                layout.total_size,
                region.len()
            )));
        }
        Ok(layout)
    }

    /// Encode `value` into column `index` at `row`. The caller holds the lock.
    pub(crate) fn write_column_value(
        &self,
        region: &Region,
        index: usize,
        row: usize,
        value: &Value,
        overflow: Overflow,
    ) -> Result<CellWrite, BufferError> {
        let slot = *self.slot(index, row)?;
        if value.is_null() {
            set_bit(region, slot.validity_offset(), row, false)?;
            return Ok(CellWrite::Stored);
        }

        let outcome = match slot.storage() {
            Storage::Int32 => {
                let n = int_value(value).ok_or_else(|| mismatch(index, row, "integer"))?;
                let n = i32::try_from(n).map_err(|_| BufferError::OutOfRange {
                    column: format!("#{index}"),
                    row,
                })?;
                region.write(fixed_at(&slot, row), &n.to_le_bytes())?;
                CellWrite::Stored
            }
            Storage::Float64 => {
                let n = value.as_f64().ok_or_else(|| mismatch(index, row, "float"))?;
                region.write(fixed_at(&slot, row), &n.to_le_bytes())?;
                CellWrite::Stored
            }
            Storage::Timestamp => {
                let ms = timestamp_millis(value)
                    .ok_or_else(|| mismatch(index, row, &slot.column_type.to_string()))?;
                region.write(fixed_at(&slot, row), &ms.to_le_bytes())?;
                CellWrite::Stored
            }
            Storage::Bit => {
                let b = value.as_bool().ok_or_else(|| mismatch(index, row, "boolean"))?;
                set_bit(region, slot.data_offset(), row, b)?;
                CellWrite::Stored
            }
            Storage::Text => {
                let s = value.as_str().ok_or_else(|| mismatch(index, row, "string"))?;
                self.write_text(region, &slot, index, row, s, overflow)?
            }
            Storage::JsonText => {
                let encoded = serde_json::to_string(value)
                    .map_err(|e| BufferError::Corrupted(e.to_string()))?;
                // Truncated JSON would not decode, so it never truncates.
                self.write_text(region, &slot, index, row, &encoded, Overflow::Error)?
            }
        };

        set_bit(region, slot.validity_offset(), row, true)?;
        Ok(outcome)
    }

    fn write_text(
        &self,
        region: &Region,
        slot: &ColumnSlot,
        index: usize,
        row: usize,
        s: &str,
        overflow: Overflow,
    ) -> Result<CellWrite, BufferError> {
        let capacity = self.string_capacity;
        let (stored, outcome) = if s.len() <= capacity {
            (s, CellWrite::Stored)
        } else if overflow == Overflow::Truncate {
            (truncate_at_boundary(s, capacity), CellWrite::Truncated)
        } else {
            return Err(BufferError::ValueTooLong {
                column: format!("#{index}"),
                row,
                len: s.len(),
                capacity,
            });
        };

        let at = fixed_at(slot, row);
        region.write(at, &(stored.len() as u32).to_le_bytes())?;
        region.write(at + STRING_PREFIX, stored.as_bytes())?;
        Ok(outcome)
    }

    /// Decode column `index` at `row`. The caller holds the lock.
    pub(crate) fn read_column_value(
        &self,
        region: &Region,
        index: usize,
        row: usize,
    ) -> Result<Value, BufferError> {
        let slot = *self.slot(index, row)?;
        if !get_bit(region, slot.validity_offset(), row)? {
            return Ok(Value::Null);
        }

        let at = fixed_at(&slot, row);
        let value = match slot.storage() {
            Storage::Int32 => {
                let b = region.read(at, 4)?;
                Value::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            Storage::Float64 => {
                let n = f64::from_le_bytes(eight(&region.read(at, 8)?));
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
            Storage::Timestamp => {
                let ms = i64::from_le_bytes(eight(&region.read(at, 8)?));
                render_timestamp(slot.column_type, ms).ok_or_else(|| {
                    BufferError::Corrupted(format!("timestamp {ms} out of range in column #{index}"))
                })?
            }
            Storage::Bit => Value::Bool(get_bit(region, slot.data_offset(), row)?),
            Storage::Text => Value::String(self.read_text(region, &slot, index, row)?),
            Storage::JsonText => {
                let text = self.read_text(region, &slot, index, row)?;
                serde_json::from_str(&text).map_err(|e| {
                    BufferError::Corrupted(format!("column #{index} row {row}: {e}"))
                })?
            }
        };
        Ok(value)
    }

    fn read_text(
        &self,
        region: &Region,
        slot: &ColumnSlot,
        index: usize,
        row: usize,
    ) -> Result<String, BufferError> {
        let at = fixed_at(slot, row);
        let p = region.read(at, STRING_PREFIX)?;
        let len = u32::from_le_bytes([p[0], p[1], p[2], p[3]]) as usize;
        if len > self.string_capacity {
            return Err(BufferError::Corrupted(format!(
                "column #{index} row {row}: length {len} exceeds slot capacity"
            )));
        }
        String::from_utf8(region.read(at + STRING_PREFIX, len)?).map_err(|_| {
            BufferError::Corrupted(format!("column #{index} row {row}: invalid UTF-8"))
        })
    }
}

fn fixed_at(slot: &ColumnSlot, row: usize) -> usize {
    slot.data_offset() + row * slot.element_size
}

fn eight(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[..8]);
    out
}

/// Whether `value` decodes back unchanged from a column of `column_type`.
/// Strings are assumed to fit their slot.
pub fn encodes_exactly(column_type: ColumnType, value: &Value) -> bool {
    if value.is_null() {
        return true;
    }
    match Storage::for_type(column_type) {
        Storage::Int32 => {
            (value.is_i64() || value.is_u64())
                && value.as_i64().is_some_and(|n| i32::try_from(n).is_ok())
        }
        Storage::Float64 => value.is_f64(),
        Storage::Timestamp => {
            value.is_string()
                && timestamp_millis(value)
                    .and_then(|ms| render_timestamp(column_type, ms))
                    .is_some_and(|rendered| &rendered == value)
        }
        Storage::Bit => value.is_boolean(),
        Storage::Text => value.is_string(),
        Storage::JsonText => serde_json::to_string(value)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .is_some_and(|decoded| &decoded == value),
    }
}

fn int_value(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|f| f.fract() == 0.0 && f.is_finite())
        .map(|f| f as i64)
}
