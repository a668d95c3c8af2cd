//! PARSE: raw rows into a typed table.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::table::{ColumnDef, ColumnType, Row, TabularResult};
use crate::wire::ParsePayload;

pub fn parse(
    payload: ParsePayload,
    ctx: &mut ExecutionContext<'_>,
) -> Result<TabularResult, OperationError> {
    ctx.set_stage("parsing");
    let total = payload.rows.len();
    let mut rows = Vec::with_capacity(total);

    for (i, raw) in payload.rows.into_iter().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        let row = match raw {
            Value::Object(map) => map,
            Value::Array(cells) => {
                let headers = payload.headers.as_ref().ok_or_else(|| {
                    OperationError::InvalidPayload(format!(
                        "row {i} is an array but no headers were given"
                    ))
                })?;
                let mut cells = cells.into_iter();
                headers
                    .iter()
                    .map(|h| (h.clone(), cells.next().unwrap_or(Value::Null)))
                    .collect::<Row>()
            }
            other => {
                return Err(OperationError::InvalidPayload(format!(
                    "row {i} is neither an object nor an array: {other}"
                )));
            }
        };
        rows.push(row);
    }

    let columns = match payload.columns {
        Some(columns) => columns,
        None => {
            let names = match payload.headers {
                Some(headers) => headers,
                None => column_names(&rows),
            };
            let sample = payload.sample_size.unwrap_or(rows.len()).min(rows.len());
            names
                .into_iter()
                .map(|name| {
                    let t = infer_type(rows[..sample].iter().map(|r| r.get(&name)));
                    ColumnDef::new(name, t)
                })
                .collect()
        }
    };

    ctx.finish(total);
    Ok(TabularResult::new(columns, rows).with_row_count())
}

/// Keys in first-seen order across all rows.
fn column_names(rows: &[Row]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !names.iter().any(|n| n == key) {
                names.push(key.clone());
            }
        }
    }
    names
}

/// Type of a single non-null cell.
pub fn classify(value: &Value) -> ColumnType {
    match value {
        Value::Null => ColumnType::Unknown,
        Value::Bool(_) => ColumnType::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
        Value::Number(_) => ColumnType::Float,
        Value::String(s) => {
            if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                ColumnType::Date
            } else if DateTime::parse_from_rfc3339(s).is_ok() {
                ColumnType::Datetime
            } else {
                ColumnType::String
            }
        }
        Value::Object(_) => ColumnType::Json,
        Value::Array(_) => ColumnType::Array,
    }
}

/// Common type of the non-null cells. Integers widen to float; any other
/// mix is a string column.
pub fn infer_type<'v>(cells: impl Iterator<Item = Option<&'v Value>>) -> ColumnType {
    let mut seen: Option<ColumnType> = None;
    for cell in cells.flatten() {
        if cell.is_null() {
            continue;
        }
        let t = classify(cell);
        seen = Some(match (seen, t) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::Integer), ColumnType::Float)
            | (Some(ColumnType::Float), ColumnType::Integer) => ColumnType::Float,
            _ => return ColumnType::String,
        });
    }
    seen.unwrap_or(ColumnType::Unknown)
}
