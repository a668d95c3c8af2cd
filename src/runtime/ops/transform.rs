//! TRANSFORM: per-cell rewrites, in place or into a new column.

use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::runtime::value::{as_number, display, format_timestamp, parse_timestamp};
use crate::table::{ColumnDef, ColumnType, Row, TabularResult};
use crate::wire::{TransformOp, TransformPayload, Transformation};

pub fn transform(
    payload: TransformPayload,
    ctx: &mut ExecutionContext<'_>,
) -> Result<TabularResult, OperationError> {
    ctx.set_stage("transforming");
    let TransformPayload {
        data,
        transformations,
    } = payload;
    let TabularResult {
        mut columns,
        mut rows,
        ..
    } = data;

    let mut steps = Vec::with_capacity(transformations.len());
    for t in &transformations {
        steps.push(Step::compile(t, &columns)?);
        // Later steps may read the column this one creates.
        let target = t.target_column.as_deref().unwrap_or(&t.column);
        let t_type = result_type(&t.operation);
        match columns.iter_mut().find(|c| c.name == target) {
            Some(existing) => existing.column_type = t_type,
            None => columns.push(ColumnDef::new(target, t_type)),
        }
    }

    let total = rows.len();
    for (i, row) in rows.iter_mut().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        for step in &steps {
            step.apply(row);
        }
    }

    ctx.finish(total);
    Ok(TabularResult::new(columns, rows).with_row_count())
}

fn result_type(op: &TransformOp) -> ColumnType {
    match op {
        TransformOp::Cast { to } => *to,
        TransformOp::Split { index: None, .. } => ColumnType::Array,
        _ => ColumnType::String,
    }
}

struct Step<'t> {
    t: &'t Transformation,
    regex: Option<Regex>,
}

impl<'t> Step<'t> {
    fn compile(t: &'t Transformation, columns: &[ColumnDef]) -> Result<Self, OperationError> {
        let known = |name: &str| columns.is_empty() || columns.iter().any(|c| c.name == name);
        if !known(t.column.as_str()) {
            return Err(OperationError::ColumnNotFound(t.column.clone()));
        }

        let mut regex = None;
        match &t.operation {
            TransformOp::Replace {
                pattern,
                regex: true,
                ..
            } => {
                regex = Some(Regex::new(pattern).map_err(|e| OperationError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?);
            }
            TransformOp::Concat { columns: extra, .. } => {
                if let Some(missing) = extra.iter().find(|c| !known(c.as_str())) {
                    return Err(OperationError::ColumnNotFound(missing.clone()));
                }
            }
            TransformOp::Split { separator, .. } if separator.is_empty() => {
                return Err(OperationError::InvalidPayload(
                    "split separator must not be empty".into(),
                ));
            }
            TransformOp::DateFormat { format, .. } => {
                if format_timestamp(&Utc::now(), format).is_none() {
                    return Err(OperationError::InvalidPayload(format!(
                        "invalid date format {format}"
                    )));
                }
            }
            _ => {}
        }
        Ok(Self { t, regex })
    }

    fn apply(&self, row: &mut Row) {
        let cell = row.get(&self.t.column).cloned().unwrap_or(Value::Null);
        let next = match &self.t.operation {
            TransformOp::Concat { columns, separator } => {
                let mut parts = vec![display(&cell)];
                parts.extend(
                    columns
                        .iter()
                        .map(|c| display(row.get(c).unwrap_or(&Value::Null))),
                );
                Value::String(parts.join(separator))
            }
            _ if cell.is_null() => Value::Null,
            op => self.apply_cell(op, cell),
        };
        let target = self.t.target_column.as_ref().unwrap_or(&self.t.column);
        row.insert(target.clone(), next);
    }

    fn apply_cell(&self, op: &TransformOp, cell: Value) -> Value {
        match op {
            TransformOp::Uppercase => Value::String(display(&cell).to_uppercase()),
            TransformOp::Lowercase => Value::String(display(&cell).to_lowercase()),
            TransformOp::Trim => Value::String(display(&cell).trim().to_string()),
            TransformOp::Replace {
                pattern,
                replacement,
                ..
            } => {
                let text = display(&cell);
                Value::String(match &self.regex {
                    Some(re) => re.replace_all(&text, replacement.as_str()).into_owned(),
                    None => text.replace(pattern.as_str(), replacement),
                })
            }
            TransformOp::Substring { start, length } => {
                let text = display(&cell);
                let chars = text.chars().skip(*start);
                Value::String(match length {
                    Some(n) => chars.take(*n).collect(),
                    None => chars.collect(),
                })
            }
            TransformOp::Split { separator, index } => {
                let text = display(&cell);
                let mut parts = text.split(separator.as_str());
                match index {
                    Some(i) => parts
                        .nth(*i)
                        .map(|p| Value::String(p.to_string()))
                        .unwrap_or(Value::Null),
                    None => Value::Array(parts.map(|p| Value::String(p.to_string())).collect()),
                }
            }
            TransformOp::DateFormat {
                format,
                input_format,
            } => parse_timestamp(&cell, input_format.as_deref())
                .and_then(|dt| format_timestamp(&dt, format))
                .map(Value::String)
                .unwrap_or(cell),
            TransformOp::NumberFormat {
                decimals,
                thousands_separator,
            } => as_number(&cell)
                .and_then(|n| format_number(n, *decimals, *thousands_separator))
                .map(Value::String)
                .unwrap_or(cell),
            TransformOp::Cast { to } => cast(cell, *to),
            TransformOp::Concat { .. } => cell,
        }
    }
}

/// Round half away from zero and group the integer digits.
pub fn format_number(n: f64, decimals: u32, separator: Option<char>) -> Option<String> {
    let d = Decimal::from_str(&n.to_string()).ok()?;
    let rounded = d.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
    let text = format!("{:.*}", decimals as usize, rounded);
    let Some(sep) = separator else {
        return Some(text);
    };

    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(sep);
        }
        grouped.push(c);
    }
    Some(match frac {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    })
}

/// Convert a cell to `to`. Values that cannot convert become null.
pub fn cast(cell: Value, to: ColumnType) -> Value {
    match to {
        ColumnType::Integer => match &cell {
            Value::Bool(b) => Value::from(i64::from(*b)),
            _ => as_number(&cell)
                .filter(|n| n.abs() < 9.0e15)
                .map(|n| Value::from(n.trunc() as i64))
                .unwrap_or(Value::Null),
        },
        ColumnType::Float => match &cell {
            Value::Bool(b) => crate::runtime::value::number(if *b { 1.0 } else { 0.0 }),
            _ => as_number(&cell)
                .map(crate::runtime::value::number)
                .unwrap_or(Value::Null),
        },
        ColumnType::Boolean => match &cell {
            Value::Bool(_) => cell,
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Value::Bool(true),
                "false" | "0" | "no" | "n" => Value::Bool(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        ColumnType::String => Value::String(display(&cell)),
        ColumnType::Date => parse_timestamp(&cell, None)
            .and_then(|dt| format_timestamp(&dt, "%Y-%m-%d"))
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnType::Datetime => parse_timestamp(&cell, None)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .unwrap_or(Value::Null),
        ColumnType::Json => match &cell {
            Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
            _ => cell,
        },
        ColumnType::Array => match cell {
            Value::Array(_) => cell,
            Value::String(ref s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => parsed,
                _ => Value::Array(vec![cell]),
            },
            other => Value::Array(vec![other]),
        },
        ColumnType::Unknown => cell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CheckpointPolicy;
    use crate::wire::TaskId;
    use serde_json::json;

    fn people() -> TabularResult {
        TabularResult::new(
            vec![
                ColumnDef::new("first", ColumnType::String),
                ColumnDef::new("last", ColumnType::String),
                ColumnDef::new("salary", ColumnType::Float),
                ColumnDef::new("born", ColumnType::String),
            ],
            [
                json!({"first": "  ada ", "last": "Lovelace", "salary": 1234567.891, "born": "10/12/1815"}),
                json!({"first": null, "last": "Hopper", "salary": "n/a", "born": "09/12/1906"}),
            ]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect(),
        )
    }

    fn run(transformations: Vec<Transformation>) -> Result<TabularResult, OperationError> {
        let mut ctx = ExecutionContext::new(TaskId::new(), CheckpointPolicy::default());
        transform(
            TransformPayload {
                data: people(),
                transformations,
            },
            &mut ctx,
        )
    }

    #[test]
    fn steps_apply_in_order() {
        let result = run(vec![
            Transformation::new("first", TransformOp::Trim),
            Transformation::new("first", TransformOp::Uppercase),
        ])
        .unwrap();
        assert_eq!(result.rows[0]["first"], json!("ADA"));
        assert_eq!(result.rows[1]["first"], Value::Null);
    }

    #[test]
    fn substring_counts_characters() {
        let result = run(vec![
            Transformation::new(
                "last",
                TransformOp::Substring {
                    start: 2,
                    length: Some(3),
                },
            )
            .into_column("mid"),
            Transformation::new(
                "last",
                TransformOp::Substring {
                    start: 4,
                    length: None,
                },
            )
            .into_column("tail"),
        ])
        .unwrap();
        assert_eq!(result.rows[0]["mid"], json!("vel"));
        assert_eq!(result.rows[0]["tail"], json!("lace"));
        assert_eq!(result.rows[1]["mid"], json!("ppe"));
        assert_eq!(result.rows[1]["tail"], json!("er"));
    }

    #[test]
    fn target_column_is_materialised() {
        let result = run(vec![
            Transformation::new(
                "last",
                TransformOp::Concat {
                    columns: vec!["first".into()],
                    separator: ", ".into(),
                },
            )
            .into_column("display"),
        ])
        .unwrap();
        assert!(result.has_column("display"));
        assert_eq!(result.rows[0]["display"], json!("Lovelace,   ada "));
        assert_eq!(result.rows[1]["display"], json!("Hopper, "));
        assert_eq!(result.rows[0]["last"], json!("Lovelace"));
    }

    #[test]
    fn number_format_rounds_and_groups() {
        let result = run(vec![Transformation::new(
            "salary",
            TransformOp::NumberFormat {
                decimals: 2,
                thousands_separator: Some(','),
            },
        )])
        .unwrap();
        assert_eq!(result.rows[0]["salary"], json!("1,234,567.89"));
        assert_eq!(result.rows[1]["salary"], json!("n/a"));

        assert_eq!(format_number(2.675, 2, None).as_deref(), Some("2.68"));
        assert_eq!(format_number(-1234.5, 0, Some('.')).as_deref(), Some("-1.235"));
        assert_eq!(format_number(999.0, 1, Some(',')).as_deref(), Some("999.0"));
    }

    #[test]
    fn date_format_with_input_pattern() {
        let result = run(vec![Transformation::new(
            "born",
            TransformOp::DateFormat {
                format: "%Y-%m-%d".into(),
                input_format: Some("%d/%m/%Y".into()),
            },
        )])
        .unwrap();
        assert_eq!(result.rows[0]["born"], json!("1815-12-10"));
    }

    #[test]
    fn regex_replace_and_split() {
        let result = run(vec![
            Transformation::new(
                "last",
                TransformOp::Replace {
                    pattern: "[aeiou]".into(),
                    replacement: "_".into(),
                    regex: true,
                },
            ),
            Transformation::new(
                "born",
                TransformOp::Split {
                    separator: "/".into(),
                    index: Some(2),
                },
            )
            .into_column("year"),
        ])
        .unwrap();
        assert_eq!(result.rows[0]["last"], json!("L_v_l_c_"));
        assert_eq!(result.rows[1]["year"], json!("1906"));
    }

    #[test]
    fn substring_counts_chars() {
        let t = Transformation::new(
            "last",
            TransformOp::Substring {
                start: 1,
                length: Some(3),
            },
        );
        let result = run(vec![t]).unwrap();
        assert_eq!(result.rows[1]["last"], json!("opp"));
    }

    #[test]
    fn casts() {
        assert_eq!(cast(json!("42.9"), ColumnType::Integer), json!(42));
        assert_eq!(cast(json!("yes"), ColumnType::Boolean), json!(true));
        assert_eq!(cast(json!("x"), ColumnType::Float), Value::Null);
        assert_eq!(cast(json!(7), ColumnType::String), json!("7"));
        assert_eq!(cast(json!("[1,2]"), ColumnType::Array), json!([1, 2]));
        assert_eq!(
            cast(json!("2024-01-02T03:04:05Z"), ColumnType::Date),
            json!("2024-01-02")
        );
    }

    #[test]
    fn cast_updates_column_type() {
        let result = run(vec![Transformation::new(
            "salary",
            TransformOp::Cast {
                to: ColumnType::Integer,
            },
        )])
        .unwrap();
        assert_eq!(
            result.column("salary").map(|c| c.column_type),
            Some(ColumnType::Integer)
        );
        assert_eq!(result.rows[0]["salary"], json!(1234567));
        assert_eq!(result.rows[1]["salary"], Value::Null);
    }

    #[test]
    fn invalid_regex_is_reported() {
        let err = run(vec![Transformation::new(
            "last",
            TransformOp::Replace {
                pattern: "(".into(),
                replacement: String::new(),
                regex: true,
            },
        )])
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_PATTERN");
    }
}
