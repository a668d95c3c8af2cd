//! Cell value helpers shared by the operations.

use std::cmp::Ordering;
use std::fmt::Write;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::buffer::timestamp_millis;

/// Numeric view of a cell: numbers, and strings that parse as numbers.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                t.parse::<f64>().ok().filter(|f| f.is_finite())
            }
        }
        _ => None,
    }
}

/// Strict numeric view: only JSON numbers.
pub fn as_json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Text of a cell as a user would see it. Null renders empty.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Key identifying equal values, for distinct counts and grouping.
pub fn distinct_key(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("n:{}", f as i64),
            Some(f) => format!("n:{f}"),
            None => format!("n:{n}"),
        },
        Value::String(s) => format!("s:{s}"),
        other => other.to_string(),
    }
}

/// Null or empty string.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Total order over cells. Types rank first (null, booleans, numbers,
/// strings, arrays, objects); within a type numbers compare numerically,
/// strings lexically, booleans false < true, and the rest by their text.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    type_rank(a).cmp(&type_rank(b)).then_with(|| match (a, b) {
        (Value::Number(_), Value::Number(_)) => cmp_f64(as_number(a), as_number(b)),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    })
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Like [`compare`], but numeric-looking strings compare as numbers.
pub fn compare_numeric(a: &Value, b: &Value) -> Ordering {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => cmp_f64(Some(x), Some(y)),
        // Numbers sort before text.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => compare(a, b),
    }
}

fn cmp_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// Equality used by filters: numeric when both sides are numeric, otherwise
/// by text, optionally ignoring case.
pub fn loosely_equal(cell: &Value, target: &Value, case_insensitive: bool) -> bool {
    if let (Some(x), Some(y)) = (as_number(cell), as_number(target)) {
        if cell.is_number() || target.is_number() {
            return x == y;
        }
    }
    if let (Value::Bool(x), Value::Bool(y)) = (cell, target) {
        return x == y;
    }
    let (x, y) = (display(cell), display(target));
    if case_insensitive {
        x.to_lowercase() == y.to_lowercase()
    } else {
        x == y
    }
}

/// Ordering used by range filters: numeric when both sides are numeric.
pub fn order_against(cell: &Value, target: &Value) -> Option<Ordering> {
    match (as_number(cell), as_number(target)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(display(cell).cmp(&display(target))),
    }
}

/// Render a timestamp with a strftime pattern. `None` for invalid patterns.
pub fn format_timestamp(dt: &DateTime<Utc>, pattern: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", dt.format(pattern)).ok()?;
    Some(out)
}

/// Parse a date or datetime cell, optionally with an explicit input pattern.
pub fn parse_timestamp(value: &Value, input_format: Option<&str>) -> Option<DateTime<Utc>> {
    if let (Some(pattern), Some(text)) = (input_format, value.as_str()) {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, pattern) {
            return Some(dt.and_utc());
        }
        return NaiveDate::parse_from_str(text, pattern)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());
    }
    timestamp_millis(value).and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// JSON value for an f64, or null when it is not finite.
pub fn number(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
