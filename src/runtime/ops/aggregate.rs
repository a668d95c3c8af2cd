//! AGGREGATE: group-by with per-group reductions and `having` filters.

use std::collections::HashMap;

use serde_json::Value;

use super::filter::RowPredicate;
use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::runtime::value::{as_number, compare_numeric, distinct_key, number};
use crate::table::{ColumnDef, ColumnType, Row, TabularResult};
use crate::wire::{AggregateOp, AggregatePayload, AggregationSpec};

const KEY_SEPARATOR: char = '\u{1f}';

pub fn aggregate(
    payload: AggregatePayload,
    ctx: &mut ExecutionContext<'_>,
) -> Result<TabularResult, OperationError> {
    ctx.set_stage("aggregating");
    let AggregatePayload {
        data,
        group_by,
        aggregations,
        having,
    } = payload;

    check_request(&data, &group_by, &aggregations)?;

    // Groups in first-seen order.
    let total = data.rows.len();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<&Row>> = Vec::new();
    for (i, row) in data.rows.iter().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        let key = group_by
            .iter()
            .map(|c| distinct_key(row.get(c).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>()
            .join(&KEY_SEPARATOR.to_string());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(row);
    }
    if group_by.is_empty() && groups.is_empty() {
        groups.push(Vec::new());
    }

    let mut columns: Vec<ColumnDef> = group_by
        .iter()
        .map(|name| {
            let t = data
                .column(name)
                .map(|c| c.column_type)
                .unwrap_or(ColumnType::Unknown);
            ColumnDef::new(name.clone(), t)
        })
        .collect();
    columns.extend(
        aggregations
            .iter()
            .map(|spec| ColumnDef::new(spec.output_name(), output_type(spec, &data))),
    );

    let mut rows = Vec::with_capacity(groups.len());
    for members in &groups {
        let mut out = Row::new();
        if let Some(first) = members.first() {
            for name in &group_by {
                out.insert(name.clone(), first.get(name).cloned().unwrap_or(Value::Null));
            }
        }
        for spec in &aggregations {
            out.insert(spec.output_name(), reduce(spec, members));
        }
        rows.push(out);
    }

    if !having.is_empty() {
        let predicate = RowPredicate::compile(&having, &columns)?;
        rows.retain(|row| predicate.matches(row));
    }

    ctx.finish(total);
    let mut result = TabularResult::new(columns, rows).with_row_count();
    if let Some(meta) = result.metadata.as_mut() {
        meta.total_rows = Some(total);
    }
    Ok(result)
}

fn check_request(
    data: &TabularResult,
    group_by: &[String],
    aggregations: &[AggregationSpec],
) -> Result<(), OperationError> {
    let known = |name: &str| data.columns.is_empty() || data.has_column(name);
    for name in group_by {
        if !known(name.as_str()) {
            return Err(OperationError::ColumnNotFound(name.clone()));
        }
    }
    if aggregations.is_empty() {
        return Err(OperationError::InvalidPayload(
            "at least one aggregation is required".into(),
        ));
    }
    for spec in aggregations {
        match (&spec.column, spec.operation) {
            (Some(c), _) if !known(c.as_str()) => {
                return Err(OperationError::ColumnNotFound(c.clone()));
            }
            (None, op) if op != AggregateOp::Count => {
                return Err(OperationError::InvalidPayload(format!(
                    "{} needs a column",
                    op.as_str()
                )));
            }
            _ => {}
        }
        if spec.operation == AggregateOp::Percentile {
            match spec.percentile {
                Some(p) if (0.0..=100.0).contains(&p) => {}
                _ => {
                    return Err(OperationError::InvalidPayload(
                        "percentile must be between 0 and 100".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn output_type(spec: &AggregationSpec, data: &TabularResult) -> ColumnType {
    match spec.operation {
        AggregateOp::Count | AggregateOp::CountDistinct => ColumnType::Integer,
        AggregateOp::Min | AggregateOp::Max | AggregateOp::Mode => spec
            .column
            .as_deref()
            .and_then(|c| data.column(c))
            .map(|c| c.column_type)
            .unwrap_or(ColumnType::Unknown),
        _ => ColumnType::Float,
    }
}

fn reduce(spec: &AggregationSpec, members: &[&Row]) -> Value {
    let Some(column) = spec.column.as_deref() else {
        return Value::from(members.len());
    };
    let cells: Vec<&Value> = members
        .iter()
        .filter_map(|r| r.get(column))
        .filter(|v| !v.is_null())
        .collect();
    let numbers = || cells.iter().filter_map(|v| as_number(v)).collect::<Vec<f64>>();

    match spec.operation {
        AggregateOp::Count => Value::from(cells.len()),
        AggregateOp::CountDistinct => {
            let mut seen = std::collections::HashSet::new();
            Value::from(cells.iter().filter(|v| seen.insert(distinct_key(v))).count())
        }
        AggregateOp::Sum => number(numbers().iter().sum()),
        AggregateOp::Avg => mean(&numbers()).map(number).unwrap_or(Value::Null),
        AggregateOp::Min => cells
            .iter()
            .copied()
            .min_by(|a, b| compare_numeric(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateOp::Max => cells
            .iter()
            .copied()
            .max_by(|a, b| compare_numeric(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateOp::Median => percentile(numbers(), 50.0).map(number).unwrap_or(Value::Null),
        AggregateOp::Mode => mode(&cells),
        AggregateOp::Variance => variance(&numbers()).map(number).unwrap_or(Value::Null),
        AggregateOp::Stddev => variance(&numbers())
            .map(|v| number(v.sqrt()))
            .unwrap_or(Value::Null),
        AggregateOp::Percentile => percentile(numbers(), spec.percentile.unwrap_or(50.0))
            .map(number)
            .unwrap_or(Value::Null),
    }
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population variance.
pub(crate) fn variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64)
}

/// Linear interpolation between the closest ranks.
pub(crate) fn percentile(mut values: Vec<f64>, p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = (p / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(values[lower] + (values[upper] - values[lower]) * weight)
}

/// Most frequent value; the first one seen wins a tie.
fn mode(cells: &[&Value]) -> Value {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (i, v) in cells.iter().enumerate() {
        counts.entry(distinct_key(v)).or_insert((0, i)).0 += 1;
    }
    counts
        .values()
        .max_by(|(ca, ia), (cb, ib)| ca.cmp(cb).then(ib.cmp(ia)))
        .and_then(|(_, i)| cells.get(*i))
        .map(|v| (*v).clone())
        .unwrap_or(Value::Null)
}
