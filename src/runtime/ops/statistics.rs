//! STATISTICS: per-column profile.

use std::collections::HashSet;

use serde_json::Value;

use super::aggregate::{mean, percentile, variance};
use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::runtime::value::{as_json_number, distinct_key};
use crate::wire::{ColumnStatistics, NumericSummary, StatisticsPayload, TextSummary};

pub fn statistics(
    payload: StatisticsPayload,
    ctx: &mut ExecutionContext<'_>,
) -> Result<Vec<ColumnStatistics>, OperationError> {
    ctx.set_stage("profiling");
    let StatisticsPayload { data, columns } = payload;

    let names: Vec<String> = match columns {
        Some(names) => {
            for name in &names {
                if !data.has_column(name) {
                    return Err(OperationError::ColumnNotFound(name.clone()));
                }
            }
            names
        }
        None => data.columns.iter().map(|c| c.name.clone()).collect(),
    };

    let total = data.rows.len();
    let work = total * names.len();
    let mut out = Vec::with_capacity(names.len());
    for (n, name) in names.into_iter().enumerate() {
        let mut nulls = 0;
        let mut distinct = HashSet::new();
        let mut cells: Vec<&Value> = Vec::with_capacity(total);

        for (i, row) in data.rows.iter().enumerate() {
            ctx.checkpoint(n * total + i + 1, work)?;
            match row.get(&name) {
                None | Some(Value::Null) => nulls += 1,
                Some(v) => {
                    distinct.insert(distinct_key(v));
                    cells.push(v);
                }
            }
        }

        out.push(ColumnStatistics {
            numeric: numeric_summary(&cells),
            text: text_summary(&cells),
            column: name,
            count: total,
            unique: distinct.len(),
            nulls,
        });
    }

    ctx.finish(work);
    Ok(out)
}

fn numeric_summary(cells: &[&Value]) -> Option<NumericSummary> {
    if cells.is_empty() {
        return None;
    }
    let values: Vec<f64> = cells.iter().map(|v| as_json_number(v)).collect::<Option<_>>()?;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = values.iter().sum();
    Some(NumericSummary {
        min,
        max,
        sum,
        mean: mean(&values)?,
        stddev: variance(&values)?.sqrt(),
        median: percentile(values, 50.0)?,
    })
}

fn text_summary(cells: &[&Value]) -> Option<TextSummary> {
    if cells.is_empty() {
        return None;
    }
    let lengths: Vec<usize> = cells
        .iter()
        .map(|v| v.as_str().map(|s| s.chars().count()))
        .collect::<Option<_>>()?;
    Some(TextSummary {
        min_length: lengths.iter().copied().min().unwrap_or(0),
        max_length: lengths.iter().copied().max().unwrap_or(0),
        avg_length: lengths.iter().sum::<usize>() as f64 / lengths.len() as f64,
    })
}
