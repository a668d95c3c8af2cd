//! SORT: stable multi-key ordering.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::runtime::value::{compare, compare_numeric};
use crate::table::TabularResult;
use crate::wire::{NullsOrder, SortDirection, SortKey, SortPayload};

pub fn sort(
    payload: SortPayload,
    ctx: &mut ExecutionContext<'_>,
) -> Result<TabularResult, OperationError> {
    ctx.set_stage("sorting");
    let SortPayload { data, keys } = payload;
    for key in &keys {
        if !data.has_column(&key.column) {
            return Err(OperationError::ColumnNotFound(key.column.clone()));
        }
    }

    let total = data.rows.len();
    let mut decorated: Vec<(Vec<Value>, usize)> = Vec::with_capacity(total);
    for (i, row) in data.rows.iter().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        let cells = keys
            .iter()
            .map(|k| row.get(&k.column).cloned().unwrap_or(Value::Null))
            .collect();
        decorated.push((cells, i));
    }

    // `sort_by` is stable, so rows equal on every key keep input order.
    decorated.sort_by(|(a, _), (b, _)| compare_keys(&keys, a, b));

    let mut slots: Vec<Option<_>> = data.rows.into_iter().map(Some).collect();
    let rows = decorated
        .into_iter()
        .filter_map(|(_, i)| slots[i].take())
        .collect();

    ctx.finish(total);
    Ok(TabularResult::new(data.columns, rows).with_row_count())
}

fn compare_keys(keys: &[SortKey], a: &[Value], b: &[Value]) -> Ordering {
    for (k, (x, y)) in keys.iter().zip(a.iter().zip(b)) {
        let ord = compare_cells(k, x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_cells(key: &SortKey, a: &Value, b: &Value) -> Ordering {
    let nulls_first = key.nulls == NullsOrder::First;
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return if nulls_first { Ordering::Less } else { Ordering::Greater },
        (false, true) => return if nulls_first { Ordering::Greater } else { Ordering::Less },
        (false, false) => {}
    }
    let ord = if key.numeric {
        compare_numeric(a, b)
    } else {
        compare(a, b)
    };
    match key.direction {
        SortDirection::Asc => ord,
        SortDirection::Desc => ord.reverse(),
    }
}
