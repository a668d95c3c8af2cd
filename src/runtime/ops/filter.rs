//! FILTER: keep rows matching every condition.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::runtime::value::{display, loosely_equal, order_against};
use crate::table::{ColumnDef, ResultMetadata, Row, TabularResult};
use crate::wire::{FilterCondition, FilterOperator, FilterPayload};

pub fn filter(
    payload: FilterPayload,
    ctx: &mut ExecutionContext<'_>,
) -> Result<TabularResult, OperationError> {
    ctx.set_stage("filtering");
    let predicate = RowPredicate::compile(&payload.conditions, &payload.data.columns)?;
    let total = payload.data.rows.len();
    let mut kept = Vec::new();

    for (i, row) in payload.data.rows.into_iter().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        if predicate.matches(&row) {
            kept.push(row);
        }
    }

    ctx.finish(total);
    let mut result = TabularResult::new(payload.data.columns, kept);
    result.metadata = Some(ResultMetadata {
        row_count: Some(result.rows.len()),
        total_rows: Some(total),
        ..Default::default()
    });
    Ok(result)
}

struct Compiled<'c> {
    condition: &'c FilterCondition,
    regex: Option<Regex>,
    needle: Option<String>,
}

/// Conjunction of conditions, compiled once per operation.
pub struct RowPredicate<'c> {
    conditions: Vec<Compiled<'c>>,
}

impl<'c> RowPredicate<'c> {
    /// Validate the conditions against `columns` and compile their patterns.
    /// An empty column list skips the column check.
    pub fn compile(
        conditions: &'c [FilterCondition],
        columns: &[ColumnDef],
    ) -> Result<Self, OperationError> {
        let mut compiled = Vec::with_capacity(conditions.len());
        for condition in conditions {
            if !columns.is_empty() && !columns.iter().any(|c| c.name == condition.column) {
                return Err(OperationError::ColumnNotFound(condition.column.clone()));
            }

            let regex = match condition.operator {
                FilterOperator::Regex => {
                    let pattern = condition.value.as_str().ok_or_else(|| {
                        OperationError::InvalidPayload(format!(
                            "regex condition on {} needs a string pattern",
                            condition.column
                        ))
                    })?;
                    let regex = RegexBuilder::new(pattern)
                        .case_insensitive(condition.case_insensitive)
                        .build()
                        .map_err(|e| OperationError::InvalidPattern {
                            pattern: pattern.to_string(),
                            reason: e.to_string(),
                        })?;
                    Some(regex)
                }
                FilterOperator::In | FilterOperator::NotIn if !condition.value.is_array() => {
                    return Err(OperationError::InvalidPayload(format!(
                        "{:?} condition on {} needs an array value",
                        condition.operator, condition.column
                    )));
                }
                FilterOperator::Between if condition.value2.is_none() => {
                    return Err(OperationError::InvalidPayload(format!(
                        "between condition on {} needs value2",
                        condition.column
                    )));
                }
                _ => None,
            };

            let needle = match condition.operator {
                FilterOperator::Contains
                | FilterOperator::NotContains
                | FilterOperator::StartsWith
                | FilterOperator::EndsWith => {
                    let text = display(&condition.value);
                    Some(if condition.case_insensitive {
                        text.to_lowercase()
                    } else {
                        text
                    })
                }
                _ => None,
            };

            compiled.push(Compiled {
                condition,
                regex,
                needle,
            });
        }
        Ok(Self {
            conditions: compiled,
        })
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

impl Compiled<'_> {
    fn matches(&self, row: &Row) -> bool {
        let cond = self.condition;
        let cell = row.get(&cond.column).unwrap_or(&Value::Null);
        let ci = cond.case_insensitive;

        match cond.operator {
            FilterOperator::IsNull => cell.is_null(),
            FilterOperator::IsNotNull => !cell.is_null(),
            FilterOperator::Equals => equals(cell, &cond.value, ci),
            FilterOperator::NotEquals => !equals(cell, &cond.value, ci),
            FilterOperator::GreaterThan => ordered(cell, &cond.value, |o| o == Ordering::Greater),
            FilterOperator::GreaterThanOrEqual => {
                ordered(cell, &cond.value, |o| o != Ordering::Less)
            }
            FilterOperator::LessThan => ordered(cell, &cond.value, |o| o == Ordering::Less),
            FilterOperator::LessThanOrEqual => {
                ordered(cell, &cond.value, |o| o != Ordering::Greater)
            }
            FilterOperator::Between => {
                let high = cond.value2.as_ref().unwrap_or(&Value::Null);
                ordered(cell, &cond.value, |o| o != Ordering::Less)
                    && ordered(cell, high, |o| o != Ordering::Greater)
            }
            FilterOperator::Contains => self.text_test(cell, |h, n| h.contains(n)),
            FilterOperator::NotContains => {
                cell.is_null() || !self.text_test(cell, |h, n| h.contains(n))
            }
            FilterOperator::StartsWith => self.text_test(cell, |h, n| h.starts_with(n)),
            FilterOperator::EndsWith => self.text_test(cell, |h, n| h.ends_with(n)),
            FilterOperator::In => in_list(cell, &cond.value, ci),
            FilterOperator::NotIn => !in_list(cell, &cond.value, ci),
            FilterOperator::Regex => match &self.regex {
                Some(re) if !cell.is_null() => re.is_match(&display(cell)),
                _ => false,
            },
        }
    }

    fn text_test(&self, cell: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
        if cell.is_null() {
            return false;
        }
        let Some(needle) = &self.needle else {
            return false;
        };
        let hay = display(cell);
        if self.condition.case_insensitive {
            test(&hay.to_lowercase(), needle)
        } else {
            test(&hay, needle)
        }
    }
}

fn equals(cell: &Value, target: &Value, ci: bool) -> bool {
    match (cell.is_null(), target.is_null()) {
        (true, true) => true,
        (false, false) => loosely_equal(cell, target, ci),
        _ => false,
    }
}

fn ordered(cell: &Value, target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    if cell.is_null() || target.is_null() {
        return false;
    }
    order_against(cell, target).is_some_and(accept)
}

fn in_list(cell: &Value, list: &Value, ci: bool) -> bool {
    list.as_array()
        .is_some_and(|items| items.iter().any(|item| equals(cell, item, ci)))
}
