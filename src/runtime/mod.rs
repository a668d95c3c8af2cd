//! Execution runtime: the code that runs inside each execution unit.
//!
//! - `context`: cooperative cancellation and throttled progress
//! - `ops`: one function per operation tag
//! - `unit`: the unit thread loop
//! - `value`: cell comparison and coercion helpers

pub mod context;
pub mod ops;
pub mod unit;
pub mod value;

use serde_json::Value;

pub use context::{CheckpointPolicy, ExecutionContext};
pub use ops::validate::{CustomValidator, ValidatorRegistry};
pub use unit::{UnitChannel, UnitEvent, UnitSettings, spawn_unit};

use crate::error::OperationError;
use crate::table::Row;
use crate::wire::{OperationOutput, OperationPayload};
use ops::ExportFormat;

/// Runs one operation. The seam between units and the operations they run.
pub trait OperationExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        payload: OperationPayload,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperationOutput, OperationError>;
}

/// The tabular operation runtime.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    validators: ValidatorRegistry,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` available to `custom` validation rules.
    pub fn with_validator<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value, &Row) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.register(name, check);
        self
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }
}

impl OperationExecutor for Runtime {
    fn execute(
        &self,
        payload: OperationPayload,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<OperationOutput, OperationError> {
        match payload {
            OperationPayload::Parse(p) => ops::parse(p, ctx).map(OperationOutput::Table),
            OperationPayload::Filter(p) => ops::filter(p, ctx).map(OperationOutput::Table),
            OperationPayload::Sort(p) => ops::sort(p, ctx).map(OperationOutput::Table),
            OperationPayload::ExportCsv(p) => {
                ops::export(ExportFormat::Csv, p, ctx).map(OperationOutput::Export)
            }
            OperationPayload::ExportJson(p) => {
                ops::export(ExportFormat::Json, p, ctx).map(OperationOutput::Export)
            }
            OperationPayload::ExportTabular(p) => {
                ops::export(ExportFormat::Tabular, p, ctx).map(OperationOutput::Export)
            }
            OperationPayload::Aggregate(p) => ops::aggregate(p, ctx).map(OperationOutput::Table),
            OperationPayload::Statistics(p) => {
                ops::statistics(p, ctx).map(OperationOutput::Statistics)
            }
            OperationPayload::Validate(p) => {
                ops::validate(p, &self.validators, ctx).map(OperationOutput::Validation)
            }
            OperationPayload::Transform(p) => ops::transform(p, ctx).map(OperationOutput::Table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ColumnDef, ColumnType, TabularResult};
    use crate::wire::{
        FilterCondition, FilterOperator, FilterPayload, RuleKind, TaskId, ValidatePayload,
        ValidationRule,
    };
    use serde_json::json;

    fn table() -> TabularResult {
        TabularResult::new(
            vec![ColumnDef::new("v", ColumnType::Integer)],
            [json!({"v": 1}), json!({"v": 2})]
                .into_iter()
                .filter_map(|v| v.as_object().cloned())
                .collect(),
        )
    }

    #[test]
    fn dispatches_by_tag() {
        let runtime = Runtime::new();
        let mut ctx = ExecutionContext::new(TaskId::new(), CheckpointPolicy::default());
        let out = runtime
            .execute(
                OperationPayload::Filter(FilterPayload {
                    data: table(),
                    conditions: vec![FilterCondition::new(
                        "v",
                        FilterOperator::Equals,
                        json!(2),
                    )],
                }),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(out.kind(), "table");
        assert_eq!(out.into_table().unwrap().rows.len(), 1);
    }

    #[test]
    fn registered_validators_reach_validate() {
        let runtime = Runtime::new().with_validator("positive", |v: &Value, _: &Row| {
            if v.as_f64().is_some_and(|n| n > 0.0) {
                Ok(())
            } else {
                Err("not positive".into())
            }
        });
        let mut ctx = ExecutionContext::new(TaskId::new(), CheckpointPolicy::default());
        let out = runtime
            .execute(
                OperationPayload::Validate(ValidatePayload {
                    data: table(),
                    rules: vec![ValidationRule::new(
                        "v",
                        RuleKind::Custom {
                            name: "positive".into(),
                        },
                    )],
                    max_errors: None,
                }),
                &mut ctx,
            )
            .unwrap();
        assert!(out.into_validation().unwrap().valid);
    }
}
