//! Operation payloads, one variant per operation tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::OperationTag;
use super::options::{
    AggregationSpec, ExportOptions, FilterCondition, SortKey, Transformation, ValidationRule,
};
use crate::table::{ColumnDef, TabularResult};

/// Raw rows to be turned into a [`TabularResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsePayload {
    /// Objects, or arrays positionally matched against `headers`.
    pub rows: Vec<Value>,
    /// Skips type inference when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<String>>,
    /// Number of rows examined when inferring types. All rows when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterPayload {
    pub data: TabularResult,
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortPayload {
    pub data: TabularResult,
    pub keys: Vec<SortKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportPayload {
    pub data: TabularResult,
    #[serde(default)]
    pub options: ExportOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatePayload {
    pub data: TabularResult,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub aggregations: Vec<AggregationSpec>,
    /// Post-aggregation filters applied to the output rows.
    #[serde(default)]
    pub having: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsPayload {
    pub data: TabularResult,
    /// Restrict to these columns. All columns when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatePayload {
    pub data: TabularResult,
    pub rules: Vec<ValidationRule>,
    /// Stop collecting once this many issues were found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_errors: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformPayload {
    pub data: TabularResult,
    pub transformations: Vec<Transformation>,
}

/// Payload of a task, keyed by operation tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "operationTag",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum OperationPayload {
    Parse(ParsePayload),
    Filter(FilterPayload),
    Sort(SortPayload),
    ExportCsv(ExportPayload),
    ExportJson(ExportPayload),
    ExportTabular(ExportPayload),
    Aggregate(AggregatePayload),
    Statistics(StatisticsPayload),
    Validate(ValidatePayload),
    Transform(TransformPayload),
}

impl OperationPayload {
    pub fn tag(&self) -> OperationTag {
        match self {
            Self::Parse(_) => OperationTag::Parse,
            Self::Filter(_) => OperationTag::Filter,
            Self::Sort(_) => OperationTag::Sort,
            Self::ExportCsv(_) => OperationTag::ExportCsv,
            Self::ExportJson(_) => OperationTag::ExportJson,
            Self::ExportTabular(_) => OperationTag::ExportTabular,
            Self::Aggregate(_) => OperationTag::Aggregate,
            Self::Statistics(_) => OperationTag::Statistics,
            Self::Validate(_) => OperationTag::Validate,
            Self::Transform(_) => OperationTag::Transform,
        }
    }

    /// The input table, for every operation that consumes one.
    pub fn input_table(&self) -> Option<&TabularResult> {
        match self {
            Self::Parse(_) => None,
            Self::Filter(p) => Some(&p.data),
            Self::Sort(p) => Some(&p.data),
            Self::ExportCsv(p) | Self::ExportJson(p) | Self::ExportTabular(p) => Some(&p.data),
            Self::Aggregate(p) => Some(&p.data),
            Self::Statistics(p) => Some(&p.data),
            Self::Validate(p) => Some(&p.data),
            Self::Transform(p) => Some(&p.data),
        }
    }

    pub fn input_table_mut(&mut self) -> Option<&mut TabularResult> {
        match self {
            Self::Parse(_) => None,
            Self::Filter(p) => Some(&mut p.data),
            Self::Sort(p) => Some(&mut p.data),
            Self::ExportCsv(p) | Self::ExportJson(p) | Self::ExportTabular(p) => {
                Some(&mut p.data)
            }
            Self::Aggregate(p) => Some(&mut p.data),
            Self::Statistics(p) => Some(&mut p.data),
            Self::Validate(p) => Some(&mut p.data),
            Self::Transform(p) => Some(&mut p.data),
        }
    }

    /// Number of input rows, used for progress totals and transfer decisions.
    pub fn input_rows(&self) -> usize {
        match self {
            Self::Parse(p) => p.rows.len(),
            other => other.input_table().map(|t| t.rows.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_adjacently_tagged() {
        let payload = OperationPayload::Sort(SortPayload {
            data: TabularResult::default(),
            keys: vec![SortKey::asc("name")],
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["operationTag"], "SORT");
        assert_eq!(json["payload"]["keys"][0]["column"], "name");

        let back: OperationPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.tag(), OperationTag::Sort);
    }

    #[test]
    fn input_rows_counts_parse_rows() {
        let payload = OperationPayload::Parse(ParsePayload {
            rows: vec![json!({"a": 1}), json!({"a": 2})],
            ..Default::default()
        });
        assert_eq!(payload.input_rows(), 2);
        assert!(payload.input_table().is_none());
    }
}
