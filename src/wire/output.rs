//! Operation outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::options::Compression;
use crate::table::TabularResult;

/// Serialised export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutput {
    /// Uncompressed text. `None` when compression was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Compressed bytes. `None` without compression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
    pub mime_type: String,
    pub file_extension: String,
    pub compression: Compression,
    pub row_count: usize,
    pub byte_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSummary {
    pub min_length: usize,
    pub max_length: usize,
    pub avg_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub column: String,
    /// Rows examined.
    pub count: usize,
    /// Distinct non-null values.
    pub unique: usize,
    pub nulls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextSummary>,
}

/// One rule violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub row: usize,
    pub column: String,
    pub rule: String,
    pub message: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub total_rows: usize,
    pub error_count: usize,
    /// Rows with at least one violation.
    pub invalid_rows: usize,
    pub errors: Vec<ValidationIssue>,
    /// Collection stopped at `max_errors`.
    #[serde(default)]
    pub truncated: bool,
}

/// Result of a successful operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    /// Parse, filter, sort, aggregate and transform.
    Table(TabularResult),
    Export(ExportOutput),
    Statistics(Vec<ColumnStatistics>),
    Validation(ValidationReport),
}

impl OperationOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Table(_) => "table",
            Self::Export(_) => "export",
            Self::Statistics(_) => "statistics",
            Self::Validation(_) => "validation",
        }
    }

    pub fn into_table(self) -> Option<TabularResult> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_export(self) -> Option<ExportOutput> {
        match self {
            Self::Export(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_statistics(self) -> Option<Vec<ColumnStatistics>> {
        match self {
            Self::Statistics(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_validation(self) -> Option<ValidationReport> {
        match self {
            Self::Validation(v) => Some(v),
            _ => None,
        }
    }

    /// Rough number of heap bytes held by the output.
    pub fn estimated_bytes(&self) -> u64 {
        match self {
            Self::Table(t) => t.estimated_bytes(),
            Self::Export(e) => e.byte_size as u64,
            Self::Statistics(s) => (s.len() * std::mem::size_of::<ColumnStatistics>()) as u64,
            Self::Validation(v) => (v.errors.len() * std::mem::size_of::<ValidationIssue>()) as u64,
        }
    }
}
