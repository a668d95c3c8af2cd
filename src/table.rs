//! Tabular data model shared by every component.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single row: column name to cell value.
pub type Row = Map<String, Value>;

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    String,
    Date,
    Datetime,
    Json,
    Array,
    Unknown,
}

impl ColumnType {
    /// Whether cells of this type are numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Whether cells of this type are calendar values.
    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Date | Self::Datetime)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::Json => "json",
            Self::Array => "array",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" | "int" => Ok(Self::Integer),
            "float" | "number" | "double" => Ok(Self::Float),
            "boolean" | "bool" => Ok(Self::Boolean),
            "string" | "text" => Ok(Self::String),
            "date" => Ok(Self::Date),
            "datetime" | "timestamp" => Ok(Self::Datetime),
            "json" | "object" => Ok(Self::Json),
            "array" => Ok(Self::Array),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Unknown column type: {s}")),
        }
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Optional metadata carried alongside a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Row count before filtering, when the operation drops rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<usize>,
}

/// Columns plus rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

impl TabularResult {
    /// Create a result without metadata.
    pub fn new(columns: Vec<ColumnDef>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            metadata: None,
        }
    }

    /// Attach a row count (and keep any other metadata already present).
    pub fn with_row_count(mut self) -> Self {
        let count = self.rows.len();
        self.metadata.get_or_insert_with(Default::default).row_count = Some(count);
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Find a column definition by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Rough number of heap bytes held by the rows.
    pub fn estimated_bytes(&self) -> u64 {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(k, v)| (k.len() + estimate_value_bytes(v)) as u64)
                    .sum::<u64>()
            })
            .sum()
    }
}

fn estimate_value_bytes(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 24,
        Value::Array(items) => 24 + items.iter().map(estimate_value_bytes).sum::<usize>(),
        Value::Object(map) => {
            48 + map
                .iter()
                .map(|(k, v)| k.len() + estimate_value_bytes(v))
                .sum::<usize>()
        }
    }
}
