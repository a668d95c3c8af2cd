//! Per-operation configuration carried inside payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::table::ColumnType;

// ── Filter ──────────────────────────────────────────────────────────

/// Comparison applied by a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Regex,
    Between,
}

/// A single per-column predicate. Conditions in a list are AND-ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
    /// Upper bound for `between`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<Value>,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl FilterCondition {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
            value2: None,
            case_insensitive: false,
        }
    }

    pub fn between(column: impl Into<String>, low: Value, high: Value) -> Self {
        Self {
            value2: Some(high),
            ..Self::new(column, FilterOperator::Between, low)
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }
}

// ── Sort ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Where null cells land, independent of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullsOrder {
    First,
    #[default]
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub nulls: NullsOrder,
    /// Compare numeric-looking strings as numbers.
    #[serde(default)]
    pub numeric: bool,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
            nulls: NullsOrder::Last,
            numeric: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            direction: SortDirection::Desc,
            ..Self::asc(column)
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = NullsOrder::First;
        self
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }
}

// ── Export ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanFormat {
    #[default]
    TrueFalse,
    OneZero,
    YesNo,
}

impl BooleanFormat {
    pub fn render(&self, value: bool) -> &'static str {
        match (self, value) {
            (Self::TrueFalse, true) => "true",
            (Self::TrueFalse, false) => "false",
            (Self::OneZero, true) => "1",
            (Self::OneZero, false) => "0",
            (Self::YesNo, true) => "yes",
            (Self::YesNo, false) => "no",
        }
    }
}

/// Compression applied to the serialised export, not to the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zip,
    Brotli,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zip => "zip",
            Self::Brotli => "brotli",
        };
        write!(f, "{s}")
    }
}

/// Export configuration knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub delimiter: char,
    pub quote: char,
    /// Escape for quote characters inside quoted fields. `None` doubles the quote.
    pub escape: Option<char>,
    pub include_headers: bool,
    pub null_value: String,
    pub boolean_format: BooleanFormat,
    /// strftime pattern applied to date and datetime columns.
    pub date_format: Option<String>,
    pub compression: Compression,
    /// Pretty-print JSON exports.
    pub pretty: bool,
    /// Entry name used inside zip archives.
    pub file_name: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            escape: None,
            include_headers: true,
            null_value: String::new(),
            boolean_format: BooleanFormat::TrueFalse,
            date_format: None,
            compression: Compression::None,
            pretty: false,
            file_name: None,
        }
    }
}

// ── Aggregate ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    Median,
    Mode,
    Stddev,
    Variance,
    Percentile,
}

impl AggregateOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::CountDistinct => "count_distinct",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::Mode => "mode",
            Self::Stddev => "stddev",
            Self::Variance => "variance",
            Self::Percentile => "percentile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub operation: AggregateOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// 0..=100, only for `percentile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentile: Option<f64>,
}

impl AggregationSpec {
    pub fn new(operation: AggregateOp, column: Option<&str>) -> Self {
        Self {
            operation,
            column: column.map(str::to_string),
            alias: None,
            percentile: None,
        }
    }

    pub fn count() -> Self {
        Self::new(AggregateOp::Count, None)
    }

    pub fn of(operation: AggregateOp, column: &str) -> Self {
        Self::new(operation, Some(column))
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn percentile(column: &str, p: f64) -> Self {
        Self {
            percentile: Some(p),
            ..Self::of(AggregateOp::Percentile, column)
        }
    }

    /// Name of the output column: alias, `<op>`, or `<op>_<column>`.
    pub fn output_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.column {
            Some(column) => format!("{}_{}", self.operation.as_str(), column),
            None => self.operation.as_str().to_string(),
        }
    }
}

// ── Validate ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    Required,
    MinLength { value: usize },
    MaxLength { value: usize },
    MinValue { value: f64 },
    MaxValue { value: f64 },
    Pattern { pattern: String },
    Email,
    Url,
    Uuid,
    /// Named validator registered on the runtime.
    Custom { name: String },
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::MinLength { .. } => "min_length",
            Self::MaxLength { .. } => "max_length",
            Self::MinValue { .. } => "min_value",
            Self::MaxValue { .. } => "max_value",
            Self::Pattern { .. } => "pattern",
            Self::Email => "email",
            Self::Url => "url",
            Self::Uuid => "uuid",
            Self::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub column: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Overrides the default violation message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationRule {
    pub fn new(column: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            column: column.into(),
            kind,
            message: None,
        }
    }
}

// ── Transform ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    Uppercase,
    Lowercase,
    Trim,
    Replace {
        pattern: String,
        replacement: String,
        #[serde(default)]
        regex: bool,
    },
    /// Character-based substring.
    Substring {
        start: usize,
        #[serde(default)]
        length: Option<usize>,
    },
    /// Appends the listed columns to the source column.
    Concat {
        columns: Vec<String>,
        #[serde(default)]
        separator: String,
    },
    /// Splits into an array, or picks one part when `index` is set.
    Split {
        separator: String,
        #[serde(default)]
        index: Option<usize>,
    },
    DateFormat {
        format: String,
        #[serde(default)]
        input_format: Option<String>,
    },
    NumberFormat {
        decimals: u32,
        #[serde(default)]
        thousands_separator: Option<char>,
    },
    Cast {
        to: ColumnType,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub column: String,
    #[serde(flatten)]
    pub operation: TransformOp,
    /// Write into a new column instead of overwriting the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
}

impl Transformation {
    pub fn new(column: impl Into<String>, operation: TransformOp) -> Self {
        Self {
            column: column.into(),
            operation,
            target_column: None,
        }
    }

    pub fn into_column(mut self, target: impl Into<String>) -> Self {
        self.target_column = Some(target.into());
        self
    }
}
