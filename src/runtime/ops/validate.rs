//! VALIDATE: rule checks producing one issue per violation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::runtime::value::{as_number, display, is_blank};
use crate::table::Row;
use crate::wire::{RuleKind, ValidatePayload, ValidationIssue, ValidationReport, ValidationRule};

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());
static URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^(https?|ftp)://[^\s/$.?#][^\s]*$").ok());

/// A named check. Returns the violation message on failure.
pub type CustomValidator = Arc<dyn Fn(&Value, &Row) -> Result<(), String> + Send + Sync>;

/// Custom validators available to `custom` rules, by name.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, CustomValidator>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("names", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn(&Value, &Row) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.insert(name.into(), Arc::new(check));
    }

    pub fn get(&self, name: &str) -> Option<&CustomValidator> {
        self.validators.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

enum Check<'r> {
    Required,
    MinLength(usize),
    MaxLength(usize),
    MinValue(f64),
    MaxValue(f64),
    Pattern(Regex),
    Email,
    Url,
    Uuid,
    Custom(&'r CustomValidator),
}

struct CompiledRule<'r> {
    rule: &'r ValidationRule,
    check: Check<'r>,
}

impl<'r> CompiledRule<'r> {
    fn compile(
        rule: &'r ValidationRule,
        registry: &'r ValidatorRegistry,
    ) -> Result<Self, OperationError> {
        let check = match &rule.kind {
            RuleKind::Required => Check::Required,
            RuleKind::MinLength { value } => Check::MinLength(*value),
            RuleKind::MaxLength { value } => Check::MaxLength(*value),
            RuleKind::MinValue { value } => Check::MinValue(*value),
            RuleKind::MaxValue { value } => Check::MaxValue(*value),
            RuleKind::Pattern { pattern } => {
                Check::Pattern(Regex::new(pattern).map_err(|e| OperationError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?)
            }
            RuleKind::Email => Check::Email,
            RuleKind::Url => Check::Url,
            RuleKind::Uuid => Check::Uuid,
            RuleKind::Custom { name } => Check::Custom(registry.get(name).ok_or_else(|| {
                OperationError::InvalidPayload(format!("no custom validator named {name}"))
            })?),
        };
        Ok(Self { rule, check })
    }

    /// `Some(message)` when the cell violates the rule.
    fn violation(&self, cell: &Value, row: &Row) -> Option<String> {
        let column = &self.rule.column;
        if let Check::Required = self.check {
            return is_blank(cell).then(|| format!("{column} is required"));
        }
        // Only `required` looks at missing cells.
        if cell.is_null() {
            return None;
        }

        let text = || display(cell);
        match &self.check {
            Check::Required => None,
            Check::MinLength(min) => (text().chars().count() < *min)
                .then(|| format!("{column} must be at least {min} characters")),
            Check::MaxLength(max) => (text().chars().count() > *max)
                .then(|| format!("{column} must be at most {max} characters")),
            Check::MinValue(min) => match as_number(cell) {
                Some(n) if n >= *min => None,
                Some(_) => Some(format!("{column} must be at least {min}")),
                None => Some(format!("{column} must be a number")),
            },
            Check::MaxValue(max) => match as_number(cell) {
                Some(n) if n <= *max => None,
                Some(_) => Some(format!("{column} must be at most {max}")),
                None => Some(format!("{column} must be a number")),
            },
            Check::Pattern(re) => (!re.is_match(&text()))
                .then(|| format!("{column} does not match {}", re.as_str())),
            Check::Email => (!matches_static(&EMAIL, &text()))
                .then(|| format!("{column} must be a valid email address")),
            Check::Url => {
                (!matches_static(&URL, &text())).then(|| format!("{column} must be a valid URL"))
            }
            Check::Uuid => uuid::Uuid::parse_str(&text())
                .is_err()
                .then(|| format!("{column} must be a valid UUID")),
            Check::Custom(check) => check(cell, row).err(),
        }
    }
}

fn matches_static(re: &LazyLock<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

pub fn validate(
    payload: ValidatePayload,
    registry: &ValidatorRegistry,
    ctx: &mut ExecutionContext<'_>,
) -> Result<ValidationReport, OperationError> {
    ctx.set_stage("validating");
    let ValidatePayload {
        data,
        rules,
        max_errors,
    } = payload;

    for rule in &rules {
        if !data.columns.is_empty() && !data.has_column(&rule.column) {
            return Err(OperationError::ColumnNotFound(rule.column.clone()));
        }
    }
    let compiled = rules
        .iter()
        .map(|r| CompiledRule::compile(r, registry))
        .collect::<Result<Vec<_>, _>>()?;

    let total = data.rows.len();
    let limit = max_errors.unwrap_or(usize::MAX);
    let mut errors = Vec::new();
    let mut invalid_rows = HashSet::new();
    let mut truncated = false;

    'rows: for (i, row) in data.rows.iter().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        for rule in &compiled {
            let cell = row.get(&rule.rule.column).unwrap_or(&Value::Null);
            let Some(default_message) = rule.violation(cell, row) else {
                continue;
            };
            if errors.len() >= limit {
                truncated = true;
                break 'rows;
            }
            invalid_rows.insert(i);
            errors.push(ValidationIssue {
                row: i,
                column: rule.rule.column.clone(),
                rule: rule.rule.kind.name().to_string(),
                message: rule.rule.message.clone().unwrap_or(default_message),
                value: cell.clone(),
            });
        }
    }

    ctx.finish(total);
    Ok(ValidationReport {
        valid: errors.is_empty() && !truncated,
        total_rows: total,
        error_count: errors.len(),
        invalid_rows: invalid_rows.len(),
        errors,
        truncated,
    })
}
