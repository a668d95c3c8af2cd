//! EXPORT_CSV / EXPORT_JSON / EXPORT_TABULAR, with optional compression.

use std::io::{Cursor, Write};

use chrono::Utc;
use flate2::write::GzEncoder;
use serde_json::{Map, Value};

use crate::error::OperationError;
use crate::runtime::ExecutionContext;
use crate::runtime::value::{format_timestamp, parse_timestamp};
use crate::table::{ColumnDef, TabularResult};
use crate::wire::{Compression, ExportOptions, ExportOutput, ExportPayload};

/// Serialisation target of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    /// Tab-separated values.
    Tabular,
}

impl ExportFormat {
    fn mime_type(&self) -> &'static str {
        match self {
            Self::Csv => "text/csv",
            Self::Json => "application/json",
            Self::Tabular => "text/tab-separated-values",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Tabular => "tsv",
        }
    }
}

pub fn export(
    format: ExportFormat,
    payload: ExportPayload,
    ctx: &mut ExecutionContext<'_>,
) -> Result<ExportOutput, OperationError> {
    let ExportPayload { data, options } = payload;
    if options.compression == Compression::Brotli {
        return Err(OperationError::UnsupportedCompression(
            "brotli is not available; use gzip or zip".into(),
        ));
    }
    if let Some(pattern) = options.date_format.as_deref() {
        if format_timestamp(&Utc::now(), pattern).is_none() {
            return Err(OperationError::InvalidPayload(format!(
                "invalid date format {pattern}"
            )));
        }
    }
    ctx.set_stage("exporting");

    let text = match format {
        ExportFormat::Csv => delimited(&data, &options, options.delimiter, ctx)?,
        ExportFormat::Tabular => delimited(&data, &options, '\t', ctx)?,
        ExportFormat::Json => json(&data, &options, ctx)?,
    };
    ctx.finish(data.rows.len());

    compress(format, text, &options, data.rows.len())
}

// ── Delimited text ──────────────────────────────────────────────────

fn delimited(
    data: &TabularResult,
    options: &ExportOptions,
    delimiter: char,
    ctx: &mut ExecutionContext<'_>,
) -> Result<String, OperationError> {
    let tsv = delimiter == '\t';
    let field = |s: &str| -> String {
        if tsv {
            s.replace(['\t', '\r', '\n'], " ")
        } else {
            escape_csv_field(s, delimiter, options.quote, options.escape)
        }
    };
    let join = |cells: Vec<String>| cells.join(&delimiter.to_string());

    let mut out = String::new();
    if options.include_headers {
        out.push_str(&join(data.columns.iter().map(|c| field(&c.name)).collect()));
        out.push('\n');
    }

    let total = data.rows.len();
    for (i, row) in data.rows.iter().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        let cells = data
            .columns
            .iter()
            .map(|col| {
                let value = row.get(&col.name).unwrap_or(&Value::Null);
                field(&render_cell(value, col, options))
            })
            .collect();
        out.push_str(&join(cells));
        out.push('\n');
    }
    Ok(out)
}

/// Quote a field when it holds the delimiter, the quote, CR or LF.
/// Inner quotes are doubled, or prefixed with `escape` when one is set.
pub fn escape_csv_field(s: &str, delimiter: char, quote: char, escape: Option<char>) -> String {
    let needs_quotes = s
        .chars()
        .any(|c| c == delimiter || c == quote || c == '\r' || c == '\n');
    if !needs_quotes {
        return s.to_string();
    }
    let escape = escape.unwrap_or(quote);
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        if c == quote {
            out.push(escape);
        }
        out.push(c);
    }
    out.push(quote);
    out
}

fn render_cell(value: &Value, column: &ColumnDef, options: &ExportOptions) -> String {
    match value {
        Value::Null => options.null_value.clone(),
        Value::Bool(b) => options.boolean_format.render(*b).to_string(),
        Value::String(s) => formatted_date(value, column, options).unwrap_or_else(|| s.clone()),
        Value::Number(n) => {
            formatted_date(value, column, options).unwrap_or_else(|| n.to_string())
        }
        other => other.to_string(),
    }
}

fn formatted_date(value: &Value, column: &ColumnDef, options: &ExportOptions) -> Option<String> {
    let pattern = options.date_format.as_deref()?;
    if !column.column_type.is_temporal() {
        return None;
    }
    format_timestamp(&parse_timestamp(value, None)?, pattern)
}

// ── JSON ────────────────────────────────────────────────────────────

fn json(
    data: &TabularResult,
    options: &ExportOptions,
    ctx: &mut ExecutionContext<'_>,
) -> Result<String, OperationError> {
    let total = data.rows.len();
    let mut records = Vec::with_capacity(total);
    for (i, row) in data.rows.iter().enumerate() {
        ctx.checkpoint(i + 1, total)?;
        let mut record = Map::new();
        for col in &data.columns {
            let value = row.get(&col.name).cloned().unwrap_or(Value::Null);
            let value = match formatted_date(&value, col, options) {
                Some(text) => Value::String(text),
                None => value,
            };
            record.insert(col.name.clone(), value);
        }
        records.push(Value::Object(record));
    }

    let array = Value::Array(records);
    let text = if options.pretty {
        serde_json::to_string_pretty(&array)
    } else {
        serde_json::to_string(&array)
    };
    text.map_err(|e| OperationError::Export(e.to_string()))
}

// ── Compression ─────────────────────────────────────────────────────

fn compress(
    format: ExportFormat,
    text: String,
    options: &ExportOptions,
    row_count: usize,
) -> Result<ExportOutput, OperationError> {
    let io_err = |e: std::io::Error| OperationError::Export(e.to_string());

    let (content, bytes, mime_type, file_extension) = match options.compression {
        Compression::None => (
            Some(text),
            None,
            format.mime_type().to_string(),
            format.extension().to_string(),
        ),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(text.as_bytes()).map_err(io_err)?;
            let bytes = encoder.finish().map_err(io_err)?;
            (
                None,
                Some(bytes),
                "application/gzip".to_string(),
                format!("{}.gz", format.extension()),
            )
        }
        Compression::Zip => {
            let entry = options
                .file_name
                .clone()
                .unwrap_or_else(|| format!("export.{}", format.extension()));
            let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
            let file_options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            zip.start_file(entry, file_options)
                .map_err(|e| OperationError::Export(e.to_string()))?;
            zip.write_all(text.as_bytes()).map_err(io_err)?;
            let cursor = zip
                .finish()
                .map_err(|e| OperationError::Export(e.to_string()))?;
            (
                None,
                Some(cursor.into_inner()),
                "application/zip".to_string(),
                "zip".to_string(),
            )
        }
        Compression::Brotli => {
            return Err(OperationError::UnsupportedCompression("brotli".into()));
        }
    };

    let byte_size = content
        .as_ref()
        .map(String::len)
        .or_else(|| bytes.as_ref().map(Vec::len))
        .unwrap_or(0);

    Ok(ExportOutput {
        content,
        bytes,
        mime_type,
        file_extension,
        compression: options.compression,
        row_count,
        byte_size,
    })
}
