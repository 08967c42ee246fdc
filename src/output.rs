//! Output shaping: truncation, tabular parsing and encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sandbox::ExecutionResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    /// Whitespace-separated columns as objects keyed by the header row.
    Json,
    /// Aligned columns.
    Table,
    Base64,
}

/// Formatted result returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedOutput {
    pub format: OutputFormat,
    pub output: Value,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct OutputFormatter {
    max_bytes: usize,
}

impl OutputFormatter {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(64),
        }
    }

    pub fn format(&self, result: &ExecutionResult, format: OutputFormat) -> FormattedOutput {
        let (stdout, out_cut) = truncate(&result.stdout, self.max_bytes);
        let (stderr, err_cut) = truncate(&result.stderr, self.max_bytes);
        let output = match format {
            OutputFormat::Text => Value::String(stdout),
            OutputFormat::Table => Value::String(render_table(&stdout)),
            OutputFormat::Json => to_json(&stdout),
            OutputFormat::Base64 => Value::String(STANDARD.encode(stdout.as_bytes())),
        };
        FormattedOutput {
            format,
            output,
            stderr,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            truncated: out_cut || err_cut,
        }
    }
}

/// Keep the head and tail of `text` within `max_bytes`, marking what was dropped.
pub fn truncate(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let half = max_bytes / 2;
    let mut head_end = half;
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let omitted = tail_start - head_end;
    (
        format!(
            "{}\n... [{omitted} bytes omitted] ...\n{}",
            &text[..head_end],
            &text[tail_start..]
        ),
        true,
    )
}

fn rows(text: &str) -> Vec<Vec<&str>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let header: Vec<&str> = header.split_whitespace().collect();
    let width = header.len();
    let mut rows = vec![header];
    for line in lines {
        rows.push(split_columns(line, width));
    }
    rows
}

/// Split on whitespace into at most `width` columns; the last column keeps the remainder.
fn split_columns(line: &str, width: usize) -> Vec<&str> {
    let mut columns = Vec::with_capacity(width);
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        if columns.len() + 1 == width {
            columns.push(rest.trim_end());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                columns.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                columns.push(rest);
                break;
            }
        }
    }
    columns
}

fn render_table(text: &str) -> String {
    let rows = rows(text);
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    rows.iter()
        .map(|row| {
            let cells: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    if i + 1 == row.len() {
                        (*cell).to_string()
                    } else {
                        format!("{cell:<width$}", width = widths[i])
                    }
                })
                .collect();
            cells.join("  ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn to_json(text: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() || value.is_array() {
            return value;
        }
    }
    let rows = rows(text);
    let Some((header, body)) = rows.split_first() else {
        return Value::Array(Vec::new());
    };
    if body.is_empty() {
        return Value::Array(text.lines().map(|l| Value::String(l.to_string())).collect());
    }
    Value::Array(
        body.iter()
            .map(|row| {
                let mut object = Map::new();
                for (i, key) in header.iter().enumerate() {
                    let cell = row.get(i).copied().unwrap_or_default();
                    object.insert((*key).to_string(), Value::String(cell.to_string()));
                }
                Value::Object(object)
            })
            .collect(),
    )
}
