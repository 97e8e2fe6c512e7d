//! User-facing message text

use serde_json::Value;

use crate::stages::visualizer::{ArtifactRef, ChartKind};
use crate::stages::LoadReport;
use crate::types::{ResultSet, StatRequest};

const MAX_ROWS: usize = 20;

pub const EMPTY_MESSAGE: &str = "Please provide a message.";

pub fn value(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() != 0.0 => format!("{:.4}", f)
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

pub fn direct_stat(stat: &StatRequest, result: &ResultSet) -> String {
    let answer = result
        .rows
        .first()
        .and_then(|r| r.last())
        .map(value)
        .unwrap_or_else(|| "NULL".to_string());

    match &stat.matching {
        Some(m) => format!(
            "{} rows in '{}' have {} = {}.",
            answer,
            stat.table,
            stat.column,
            value(m)
        ),
        None => format!(
            "The {} of '{}' in '{}' is {}.",
            stat.kind.label(),
            stat.column,
            stat.table,
            answer
        ),
    }
}

/// Scalar answer or a plain-text table of the first rows
pub fn result_table(result: &ResultSet, summary: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        out.push_str(summary.trim());
        out.push_str("\n\n");
    }

    if let Some(v) = result.scalar() {
        out.push_str(&format!("Result: {}", value(v)));
        return out;
    }
    if result.is_empty() {
        out.push_str("The query returned no rows.");
        return out;
    }

    out.push_str(&result.columns.join(" | "));
    out.push('\n');
    for row in result.rows.iter().take(MAX_ROWS) {
        let cells: Vec<String> = row.iter().map(value).collect();
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
    if result.len() > MAX_ROWS {
        out.push_str(&format!("... {} more rows\n", result.len() - MAX_ROWS));
    }
    out.push_str(&format!("({} rows)", result.len()));
    out
}

pub fn load_report(report: &LoadReport) -> String {
    let mut lines = Vec::new();
    for table in &report.loaded {
        let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        lines.push(format!(
            "Loaded '{}' from {} ({} rows; columns: {}).",
            table.table,
            table.source,
            table.row_count,
            columns.join(", ")
        ));
    }
    for failure in &report.failures {
        lines.push(format!("Skipped {}: {}", failure.source, failure.error));
    }
    if lines.is_empty() {
        lines.push("Nothing was loaded.".to_string());
    }
    lines.join("\n")
}

pub fn chart(artifact: &ArtifactRef, summary: Option<&str>) -> String {
    let mut out = format!("Created a {} chart: {}", artifact.kind, artifact.location);
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        out.push('\n');
        out.push_str(summary.trim());
    }
    out
}

pub fn unsupported_chart(kind: &str) -> String {
    let supported: Vec<&str> = ChartKind::ALL.iter().map(|k| k.as_str()).collect();
    format!(
        "{} charts are not supported. Supported chart types: {}.",
        capitalize(kind),
        supported.join(", ")
    )
}

pub fn aborted(diagnostic: &str) -> String {
    format!("I could not complete this request. {}", diagnostic.trim())
}

pub fn degraded(reason: &str) -> String {
    format!(
        "The analysis service is temporarily unavailable ({}). Please try again shortly.",
        reason
    )
}

pub fn unsafe_refusal(keyword: &str) -> String {
    format!(
        "I can only run read-only queries; the request would have required {}. Your data was not changed.",
        keyword
    )
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
