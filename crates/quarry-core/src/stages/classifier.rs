//! Classifier - assigns every guarded request to exactly one category
//!
//! Pure and deterministic: the same text against the same schema
//! snapshot always yields the same category. Rules are tried in order
//! and the first hit wins:
//!
//! 1. visualization keywords
//! 2. a single aggregation over one existing column of one existing table
//! 3. load / import verbs
//! 4. everything else is a structured query

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::schema::SchemaSnapshot;
use crate::types::{AggregateKind, Category, ClassificationResult, Request, StatRequest};

lazy_static! {
    static ref VISUALIZATION: Regex = Regex::new(
        r"(?i)\b(charts?|plots?|graphs?|histograms?|visuali[sz]e|visuali[sz]ation|pie|scatter|heat\s?maps?|bar\s+charts?|box\s?plots?)\b"
    )
    .unwrap();

    static ref DIRECT_STAT: Regex = Regex::new(
        r"(?i)^\s*(?:(?:what(?:'s|\s+is|\s+are)|calculate|compute|show(?:\s+me)?|give\s+me|tell\s+me)\s+)?(?:the\s+)?(average|avg|mean|sum|total|count|minimum|min|maximum|max)\s+(?:of\s+)?(?:the\s+)?([a-z_][a-z0-9_]*)\s+(?:in|of|from|for)\s+(?:the\s+)?([a-z_][a-z0-9_]*)(?:\s+table)?\s*[?.!]*\s*$"
    )
    .unwrap();

    static ref COUNT_MATCHING: Regex = Regex::new(
        r#"(?i)^\s*how\s+many\s+(?:rows\s+|records\s+|entries\s+)?(?:are\s+)?(?:in|of|from)\s+(?:the\s+)?([a-z_][a-z0-9_]*)(?:\s+table)?\s+(?:have|has|with|where)\s+([a-z_][a-z0-9_]*)\s*(?:==|=|equal\s+to|equals|of|is)\s*['"]?([^'"?]+?)['"]?\s*\??\s*$"#
    )
    .unwrap();

    static ref SHAPING: Regex = Regex::new(r"(?i)\b(by|per|where|each|group|grouped|top|bottom)\b").unwrap();

    static ref LOAD: Regex = Regex::new(r"(?i)\b(load|import|ingest|upload)\b").unwrap();
}

#[derive(Debug, Clone, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, request: &Request, schema: &SchemaSnapshot) -> ClassificationResult {
        let text = request.raw_text.trim();

        if let Some(m) = VISUALIZATION.find(text) {
            return ClassificationResult {
                category: Category::Visualization,
                confidence: 0.9,
                rationale: format!("mentions '{}'", m.as_str()),
                stat: None,
            };
        }

        if let Some(stat) = direct_stat(text, schema) {
            return ClassificationResult {
                category: Category::DirectStat,
                confidence: 1.0,
                rationale: format!(
                    "single {} over {}.{}",
                    stat.kind.label(),
                    stat.table,
                    stat.column
                ),
                stat: Some(stat),
            };
        }

        if let Some(m) = LOAD.find(text) {
            return ClassificationResult {
                category: Category::LoadData,
                confidence: 0.9,
                rationale: format!("uses the verb '{}'", m.as_str()),
                stat: None,
            };
        }

        ClassificationResult {
            category: Category::StructuredQuery,
            confidence: 0.6,
            rationale: "no simpler route applies".to_string(),
            stat: None,
        }
    }
}

fn aggregate_kind(word: &str) -> Option<AggregateKind> {
    match word.to_ascii_lowercase().as_str() {
        "average" | "avg" | "mean" => Some(AggregateKind::Avg),
        "sum" | "total" => Some(AggregateKind::Sum),
        "count" => Some(AggregateKind::Count),
        "minimum" | "min" => Some(AggregateKind::Min),
        "maximum" | "max" => Some(AggregateKind::Max),
        _ => None,
    }
}

/// Matches only when the table and column exist and the column suits the aggregate
fn direct_stat(text: &str, schema: &SchemaSnapshot) -> Option<StatRequest> {
    if let Some(caps) = COUNT_MATCHING.captures(text) {
        let table = schema.table(caps.get(1)?.as_str())?;
        let column = table.column(caps.get(2)?.as_str())?;
        let raw = caps.get(3)?.as_str().trim();
        let value = raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<f64>().map(Value::from))
            .unwrap_or_else(|_| Value::from(raw));
        return Some(StatRequest {
            kind: AggregateKind::Count,
            table: table.name.clone(),
            column: column.name.clone(),
            matching: Some(value),
        });
    }

    if SHAPING.is_match(text) {
        return None;
    }

    let caps = DIRECT_STAT.captures(text)?;
    let kind = aggregate_kind(caps.get(1)?.as_str())?;
    let table = schema.table(caps.get(3)?.as_str())?;
    let column = table.column(caps.get(2)?.as_str())?;

    if kind.needs_numeric() && !column.inferred_type.is_numeric() {
        return None;
    }

    Some(StatRequest {
        kind,
        table: table.name.clone(),
        column: column.name.clone(),
        matching: None,
    })
}
