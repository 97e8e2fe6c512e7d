//! Heuristic capability backend
//!
//! Deterministic, rule-based stand-in for a language model. It keeps the
//! whole pipeline usable offline and gives tests a backend whose output
//! is a pure function of its input.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::{
    CapabilityGateway, CapabilityReply, CapabilityRequest, Confidence, HistoryTurn, NextAction,
    PlanDraft, QueryEvaluation, StageName, TopicVerdict,
};
use crate::error::CapabilityError;
use crate::guardrail::Direction;
use crate::schema::SchemaSnapshot;
use crate::sql::{self, quote_ident};
use crate::types::{AggregateKind, Category, Comparator, DataSourceDescriptor, Operation, QueryPlan};

/// Rows returned for plain listings that name no limit
const DEFAULT_LISTING_LIMIT: u32 = 100;

lazy_static! {
    static ref TOPIC_TERMS: Regex = Regex::new(
        r"(?i)\b(data|datasets?|tables?|columns?|rows?|records?|csv|json|averages?|avg|mean|median|sum|totals?|count|how many|number of|max|maximum|min|minimum|highest|lowest|statistics?|stats?|analy[sz]\w*|analytics|charts?|plots?|graphs?|histograms?|visuali[sz]\w*|pie|scatter|heatmap|trends?|distribution|quer(?:y|ies)|sql|load\w*|import\w*|schema|values?|results?|group\w*|filter\w*|compare|top|calculat\w*)\b"
    )
    .unwrap();

    static ref MUTATING_INTENT: Regex =
        Regex::new(r"(?i)^\s*(delete|drop|remove|truncate|update|insert|alter|wipe|erase)\b").unwrap();

    static ref AGGREGATES: Vec<(AggregateKind, Regex)> = vec![
        (
            AggregateKind::Count,
            Regex::new(r"(?i)\b(?:how many|number of|count)\b").unwrap(),
        ),
        (AggregateKind::Avg, Regex::new(r"(?i)\b(?:average|avg|mean)\b").unwrap()),
        (AggregateKind::Median, Regex::new(r"(?i)\bmedian\b").unwrap()),
        (AggregateKind::Sum, Regex::new(r"(?i)\b(?:sum|total)\b").unwrap()),
        (AggregateKind::Min, Regex::new(r"(?i)\b(?:minimum|min|lowest|smallest)\b").unwrap()),
        (AggregateKind::Max, Regex::new(r"(?i)\b(?:maximum|max|highest|largest)\b").unwrap()),
    ];

    static ref WORD: Regex = Regex::new(r"(?i)\b[a-z_][a-z0-9_]*\b").unwrap();

    static ref EXPLICIT_TABLE: Regex = Regex::new(
        r"(?i)\b(?:in|from|of|on)\s+(?:the\s+)?([a-z_][a-z0-9_]*)\s+table\b|\btable\s+([a-z_][a-z0-9_]*)"
    )
    .unwrap();

    static ref GROUP_BY: Regex =
        Regex::new(r"(?i)\b(?:by|per|for each|for every)\s+(?:the\s+)?([a-z_][a-z0-9_]*)").unwrap();

    static ref TOP_N: Regex = Regex::new(
        r"(?i)\b(top|bottom)\s+(\d+)(?:\s+[a-z_][a-z0-9_]*)?(?:\s+by\s+([a-z_][a-z0-9_]*))?"
    )
    .unwrap();

    static ref FILTER: Regex = Regex::new(
        r#"(?i)\b(?:where|with)\s+(?:the\s+)?([a-z_][a-z0-9_]*)\s*(>=|<=|!=|<>|=|>|<|is not|is|equals|greater than|less than|above|below|over|under)\s*(?:to\s+)?('[^']*'|"[^"]*"|[a-z0-9_.\-]+)"#
    )
    .unwrap();

    static ref CORRECTION: Regex = Regex::new(
        r"'([A-Za-z0-9_]+)' does not exist[^.]*\. Did you mean: ([A-Za-z0-9_]+)"
    )
    .unwrap();

    static ref QUOTED_PATH: Regex = Regex::new(r#"["'`]([^"'`]+)["'`]"#).unwrap();

    static ref FILE_PATH: Regex =
        Regex::new(r"(?i)(?:^|\s)((?:~|\.{1,2})?[\w\-./\\:]*\.(?:csv|json))\b").unwrap();

    static ref DIR_PATH: Regex = Regex::new(
        r"(?i)\b(?:directory|folder|dir|path|from)\s+((?:~|\.{1,2})?[\w\-./\\:]*[/\\][\w\-./\\:]*)"
    )
    .unwrap();

    static ref TARGET_TABLE: Regex =
        Regex::new(r"(?i)\b(?:as|into)\s+(?:a\s+|the\s+)?(?:table\s+)?([a-z_][a-z0-9_]*)").unwrap();
}

/// Words that never name a column
const FILLER: &[&str] = &[
    "of", "the", "all", "a", "an", "in", "from", "across", "is",
    "are", "was", "what", "with", "each", "every", "and", "to", "on", "it", "that", "this",
];

/// Words that end the search for an aggregate's column
const STOP: &[&str] = &["by", "per", "where", "grouped", "for"];

/// Words that stand for "rows" in a count
const ROW_WORDS: &[&str] = &["rows", "row", "records", "record", "entries", "entry", "items", "lines"];

#[derive(Debug, Clone, Default)]
struct Intent {
    tables: Vec<String>,
    aggregate: Option<(AggregateKind, Option<String>)>,
    group_by: Option<String>,
    filters: Vec<(String, Comparator, Value)>,
    order: Option<(String, bool)>,
    limit: Option<u32>,
    mentioned: Vec<String>,
}

impl Intent {
    fn needs_context(&self) -> bool {
        self.tables.is_empty()
            || matches!(&self.aggregate, Some((kind, None)) if *kind != AggregateKind::Count)
    }

    /// Fill gaps from an earlier intent of the same session
    fn inherit(&mut self, prior: &Intent) {
        if self.tables.is_empty() {
            self.tables = prior.tables.clone();
        }
        let prior_column = prior.aggregate.as_ref().and_then(|(_, c)| c.clone());
        match &mut self.aggregate {
            Some((kind, column)) if column.is_none() && *kind != AggregateKind::Count => {
                *column = prior_column;
            }
            Some(_) => {}
            None => {
                // "now by region" keeps the previous aggregate
                if self.group_by.is_some() {
                    self.aggregate = prior.aggregate.clone();
                }
            }
        }
    }
}

/// Offline capability backend
#[derive(Debug, Clone, Default)]
pub struct HeuristicCapability;

impl HeuristicCapability {
    pub fn new() -> Self {
        Self
    }

    fn topic_check(&self, direction: Direction, text: &str) -> TopicVerdict {
        if TOPIC_TERMS.is_match(text) {
            TopicVerdict {
                allowed: true,
                reasoning: format!("{} text mentions data analysis terms", direction),
            }
        } else {
            TopicVerdict {
                allowed: false,
                reasoning: format!("{} text has no data analysis terms", direction),
            }
        }
    }

    fn plan(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        history: &[HistoryTurn],
        feedback: Option<&str>,
    ) -> PlanDraft {
        let question = apply_corrections(question, feedback);

        if MUTATING_INTENT.is_match(&question) {
            return PlanDraft {
                objective: question.clone(),
                tables: find_tables(&question, schema),
                columns: Vec::new(),
                operations: Vec::new(),
            };
        }

        let mut intent = extract(&question, schema);
        if intent.needs_context() {
            let prior = history
                .iter()
                .rev()
                .find(|turn| {
                    matches!(
                        turn.category,
                        Category::DirectStat | Category::StructuredQuery | Category::Visualization
                    )
                })
                .map(|turn| extract(&turn.request, schema));
            if let Some(prior) = prior {
                intent.inherit(&prior);
            }
        }

        if intent.tables.is_empty() {
            intent.tables = infer_table(&intent, schema);
        }

        build_draft(question, intent, schema)
    }

    fn generate(&self, plan: &QueryPlan) -> Result<String, CapabilityError> {
        if let Some(verb) = MUTATING_INTENT
            .captures(&plan.objective)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
        {
            let table = plan
                .target_tables
                .iter()
                .next()
                .map(|t| quote_ident(t))
                .unwrap_or_else(|| "\"data\"".to_string());
            let text = match verb.as_str() {
                "drop" => format!("DROP TABLE {}", table),
                "update" => format!("UPDATE {} SET rowid = rowid", table),
                "insert" => format!("INSERT INTO {} DEFAULT VALUES", table),
                "alter" => format!("ALTER TABLE {} RENAME TO archived", table),
                _ => format!("DELETE FROM {}", table),
            };
            return Ok(text);
        }

        sql::render_plan(plan).map_err(|e| CapabilityError::Malformed {
            stage: StageName::Generator.to_string(),
            message: e.to_string(),
        })
    }

    fn evaluate(&self, total_rows: usize) -> QueryEvaluation {
        let summary = match total_rows {
            0 => "The query ran but matched no rows.".to_string(),
            1 => "The query returned 1 row.".to_string(),
            n => format!("The query returned {} rows.", n),
        };
        QueryEvaluation {
            answers_question: true,
            confidence: if total_rows > 0 {
                Confidence::High
            } else {
                Confidence::Medium
            },
            summary,
            next_action: NextAction::Accept,
        }
    }

    fn extract_source(&self, question: &str) -> Result<DataSourceDescriptor, CapabilityError> {
        let location = QUOTED_PATH
            .captures(question)
            .or_else(|| FILE_PATH.captures(question))
            .or_else(|| DIR_PATH.captures(question))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CapabilityError::Malformed {
                stage: StageName::Loader.to_string(),
                message: "no file or directory path found in the request".to_string(),
            })?;

        let table_name = TARGET_TABLE
            .captures(question)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase());

        Ok(DataSourceDescriptor {
            location,
            table_name,
        })
    }
}

#[async_trait]
impl CapabilityGateway for HeuristicCapability {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn invoke(&self, request: CapabilityRequest) -> Result<CapabilityReply, CapabilityError> {
        let reply = match request {
            CapabilityRequest::TopicCheck { direction, text, .. } => {
                CapabilityReply::Topic(self.topic_check(direction, &text))
            }
            CapabilityRequest::Plan {
                question,
                schema,
                history,
                feedback,
            } => CapabilityReply::Plan(self.plan(&question, &schema, &history, feedback.as_deref())),
            CapabilityRequest::Generate { plan, .. } => CapabilityReply::Query(self.generate(&plan)?),
            CapabilityRequest::Evaluate { total_rows, .. } => {
                CapabilityReply::Evaluation(self.evaluate(total_rows))
            }
            CapabilityRequest::ExtractSource { question } => {
                CapabilityReply::Source(self.extract_source(&question)?)
            }
        };
        Ok(reply)
    }
}

/// Swap names the planner rejected for its first suggestion
fn apply_corrections(question: &str, feedback: Option<&str>) -> String {
    let Some(feedback) = feedback else {
        return question.to_string();
    };

    let mut corrected = question.to_string();
    for caps in CORRECTION.captures_iter(feedback) {
        let (Some(wrong), Some(right)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if let Ok(re) = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(wrong.as_str()))) {
            corrected = re.replace_all(&corrected, right.as_str()).into_owned();
        }
    }
    corrected
}

fn is_table(word: &str, schema: &SchemaSnapshot) -> bool {
    schema.table(word).is_some()
}

fn find_tables(question: &str, schema: &SchemaSnapshot) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let mut push = |name: String| {
        if !tables.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            tables.push(name);
        }
    };

    for caps in EXPLICIT_TABLE.captures_iter(question) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            let word = m.as_str().to_ascii_lowercase();
            if !FILLER.contains(&word.as_str()) {
                push(word);
            }
        }
    }
    for m in WORD.find_iter(question) {
        if let Some(table) = schema.table(m.as_str()) {
            push(table.name.clone());
        }
    }
    tables
}

/// Column word following an aggregate keyword, skipping filler
fn word_after(question: &str, end: usize) -> Option<String> {
    for m in WORD.find_iter(&question[end..]) {
        let word = m.as_str().to_ascii_lowercase();
        if STOP.contains(&word.as_str()) {
            return None;
        }
        if !FILLER.contains(&word.as_str()) {
            return Some(word);
        }
    }
    None
}

fn extract(question: &str, schema: &SchemaSnapshot) -> Intent {
    let mut intent = Intent {
        tables: find_tables(question, schema),
        ..Intent::default()
    };

    let columns_in_scope: Vec<String> = schema
        .tables
        .iter()
        .filter(|t| intent.tables.is_empty() || intent.tables.iter().any(|n| n.eq_ignore_ascii_case(&t.name)))
        .flat_map(|t| t.column_names())
        .collect();
    let is_column = |w: &str| columns_in_scope.iter().any(|c| c.eq_ignore_ascii_case(w));

    for m in WORD.find_iter(question) {
        let word = m.as_str();
        if is_column(word) && !intent.mentioned.iter().any(|c| c.eq_ignore_ascii_case(word)) {
            intent.mentioned.push(word.to_ascii_lowercase());
        }
    }

    let top = TOP_N.captures(question);
    if let Some(caps) = &top {
        intent.limit = caps.get(2).and_then(|m| m.as_str().parse().ok());
        if let Some(by) = caps.get(3) {
            let descending = caps
                .get(1)
                .map_or(true, |m| m.as_str().eq_ignore_ascii_case("top"));
            intent.order = Some((by.as_str().to_ascii_lowercase(), descending));
        }
    }

    for (kind, pattern) in AGGREGATES.iter() {
        let Some(m) = pattern.find(question) else {
            continue;
        };
        let word = word_after(question, m.end());
        let column = match word {
            Some(w) if is_table(&w, schema) || ROW_WORDS.contains(&w.as_str()) => None,
            Some(w) if *kind == AggregateKind::Count && !is_column(&w) => None,
            other => other,
        };
        intent.aggregate = Some((*kind, column));
        break;
    }

    if intent.order.is_none() {
        intent.group_by = GROUP_BY
            .captures(question)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
            .filter(|w| !is_table(w, schema) && !FILLER.contains(&w.as_str()));
    }

    for caps in FILTER.captures_iter(question) {
        let (Some(column), Some(op), Some(raw)) = (caps.get(1), caps.get(2), caps.get(3)) else {
            continue;
        };
        let comparator = match op.as_str().to_ascii_lowercase().as_str() {
            ">=" => Comparator::Gte,
            "<=" => Comparator::Lte,
            "!=" | "<>" | "is not" => Comparator::NotEq,
            ">" | "greater than" | "above" | "over" => Comparator::Gt,
            "<" | "less than" | "below" | "under" => Comparator::Lt,
            _ => Comparator::Eq,
        };
        intent
            .filters
            .push((column.as_str().to_ascii_lowercase(), comparator, parse_value(raw.as_str())));
    }

    intent
}

fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim_matches(|c| c == '\'' || c == '"');
    if let Ok(i) = trimmed.parse::<i64>() {
        Value::from(i)
    } else if let Ok(f) = trimmed.parse::<f64>() {
        Value::from(f)
    } else if trimmed.eq_ignore_ascii_case("null") {
        Value::Null
    } else {
        Value::from(trimmed)
    }
}

fn infer_table(intent: &Intent, schema: &SchemaSnapshot) -> Vec<String> {
    if schema.tables.len() == 1 {
        return schema.table_names();
    }
    let column = intent
        .aggregate
        .as_ref()
        .and_then(|(_, c)| c.clone())
        .or_else(|| intent.mentioned.first().cloned());
    match column.map(|c| schema.tables_with_column(&c)) {
        Some(tables) if tables.len() == 1 => vec![tables[0].name.clone()],
        _ => Vec::new(),
    }
}

fn build_draft(question: String, intent: Intent, schema: &SchemaSnapshot) -> PlanDraft {
    let mut operations = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    let mut note = |c: &str| {
        if !columns.iter().any(|x| x.eq_ignore_ascii_case(c)) {
            columns.push(c.to_string());
        }
    };

    for (column, comparator, value) in &intent.filters {
        note(column);
        operations.push(Operation::Filter {
            column: column.clone(),
            comparator: *comparator,
            value: value.clone(),
        });
    }

    match &intent.aggregate {
        Some((kind, column)) => {
            if let Some(c) = column {
                note(c);
            }
            if let Some(group) = intent.group_by.as_ref().filter(|_| intent.order.is_none()) {
                note(group);
                operations.push(Operation::GroupBy {
                    columns: vec![group.clone()],
                });
            }
            operations.push(Operation::Aggregate {
                kind: *kind,
                column: column.clone(),
            });
        }
        None => {
            let filtered: Vec<&String> = intent.filters.iter().map(|(c, _, _)| c).collect();
            let projection: Vec<String> = intent
                .mentioned
                .iter()
                .filter(|c| !filtered.contains(c))
                .cloned()
                .collect();
            for c in &projection {
                note(c);
            }
            if !projection.is_empty() && intent.order.is_none() && intent.tables.len() == 1 {
                let whole = schema
                    .table(&intent.tables[0])
                    .map_or(0, |t| t.columns.len());
                if projection.len() < whole {
                    operations.push(Operation::Project { columns: projection });
                }
            }
        }
    }

    if let Some((column, descending)) = &intent.order {
        note(column);
        operations.push(Operation::OrderBy {
            column: column.clone(),
            descending: *descending,
        });
    }

    match (intent.limit, &intent.aggregate) {
        (Some(n), _) => operations.push(Operation::Limit { count: n }),
        (None, None) => operations.push(Operation::Limit {
            count: DEFAULT_LISTING_LIMIT,
        }),
        _ => {}
    }

    PlanDraft {
        objective: question,
        tables: intent.tables,
        columns,
        operations,
    }
}
