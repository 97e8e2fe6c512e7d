//! Core value types shared by the Hub and its stages
//!
//! Everything here is an immutable envelope: stages receive one,
//! return another, and never hold on to either between requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Conversation identifier supplied by the chat boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session:{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound chat message, stamped on arrival
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub session_id: SessionId,
    pub raw_text: String,
    /// Hub-wide monotonic arrival counter
    pub arrival_sequence: u64,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn new(session_id: SessionId, raw_text: impl Into<String>, arrival_sequence: u64) -> Self {
        Self {
            session_id,
            raw_text: raw_text.into(),
            arrival_sequence,
            received_at: Utc::now(),
        }
    }
}

/// Routing category picked by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DirectStat,
    StructuredQuery,
    Visualization,
    LoadData,
    Rejected,
}

impl Category {
    /// Every category, used to check routing completeness
    pub const ALL: [Category; 5] = [
        Category::DirectStat,
        Category::StructuredQuery,
        Category::Visualization,
        Category::LoadData,
        Category::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::DirectStat => "direct_stat",
            Category::StructuredQuery => "structured_query",
            Category::Visualization => "visualization",
            Category::LoadData => "load_data",
            Category::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation requested over a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Avg,
    Sum,
    Count,
    Min,
    Max,
    Median,
}

impl AggregateKind {
    pub fn label(&self) -> &'static str {
        match self {
            AggregateKind::Avg => "average",
            AggregateKind::Sum => "sum",
            AggregateKind::Count => "count",
            AggregateKind::Min => "minimum",
            AggregateKind::Max => "maximum",
            AggregateKind::Median => "median",
        }
    }

    /// Whether the aggregate only makes sense over numeric values
    pub fn needs_numeric(&self) -> bool {
        !matches!(self, AggregateKind::Count)
    }
}

/// The direct-answer result for a simple statistic over one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRequest {
    pub kind: AggregateKind,
    pub table: String,
    pub column: String,
    /// Count only rows whose column equals this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching: Option<serde_json::Value>,
}

/// Classifier output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub confidence: f32,
    pub rationale: String,
    /// Present when `category == DirectStat`
    pub stat: Option<StatRequest>,
}

/// Filter comparator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl Comparator {
    pub fn sql(&self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::NotEq => "<>",
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Like => "LIKE",
        }
    }
}

/// Declarative operation descriptor inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Select these columns as-is
    Project { columns: Vec<String> },
    Aggregate {
        kind: AggregateKind,
        /// `None` means `COUNT(*)`
        column: Option<String>,
    },
    GroupBy { columns: Vec<String> },
    Filter {
        column: String,
        comparator: Comparator,
        value: serde_json::Value,
    },
    OrderBy { column: String, descending: bool },
    Limit { count: u32 },
}

impl Operation {
    /// Column names this operation references
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Operation::Project { columns } | Operation::GroupBy { columns } => {
                columns.iter().map(String::as_str).collect()
            }
            Operation::Aggregate { column, .. } => column.iter().map(String::as_str).collect(),
            Operation::Filter { column, .. } | Operation::OrderBy { column, .. } => {
                vec![column.as_str()]
            }
            Operation::Limit { .. } => Vec::new(),
        }
    }
}

/// Declarative plan: which data and which operations, never query text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub id: Uuid,
    /// The request restated for the generator
    pub objective: String,
    pub target_tables: BTreeSet<String>,
    pub target_columns: BTreeSet<String>,
    pub requested_operations: Vec<Operation>,
    /// 1-based plan attempt that produced this plan
    pub plan_attempt: u32,
}

impl QueryPlan {
    pub fn aggregates(&self) -> impl Iterator<Item = (AggregateKind, Option<&str>)> {
        self.requested_operations.iter().filter_map(|op| match op {
            Operation::Aggregate { kind, column } => Some((*kind, column.as_deref())),
            _ => None,
        })
    }

    pub fn has_grouping(&self) -> bool {
        self.requested_operations
            .iter()
            .any(|op| matches!(op, Operation::GroupBy { .. }))
    }

    pub fn has_filter(&self) -> bool {
        self.requested_operations
            .iter()
            .any(|op| matches!(op, Operation::Filter { .. }))
    }

    /// An ungrouped aggregate always yields exactly one row
    pub fn implies_result(&self) -> bool {
        self.aggregates().next().is_some() && !self.has_grouping()
    }

    /// The single table this plan reads from, when there is exactly one
    pub fn primary_table(&self) -> Option<&str> {
        if self.target_tables.len() == 1 {
            self.target_tables.iter().next().map(String::as_str)
        } else {
            None
        }
    }
}

/// Query text produced by the generator for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub text: String,
    /// Id of the plan this candidate was generated from
    pub origin_plan: Uuid,
    /// 1-based generation attempt within the current plan
    pub attempt_number: u32,
}

/// Validator decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Accept,
    Regenerate,
    RePlan,
    Reject,
}

/// Validator output for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub outcome: VerdictOutcome,
    pub diagnostic: String,
    /// Result set the verdict vouches for, present on `Accept`
    pub corrected_result: Option<ResultSet>,
    /// Short evaluator summary, when semantic review ran
    pub summary: Option<String>,
}

impl ValidationVerdict {
    pub fn accept(result: ResultSet, summary: Option<String>) -> Self {
        Self {
            outcome: VerdictOutcome::Accept,
            diagnostic: "result accepted".to_string(),
            corrected_result: Some(result),
            summary,
        }
    }

    pub fn retry(outcome: VerdictOutcome, diagnostic: impl Into<String>) -> Self {
        Self {
            outcome,
            diagnostic: diagnostic.into(),
            corrected_result: None,
            summary: None,
        }
    }
}

/// Ordered rows returned by the executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// The single value of a 1x1 result
    pub fn scalar(&self) -> Option<&serde_json::Value> {
        match (self.rows.len(), self.rows.first()) {
            (1, Some(row)) if row.len() == 1 => row.first(),
            _ => None,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// Where to load new data from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    /// File or directory path
    pub location: String,
    /// Explicit table name for single-file loads
    pub table_name: Option<String>,
}

/// Inbound message at the chat boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: SessionId,
    pub message: String,
}

impl ChatRequest {
    pub fn new(session_id: impl Into<SessionId>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
        }
    }
}

/// Outbound message at the chat boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// `false` only for guardrail refusals and aborted requests
    pub success: bool,
    pub message: String,
    pub category: Category,
    /// Chart artifact produced by the visualization path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl ChatResponse {
    pub fn answer(category: Category, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            category,
            artifact: None,
        }
    }

    pub fn refusal(category: Category, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            category,
            artifact: None,
        }
    }
}
