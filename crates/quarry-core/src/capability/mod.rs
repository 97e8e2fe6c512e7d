//! Capability Gateway
//!
//! The single seam through which stages reach a language-model style
//! backend. Requests and replies are typed per stage so a backend can
//! never hand the planner a query string or the generator a plan.
//!
//! Three backends ship with the crate:
//! - [`HeuristicCapability`]: deterministic, offline, rule based
//! - [`OpenAiCompatibleCapability`]: any `/chat/completions` endpoint
//! - [`ScriptedCapability`]: queued replies for tests

pub mod heuristic;
pub mod openai_compatible;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::CapabilityError;
use crate::guardrail::Direction;
use crate::schema::SchemaSnapshot;
use crate::types::{Category, DataSourceDescriptor, Operation, QueryPlan, ResultSet};

pub use heuristic::HeuristicCapability;
pub use openai_compatible::OpenAiCompatibleCapability;
pub use scripted::ScriptedCapability;

/// Pipeline stage that issued a capability request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Guardrail,
    Planner,
    Generator,
    Evaluator,
    Loader,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Guardrail => "guardrail",
            StageName::Planner => "planner",
            StageName::Generator => "generator",
            StageName::Evaluator => "evaluator",
            StageName::Loader => "loader",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One earlier exchange of the same session, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub request: String,
    pub response: String,
    pub category: Category,
}

/// Stage-typed capability request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum CapabilityRequest {
    /// Is this text within the allowed topics?
    TopicCheck {
        direction: Direction,
        text: String,
        allowed_topics: Vec<String>,
    },

    /// Draft a plan for the question against this schema
    Plan {
        question: String,
        schema: SchemaSnapshot,
        history: Vec<HistoryTurn>,
        /// Diagnostic from the previous plan attempt
        feedback: Option<String>,
    },

    /// Write query text for the plan
    Generate {
        plan: QueryPlan,
        attempt: u32,
        /// Diagnostic from the previous generation attempt
        hint: Option<String>,
    },

    /// Does the executed result answer the question?
    Evaluate {
        question: String,
        query: String,
        preview: ResultSet,
        total_rows: usize,
    },

    /// Which file or directory does the user want loaded?
    ExtractSource { question: String },
}

impl CapabilityRequest {
    pub fn stage(&self) -> StageName {
        match self {
            CapabilityRequest::TopicCheck { .. } => StageName::Guardrail,
            CapabilityRequest::Plan { .. } => StageName::Planner,
            CapabilityRequest::Generate { .. } => StageName::Generator,
            CapabilityRequest::Evaluate { .. } => StageName::Evaluator,
            CapabilityRequest::ExtractSource { .. } => StageName::Loader,
        }
    }
}

/// Topic check verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicVerdict {
    pub allowed: bool,
    pub reasoning: String,
}

/// Unresolved plan as proposed by the capability
///
/// Names are free text here; the planner resolves them against the
/// schema snapshot before anything downstream sees them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// Evaluator confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// What the evaluator wants done with the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Accept,
    RetryQuery,
    NeedClarification,
}

/// Evaluator reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvaluation {
    pub answers_question: bool,
    pub confidence: Confidence,
    pub summary: String,
    pub next_action: NextAction,
}

/// Stage-typed capability reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum CapabilityReply {
    Topic(TopicVerdict),
    Plan(PlanDraft),
    Query(String),
    Evaluation(QueryEvaluation),
    Source(DataSourceDescriptor),
}

impl CapabilityReply {
    fn kind(&self) -> &'static str {
        match self {
            CapabilityReply::Topic(_) => "topic",
            CapabilityReply::Plan(_) => "plan",
            CapabilityReply::Query(_) => "query",
            CapabilityReply::Evaluation(_) => "evaluation",
            CapabilityReply::Source(_) => "source",
        }
    }

    fn mismatch(self, stage: StageName) -> CapabilityError {
        CapabilityError::Malformed {
            stage: stage.to_string(),
            message: format!("unexpected {} reply", self.kind()),
        }
    }

    pub fn into_topic(self) -> Result<TopicVerdict, CapabilityError> {
        match self {
            CapabilityReply::Topic(v) => Ok(v),
            other => Err(other.mismatch(StageName::Guardrail)),
        }
    }

    pub fn into_plan(self) -> Result<PlanDraft, CapabilityError> {
        match self {
            CapabilityReply::Plan(p) => Ok(p),
            other => Err(other.mismatch(StageName::Planner)),
        }
    }

    pub fn into_query(self) -> Result<String, CapabilityError> {
        match self {
            CapabilityReply::Query(q) => Ok(q),
            other => Err(other.mismatch(StageName::Generator)),
        }
    }

    pub fn into_evaluation(self) -> Result<QueryEvaluation, CapabilityError> {
        match self {
            CapabilityReply::Evaluation(e) => Ok(e),
            other => Err(other.mismatch(StageName::Evaluator)),
        }
    }

    pub fn into_source(self) -> Result<DataSourceDescriptor, CapabilityError> {
        match self {
            CapabilityReply::Source(s) => Ok(s),
            other => Err(other.mismatch(StageName::Loader)),
        }
    }
}

/// Backend behind the capability seam
#[async_trait]
pub trait CapabilityGateway: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn invoke(&self, request: CapabilityRequest) -> Result<CapabilityReply, CapabilityError>;
}

/// Invoke with a time ceiling; an elapsed ceiling becomes [`CapabilityError::Timeout`]
pub async fn invoke_with_timeout(
    gateway: &dyn CapabilityGateway,
    request: CapabilityRequest,
    timeout: Duration,
) -> Result<CapabilityReply, CapabilityError> {
    let stage = request.stage();
    match tokio::time::timeout(timeout, gateway.invoke(request)).await {
        Ok(reply) => reply,
        Err(_) => {
            tracing::warn!(
                backend = gateway.name(),
                stage = %stage,
                timeout_ms = timeout.as_millis() as u64,
                "Capability call timed out"
            );
            Err(CapabilityError::Timeout(timeout.as_millis() as u64))
        }
    }
}
