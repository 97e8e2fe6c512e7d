//! Error types for Quarry Core
//!
//! This module defines the failure taxonomy of the orchestrator.
//! Stage errors are plain values the Hub inspects to decide between
//! retrying, re-planning and aborting; only [`QuarryError`] ever leaves
//! the Hub, and only for infrastructure failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Main error type for Quarry operations
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Planning errors that escaped the re-plan loop
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    /// Generation errors
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// Execution errors raised by the storage engine
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Capability gateway errors
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Data loading errors
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Chart rendering errors
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Schema inspector unreachable
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Storage engine unreachable or broken (tables or session log)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<QuarryError>,
    },
}

impl From<rusqlite::Error> for QuarryError {
    fn from(e: rusqlite::Error) -> Self {
        QuarryError::Storage(e.to_string())
    }
}

/// Kind of schema reference the planner could not resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Table,
    Column,
}

/// Errors raised while turning a request into a plan
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanningError {
    #[error("{kind:?} '{name}' does not exist{}", scope_suffix(.table))]
    UnknownReference {
        kind: ReferenceKind,
        name: String,
        /// Table the column was looked up in (columns only)
        table: Option<String>,
        /// Closest valid names, best first
        suggestions: Vec<String>,
        /// Every valid name in scope, used in user-facing diagnostics
        available: Vec<String>,
    },

    #[error("Cannot compute {aggregate} of text column '{column}' in table '{table}'")]
    NonNumericAggregate {
        aggregate: String,
        column: String,
        table: String,
        numeric_columns: Vec<String>,
    },

    #[error("No column given for {aggregate}")]
    MissingColumn {
        aggregate: String,
        available: Vec<String>,
    },

    #[error("No tables are loaded")]
    NoTables,

    #[error("Plan names no table")]
    NoTarget,
}

fn scope_suffix(table: &Option<String>) -> String {
    match table {
        Some(t) => format!(" in table '{}'", t),
        None => String::new(),
    }
}

impl PlanningError {
    /// Diagnostic sentence naming the valid alternatives
    pub fn diagnostic(&self) -> String {
        match self {
            PlanningError::UnknownReference {
                available,
                suggestions,
                ..
            } => {
                let mut msg = self.to_string();
                if !suggestions.is_empty() {
                    msg.push_str(&format!(". Did you mean: {}?", suggestions.join(", ")));
                }
                if available.is_empty() {
                    msg.push_str(". Nothing is available in that scope");
                } else {
                    msg.push_str(&format!(". Available: {}", available.join(", ")));
                }
                msg
            }
            PlanningError::NonNumericAggregate {
                numeric_columns, ..
            } => {
                if numeric_columns.is_empty() {
                    format!("{}. The table has no numeric columns", self)
                } else {
                    format!("{}. Numeric columns: {}", self, numeric_columns.join(", "))
                }
            }
            PlanningError::MissingColumn { available, .. } => {
                format!("{}. Available: {}", self, available.join(", "))
            }
            PlanningError::NoTables => {
                "No tables are loaded. Load a CSV or JSON file first".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Errors raised by the generator stage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Candidate query contains mutating keyword '{keyword}'")]
    UnsafeOperation { keyword: String, attempt: u32 },

    #[error("Candidate query is empty")]
    Empty { attempt: u32 },
}

/// Classification of storage execution failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// Malformed query text
    Syntax,
    /// Query names a table or column that does not exist
    MissingReference,
    /// Non-read-only construct rejected by the executor
    Forbidden,
    /// Execution exceeded its time ceiling
    Timeout,
    /// Anything else
    Other,
}

/// Failure executing a query
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised by the schema inspector
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Table '{0}' does not exist")]
    UnknownTable(String),

    #[error("Schema unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single pipeline stage, as seen by the Hub
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Errors raised by the capability gateway
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("Capability call timed out after {0}ms")]
    Timeout(u64),

    #[error("Malformed capability reply for stage {stage}: {message}")]
    Malformed { stage: String, message: String },
}

/// Errors raised while loading a data source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Path '{0}' does not exist")]
    NotFound(String),

    #[error("Permission denied accessing '{0}'")]
    PermissionDenied(String),

    #[error("File '{0}' appears to be empty or contains no valid data")]
    Empty(String),

    #[error("Format issue in '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Unsupported file type for '{0}' (expected .csv or .json)")]
    Unsupported(String),

    #[error("No CSV or JSON files found in '{0}'")]
    NoSupportedFiles(String),

    #[error("Storage rejected '{table}': {message}")]
    Storage { table: String, message: String },
}

/// Errors raised by chart renderers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("Nothing to chart: the result set is empty")]
    NoData,

    #[error("Cannot chart this result: {0}")]
    Unchartable(String),

    #[error("Chart output failed: {0}")]
    Output(String),
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Routing table has no route for category {0}")]
    MissingRoute(String),

    #[error("Routing table declares category {0} more than once")]
    DuplicateRoute(String),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

impl QuarryError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
