//! Query Executor contract and the read-only denylist

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::types::ResultSet;

/// Keywords that can change data or schema
pub const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "REPLACE", "TRUNCATE", "MERGE",
    "UPSERT", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "GRANT", "REVOKE",
];

lazy_static! {
    static ref MUTATING: Regex = Regex::new(&format!(
        r"(?i)\b({})\b",
        MUTATING_KEYWORDS
            .iter()
            .filter(|kw| **kw != "REPLACE")
            .copied()
            .collect::<Vec<_>>()
            .join("|")
    ))
    .unwrap();
    // `replace()` is a read-only scalar function; only the statement forms write
    static ref REPLACE_STATEMENT: Regex =
        Regex::new(r"(?i)(?:^\s*|;\s*|\bINSERT\s+OR\s+)REPLACE\b|\bREPLACE\s+INTO\b").unwrap();
    // string literals and double-quoted identifiers, leftmost first
    static ref QUOTED: Regex = Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*""#).unwrap();
}

/// `query` with string literals and quoted identifiers emptied
fn mask_quoted(query: &str) -> String {
    QUOTED
        .replace_all(query, |caps: &regex::Captures<'_>| {
            if caps[0].starts_with('"') {
                "\"\""
            } else {
                "''"
            }
        })
        .into_owned()
}

/// First mutating keyword in `query`, ignoring string literals and quoted identifiers
pub fn find_mutating_keyword(query: &str) -> Option<String> {
    let masked = mask_quoted(query);
    let keyword = MUTATING.find(&masked).map(|m| (m.start(), m.as_str()));
    let replace = REPLACE_STATEMENT.find(&masked).map(|m| (m.start(), "REPLACE"));

    let first = match (keyword, replace) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a.1 } else { b.1 }),
        (a, b) => a.or(b).map(|(_, kw)| kw),
    };
    first.map(str::to_ascii_uppercase)
}

/// Whether `query` holds more than one statement
pub fn has_multiple_statements(query: &str) -> bool {
    let masked = mask_quoted(query);
    let body = masked.trim().trim_end_matches(';');
    body.contains(';')
}

/// Runs query text against the storage engine
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run read-only query text and return its rows
    async fn run(&self, query: &str) -> Result<ResultSet, ExecutionError>;

    /// Run with a time ceiling that covers this statement only.
    ///
    /// The default races [`run`](Self::run) against a timer. Engines that
    /// share a connection between callers override this so the ceiling
    /// starts once the statement owns the connection and stops nothing else.
    async fn run_within(&self, query: &str, timeout: Duration) -> Result<ResultSet, ExecutionError> {
        match tokio::time::timeout(timeout, self.run(query)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(timeout)),
        }
    }
}

/// Run with a time ceiling
pub async fn run_with_timeout(
    executor: &dyn QueryExecutor,
    query: &str,
    timeout: Duration,
) -> Result<ResultSet, ExecutionError> {
    executor.run_within(query, timeout).await
}

pub(crate) fn timeout_error(timeout: Duration) -> ExecutionError {
    ExecutionError::new(
        ExecutionErrorKind::Timeout,
        format!("query exceeded {}ms", timeout.as_millis()),
    )
}
