//! Session Store - append-only conversation history per session
//!
//! Appends are synchronous and happen after the Hub's last suspension
//! point, so a cancelled request either records its full exchange or
//! nothing at all. Each session's history is visible only through its
//! own id.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::capability::HistoryTurn;
use crate::error::Result;
use crate::types::{ChatResponse, Request, SessionId};

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Answered,
    /// Guardrail or unsafe-operation refusal
    Refused,
    Aborted,
}

/// One request with the response it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub request: Request,
    pub response: ChatResponse,
    pub outcome: ExchangeOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(request: Request, response: ChatResponse, outcome: ExchangeOutcome) -> Self {
        Self {
            request,
            response,
            outcome,
            recorded_at: Utc::now(),
        }
    }

    pub fn as_turn(&self) -> HistoryTurn {
        HistoryTurn {
            request: self.request.raw_text.clone(),
            response: self.response.message.clone(),
            category: self.response.category,
        }
    }
}

/// Activity summary for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub message_count: u64,
    pub per_category: BTreeMap<String, u64>,
    pub refusals: u64,
    pub aborts: u64,
    pub first_activity: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionStats {
    fn starting_at(at: DateTime<Utc>) -> Self {
        Self {
            message_count: 0,
            per_category: BTreeMap::new(),
            refusals: 0,
            aborts: 0,
            first_activity: at,
            last_activity: at,
        }
    }

    fn record(&mut self, exchange: &Exchange) {
        self.message_count += 1;
        *self
            .per_category
            .entry(exchange.response.category.as_str().to_string())
            .or_insert(0) += 1;
        match exchange.outcome {
            ExchangeOutcome::Refused => self.refusals += 1,
            ExchangeOutcome::Aborted => self.aborts += 1,
            ExchangeOutcome::Answered => {}
        }
        self.first_activity = self.first_activity.min(exchange.recorded_at);
        self.last_activity = self.last_activity.max(exchange.recorded_at);
    }

    /// Fold a history into stats; `None` for an empty history
    pub fn from_history(history: &[Exchange]) -> Option<Self> {
        let first = history.first()?;
        let mut stats = Self::starting_at(first.recorded_at);
        for exchange in history {
            stats.record(exchange);
        }
        Some(stats)
    }
}

/// Per-session conversation log
pub trait SessionStore: Send + Sync {
    /// Append one exchange to its session
    fn append(&self, exchange: Exchange) -> Result<()>;

    /// Full history of a session, oldest first
    fn read_history(&self, session_id: &SessionId) -> Result<Vec<Exchange>>;

    fn stats(&self, session_id: &SessionId) -> Result<Option<SessionStats>>;

    /// Drop a session; returns whether it existed
    fn close(&self, session_id: &SessionId) -> Result<bool>;

    /// Last `limit` turns, oldest first
    fn recent_turns(&self, session_id: &SessionId, limit: usize) -> Result<Vec<HistoryTurn>> {
        let history = self.read_history(session_id)?;
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).map(Exchange::as_turn).collect())
    }
}

#[derive(Debug, Default)]
struct SessionRecord {
    history: Vec<Exchange>,
    stats: Option<SessionStats>,
}

/// Session store held in process memory
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl SessionStore for InMemorySessionStore {
    fn append(&self, exchange: Exchange) -> Result<()> {
        let mut sessions = self.sessions.write();
        let record = sessions.entry(exchange.request.session_id.clone()).or_default();
        record
            .stats
            .get_or_insert_with(|| SessionStats::starting_at(exchange.recorded_at))
            .record(&exchange);
        record.history.push(exchange);
        Ok(())
    }

    fn read_history(&self, session_id: &SessionId) -> Result<Vec<Exchange>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .map(|r| r.history.clone())
            .unwrap_or_default())
    }

    fn stats(&self, session_id: &SessionId) -> Result<Option<SessionStats>> {
        Ok(self.sessions.read().get(session_id).and_then(|r| r.stats.clone()))
    }

    fn close(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.sessions.write().remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    fn exchange(session: &str, seq: u64, text: &str, category: Category, outcome: ExchangeOutcome) -> Exchange {
        let response = match outcome {
            ExchangeOutcome::Answered => ChatResponse::answer(category, format!("answer to {text}")),
            _ => ChatResponse::refusal(category, "no"),
        };
        Exchange::new(Request::new(SessionId::from(session), text, seq), response, outcome)
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = InMemorySessionStore::new();
        store
            .append(exchange("a", 1, "avg price", Category::DirectStat, ExchangeOutcome::Answered))
            .unwrap();
        store
            .append(exchange("b", 2, "count rows", Category::StructuredQuery, ExchangeOutcome::Answered))
            .unwrap();

        let a = store.read_history(&SessionId::from("a")).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].request.raw_text, "avg price");
        assert!(store.read_history(&SessionId::from("c")).unwrap().is_empty());
    }

    #[test]
    fn test_stats_count_outcomes() {
        let store = InMemorySessionStore::new();
        let id = SessionId::from("s");
        store
            .append(exchange("s", 1, "avg price", Category::DirectStat, ExchangeOutcome::Answered))
            .unwrap();
        store
            .append(exchange("s", 2, "joke", Category::Rejected, ExchangeOutcome::Refused))
            .unwrap();
        store
            .append(exchange("s", 3, "avg salary", Category::StructuredQuery, ExchangeOutcome::Aborted))
            .unwrap();

        let stats = store.stats(&id).unwrap().unwrap();
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.refusals, 1);
        assert_eq!(stats.aborts, 1);
        assert_eq!(stats.per_category.get("direct_stat"), Some(&1));
        assert!(stats.first_activity <= stats.last_activity);
    }

    #[test]
    fn test_recent_turns_keeps_tail_in_order() {
        let store = InMemorySessionStore::new();
        for i in 1..=5 {
            store
                .append(exchange("s", i, &format!("q{i}"), Category::StructuredQuery, ExchangeOutcome::Answered))
                .unwrap();
        }
        let turns = store.recent_turns(&SessionId::from("s"), 2).unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.request.as_str()).collect();
        assert_eq!(texts, vec!["q4", "q5"]);
    }

    #[test]
    fn test_close_drops_history() {
        let store = InMemorySessionStore::new();
        store
            .append(exchange("s", 1, "avg price", Category::DirectStat, ExchangeOutcome::Answered))
            .unwrap();
        assert!(store.close(&SessionId::from("s")).unwrap());
        assert!(!store.close(&SessionId::from("s")).unwrap());
        assert_eq!(store.session_count(), 0);
    }
}
