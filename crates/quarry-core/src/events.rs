//! Events published by the Hub while it processes requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::guardrail::Direction;
use crate::types::{Category, SessionId, VerdictOutcome};

/// A published event with its envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEventEnvelope {
    pub session_id: SessionId,
    pub arrival_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: HubEvent,
}

/// Hub event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HubEvent {
    /// Request accepted into the pipeline
    RequestReceived { length: usize },

    /// A guardrail check rejected a payload
    GuardrailBlocked {
        direction: Direction,
        reason: String,
    },

    /// Classifier picked a route
    Classified { category: Category },

    /// Planner failed for this plan attempt
    PlanRejected { plan_attempt: u32, diagnostic: String },

    /// Generator produced a candidate
    CandidateGenerated { plan_attempt: u32, attempt: u32 },

    /// Generator refused a mutating candidate
    UnsafeCandidate { attempt: u32, keyword: String },

    /// Validator verdict for a candidate
    Verdict {
        plan_attempt: u32,
        attempt: u32,
        outcome: VerdictOutcome,
    },

    /// Data source registered
    Loaded { tables: Vec<String> },

    /// Chart artifact produced
    Visualized { artifact: String },

    /// Request terminated without an answer
    Aborted { reason: String },

    /// Response returned and recorded
    Responded { success: bool, category: Category },
}

/// Broadcast publisher; sending never blocks and never fails the caller
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, session_id: &SessionId, arrival_sequence: u64, event: HubEvent) {
        // No receivers is the common case outside tests.
        let _ = self.tx.send(HubEventEnvelope {
            session_id: session_id.clone(),
            arrival_sequence,
            timestamp: Utc::now(),
            event,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(
            &SessionId::from("s1"),
            7,
            HubEvent::Classified {
                category: Category::DirectStat,
            },
        );

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.arrival_sequence, 7);
        assert_eq!(
            envelope.event,
            HubEvent::Classified {
                category: Category::DirectStat
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(&SessionId::from("s1"), 1, HubEvent::RequestReceived { length: 3 });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(HubEvent::Aborted {
            reason: "ceiling".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "Aborted");
        assert_eq!(json["data"]["reason"], "ceiling");
    }
}
