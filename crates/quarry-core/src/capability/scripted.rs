//! Scripted capability backend
//!
//! Replies are queued per stage and handed out in order. Stages with an
//! empty queue are delegated to an optional fallback backend, so a test
//! can script only the generator while the guardrail and planner run
//! heuristically.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::{CapabilityGateway, CapabilityReply, CapabilityRequest, StageName};
use crate::error::CapabilityError;

type ScriptedReply = Result<CapabilityReply, CapabilityError>;

#[derive(Default)]
pub struct ScriptedCapability {
    queues: Mutex<HashMap<StageName, VecDeque<ScriptedReply>>>,
    delays: Mutex<HashMap<StageName, Duration>>,
    calls: Mutex<Vec<CapabilityRequest>>,
    fallback: Option<Arc<dyn CapabilityGateway>>,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delegate stages without queued replies to `fallback`
    pub fn with_fallback(mut self, fallback: Arc<dyn CapabilityGateway>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Sleep before answering any request for `stage`
    pub fn with_delay(self, stage: StageName, delay: Duration) -> Self {
        self.delays.lock().insert(stage, delay);
        self
    }

    pub fn push(&self, stage: StageName, reply: ScriptedReply) {
        self.queues.lock().entry(stage).or_default().push_back(reply);
    }

    /// Queue the same reply `times` times
    pub fn push_repeated(&self, stage: StageName, reply: ScriptedReply, times: usize) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(stage).or_default();
        for _ in 0..times {
            queue.push_back(reply.clone());
        }
    }

    /// Every request seen so far, in call order
    pub fn requests(&self) -> Vec<CapabilityRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, stage: StageName) -> usize {
        self.calls.lock().iter().filter(|r| r.stage() == stage).count()
    }

    pub fn remaining(&self, stage: StageName) -> usize {
        self.queues.lock().get(&stage).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl CapabilityGateway for ScriptedCapability {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: CapabilityRequest) -> Result<CapabilityReply, CapabilityError> {
        let stage = request.stage();
        self.calls.lock().push(request.clone());

        let delay = self.delays.lock().get(&stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.queues.lock().get_mut(&stage).and_then(VecDeque::pop_front);
        match (queued, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(fallback)) => fallback.invoke(request).await,
            (None, None) => Err(CapabilityError::Unavailable(format!(
                "no scripted reply for stage {}",
                stage
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_are_served_in_order() {
        let scripted = ScriptedCapability::new();
        scripted.push(StageName::Generator, Ok(CapabilityReply::Query("SELECT 1".into())));
        scripted.push(StageName::Generator, Ok(CapabilityReply::Query("SELECT 2".into())));

        let generate = || CapabilityRequest::ExtractSource {
            question: String::new(),
        };
        // ExtractSource belongs to the loader queue, which is empty.
        assert!(scripted.invoke(generate()).await.is_err());
        assert_eq!(scripted.remaining(StageName::Generator), 2);
        assert_eq!(scripted.call_count(StageName::Loader), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_without_fallback_is_unavailable() {
        let scripted = ScriptedCapability::new();
        let err = scripted
            .invoke(CapabilityRequest::ExtractSource {
                question: "load data.csv".into(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CapabilityError::Unavailable(_)));
    }
}
