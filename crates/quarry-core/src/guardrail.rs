//! Guardrail Filter - topic gate on both edges of the pipeline
//!
//! Every inbound request and every outbound response is checked against
//! the configured topic policy through the capability gateway. The filter
//! fails closed: a capability error or timeout counts as a rejection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{invoke_with_timeout, CapabilityGateway, CapabilityRequest};
use crate::config::GuardrailSettings;

/// Which edge of the pipeline a payload crosses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GuardrailDecision {
    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

pub struct GuardrailFilter {
    gateway: Arc<dyn CapabilityGateway>,
    policy: GuardrailSettings,
    timeout: Duration,
}

impl GuardrailFilter {
    pub fn new(gateway: Arc<dyn CapabilityGateway>, policy: GuardrailSettings, timeout: Duration) -> Self {
        Self {
            gateway,
            policy,
            timeout,
        }
    }

    /// Check one payload against the topic policy
    pub async fn check(&self, text: &str, direction: Direction) -> GuardrailDecision {
        let request = CapabilityRequest::TopicCheck {
            direction,
            text: text.to_string(),
            allowed_topics: self.policy.allowed_topics.clone(),
        };

        let reply = invoke_with_timeout(self.gateway.as_ref(), request, self.timeout)
            .await
            .and_then(|r| r.into_topic());

        match reply {
            Ok(verdict) => {
                if !verdict.allowed {
                    tracing::info!(%direction, reason = %verdict.reasoning, "Guardrail rejected payload");
                }
                GuardrailDecision {
                    allowed: verdict.allowed,
                    reason: verdict.reasoning,
                }
            }
            Err(e) => {
                tracing::warn!(%direction, error = %e, "Guardrail check failed, rejecting");
                GuardrailDecision::blocked(format!("topic check unavailable: {}", e))
            }
        }
    }

    /// Fixed message returned when the inbound check rejects
    pub fn refusal_message(&self) -> &str {
        &self.policy.refusal_message
    }

    /// Fixed message substituted when the outbound check rejects
    pub fn redirect_message(&self) -> &str {
        &self.policy.outbound_redirect_message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityReply, ScriptedCapability, StageName, TopicVerdict};
    use crate::error::CapabilityError;

    fn filter(gateway: Arc<ScriptedCapability>) -> GuardrailFilter {
        GuardrailFilter::new(gateway, GuardrailSettings::default(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_allowed_topic_passes() {
        let gateway = Arc::new(ScriptedCapability::new());
        gateway.push(
            StageName::Guardrail,
            Ok(CapabilityReply::Topic(TopicVerdict {
                allowed: true,
                reasoning: "asks about a table".into(),
            })),
        );

        let decision = filter(gateway).check("average price", Direction::Inbound).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_capability_failure_fails_closed() {
        let gateway = Arc::new(ScriptedCapability::new());
        gateway.push(
            StageName::Guardrail,
            Err(CapabilityError::Unavailable("connection refused".into())),
        );

        let decision = filter(gateway).check("average price", Direction::Inbound).await;
        assert!(!decision.allowed);
        assert!(decision.reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_wrong_reply_kind_fails_closed() {
        let gateway = Arc::new(ScriptedCapability::new());
        gateway.push(StageName::Guardrail, Ok(CapabilityReply::Query("SELECT 1".into())));

        let decision = filter(gateway).check("anything", Direction::Outbound).await;
        assert!(!decision.allowed);
    }
}
