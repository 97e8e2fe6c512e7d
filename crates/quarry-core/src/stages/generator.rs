//! Generator - renders a resolved plan into candidate query text
//!
//! The generator never executes anything. Its only safety duty is the
//! denylist: a candidate containing a mutating keyword is refused here
//! and never reaches the executor.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{invoke_with_timeout, CapabilityGateway, CapabilityRequest};
use crate::error::{GenerationError, StageError};
use crate::executor::find_mutating_keyword;
use crate::types::{CandidateQuery, QueryPlan};

lazy_static! {
    static ref FENCE: Regex = Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").unwrap();
}

pub struct Generator {
    gateway: Arc<dyn CapabilityGateway>,
    timeout: Duration,
}

impl Generator {
    pub fn new(gateway: Arc<dyn CapabilityGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    /// Produce the candidate for `attempt` (1-based) of `plan`
    pub async fn generate(
        &self,
        plan: &QueryPlan,
        attempt: u32,
        hint: Option<String>,
    ) -> Result<CandidateQuery, StageError> {
        let raw = invoke_with_timeout(
            self.gateway.as_ref(),
            CapabilityRequest::Generate {
                plan: plan.clone(),
                attempt,
                hint,
            },
            self.timeout,
        )
        .await?
        .into_query()?;

        let text = clean(&raw);
        if text.is_empty() {
            return Err(GenerationError::Empty { attempt }.into());
        }

        if let Some(keyword) = find_mutating_keyword(&text) {
            tracing::warn!(attempt, keyword = %keyword, "Refusing mutating candidate");
            return Err(GenerationError::UnsafeOperation { keyword, attempt }.into());
        }

        Ok(CandidateQuery {
            text,
            origin_plan: plan.id,
            attempt_number: attempt,
        })
    }
}

/// Strip markdown fences and surrounding whitespace
fn clean(raw: &str) -> String {
    let body = match FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw,
    };
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityReply, ScriptedCapability, StageName};
    use crate::error::CapabilityError;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn plan() -> QueryPlan {
        QueryPlan {
            id: Uuid::new_v4(),
            objective: "average price".into(),
            target_tables: ["products".to_string()].into_iter().collect(),
            target_columns: BTreeSet::new(),
            requested_operations: vec![],
            plan_attempt: 1,
        }
    }

    fn generator(replies: Vec<CapabilityReply>) -> Generator {
        let gateway = ScriptedCapability::new();
        for reply in replies {
            gateway.push(StageName::Generator, Ok(reply));
        }
        Generator::new(Arc::new(gateway), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_fenced_reply_is_cleaned() {
        let plan = plan();
        let candidate = generator(vec![CapabilityReply::Query(
            "```sql\nSELECT AVG(price) FROM products\n```".into(),
        )])
        .generate(&plan, 2, None)
        .await
        .unwrap();

        assert_eq!(candidate.text, "SELECT AVG(price) FROM products");
        assert_eq!(candidate.origin_plan, plan.id);
        assert_eq!(candidate.attempt_number, 2);
    }

    #[tokio::test]
    async fn test_mutating_candidate_is_refused() {
        let err = generator(vec![CapabilityReply::Query("DELETE FROM products".into())])
            .generate(&plan(), 1, None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            StageError::Generation(GenerationError::UnsafeOperation {
                keyword: "DELETE".into(),
                attempt: 1
            })
        );
    }

    #[tokio::test]
    async fn test_empty_candidate() {
        let err = generator(vec![CapabilityReply::Query("  ```\n```  ".into())])
            .generate(&plan(), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err, StageError::Generation(GenerationError::Empty { attempt: 1 }));
    }

    #[tokio::test]
    async fn test_capability_errors_pass_through() {
        let gateway = ScriptedCapability::new();
        gateway.push(StageName::Generator, Err(CapabilityError::Timeout(5)));
        let err = Generator::new(Arc::new(gateway), Duration::from_secs(1))
            .generate(&plan(), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err, StageError::Capability(CapabilityError::Timeout(5)));
    }
}
