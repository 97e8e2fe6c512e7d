//! Validator - the only stage that can mark a candidate final
//!
//! A candidate is executed, its failure (if any) is classified, and a
//! successful result goes through mechanical sanity checks followed by
//! an optional semantic review. The verdict tells the Hub what to do
//! next; ceilings turn a retry verdict into `Reject` so the Hub never
//! has to second-guess the validator.
//!
//! | execution outcome          | verdict      |
//! |----------------------------|--------------|
//! | syntax error, timeout      | `Regenerate` |
//! | missing table or column    | `RePlan`     |
//! | forbidden, other           | `Reject`     |
//! | implausible result         | `Regenerate` |
//! | evaluator asks for a retry | `Regenerate` |

use std::sync::Arc;
use std::time::Duration;

use crate::capability::{invoke_with_timeout, CapabilityGateway, CapabilityRequest, NextAction};
use crate::config::ValidatorSettings;
use crate::error::{CapabilityError, ExecutionError, ExecutionErrorKind};
use crate::executor::{run_with_timeout, QueryExecutor};
use crate::sql::range_probe;
use crate::types::{AggregateKind, CandidateQuery, QueryPlan, ResultSet, ValidationVerdict, VerdictOutcome};

pub struct Validator {
    executor: Arc<dyn QueryExecutor>,
    gateway: Arc<dyn CapabilityGateway>,
    settings: ValidatorSettings,
    max_generation_attempts: u32,
    max_plan_attempts: u32,
    query_timeout: Duration,
    capability_timeout: Duration,
}

impl Validator {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        gateway: Arc<dyn CapabilityGateway>,
        settings: ValidatorSettings,
    ) -> Self {
        Self {
            executor,
            gateway,
            settings,
            max_generation_attempts: 3,
            max_plan_attempts: 2,
            query_timeout: Duration::from_secs(5),
            capability_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_ceilings(mut self, max_generation_attempts: u32, max_plan_attempts: u32) -> Self {
        self.max_generation_attempts = max_generation_attempts;
        self.max_plan_attempts = max_plan_attempts;
        self
    }

    pub fn with_timeouts(mut self, query: Duration, capability: Duration) -> Self {
        self.query_timeout = query;
        self.capability_timeout = capability;
        self
    }

    /// Full validation of one candidate
    ///
    /// Only an unavailable evaluator surfaces as `Err`; an evaluator that
    /// times out or replies with garbage asks for a regeneration instead.
    pub async fn validate(
        &self,
        candidate: &CandidateQuery,
        plan: &QueryPlan,
        question: &str,
    ) -> Result<ValidationVerdict, CapabilityError> {
        let result = match self.check(candidate, plan).await {
            Ok(result) => result,
            Err(verdict) => return Ok(self.apply_ceilings(verdict, candidate, plan)),
        };

        if !self.settings.semantic_review {
            return Ok(ValidationVerdict::accept(result, None));
        }

        let verdict = self.review(candidate, question, result).await?;
        Ok(self.apply_ceilings(verdict, candidate, plan))
    }

    /// Execution and sanity checks only; no review and no ceilings
    pub async fn validate_once(&self, candidate: &CandidateQuery, plan: &QueryPlan) -> ValidationVerdict {
        match self.check(candidate, plan).await {
            Ok(result) => ValidationVerdict::accept(result, None),
            Err(verdict) => verdict,
        }
    }

    async fn check(&self, candidate: &CandidateQuery, plan: &QueryPlan) -> Result<ResultSet, ValidationVerdict> {
        let result = run_with_timeout(self.executor.as_ref(), &candidate.text, self.query_timeout)
            .await
            .map_err(|e| classify_failure(&e))?;

        if let Some(diagnostic) = self.implausibility(plan, &result).await {
            tracing::debug!(attempt = candidate.attempt_number, %diagnostic, "Implausible result");
            return Err(ValidationVerdict::retry(VerdictOutcome::Regenerate, diagnostic));
        }
        Ok(result)
    }

    async fn review(
        &self,
        candidate: &CandidateQuery,
        question: &str,
        result: ResultSet,
    ) -> Result<ValidationVerdict, CapabilityError> {
        let preview = ResultSet {
            columns: result.columns.clone(),
            rows: result
                .rows
                .iter()
                .take(self.settings.review_preview_rows)
                .cloned()
                .collect(),
        };

        let reply = invoke_with_timeout(
            self.gateway.as_ref(),
            CapabilityRequest::Evaluate {
                question: question.to_string(),
                query: candidate.text.clone(),
                preview,
                total_rows: result.len(),
            },
            self.capability_timeout,
        )
        .await
        .and_then(|r| r.into_evaluation());

        match reply {
            Ok(evaluation) => match evaluation.next_action {
                NextAction::RetryQuery => Ok(ValidationVerdict::retry(
                    VerdictOutcome::Regenerate,
                    format!("The result does not answer the question: {}", evaluation.summary),
                )),
                NextAction::Accept | NextAction::NeedClarification => {
                    Ok(ValidationVerdict::accept(result, Some(evaluation.summary)))
                }
            },
            Err(CapabilityError::Unavailable(reason)) => Err(CapabilityError::Unavailable(reason)),
            Err(e) => Ok(ValidationVerdict::retry(
                VerdictOutcome::Regenerate,
                format!("Result evaluation failed: {}", e),
            )),
        }
    }

    fn apply_ceilings(
        &self,
        mut verdict: ValidationVerdict,
        candidate: &CandidateQuery,
        plan: &QueryPlan,
    ) -> ValidationVerdict {
        let exhausted = match verdict.outcome {
            VerdictOutcome::Regenerate => candidate.attempt_number >= self.max_generation_attempts,
            VerdictOutcome::RePlan => plan.plan_attempt >= self.max_plan_attempts,
            VerdictOutcome::Accept | VerdictOutcome::Reject => false,
        };
        if exhausted {
            verdict.outcome = VerdictOutcome::Reject;
        }
        verdict
    }

    /// Diagnostic describing why `result` cannot be right, if it cannot
    async fn implausibility(&self, plan: &QueryPlan, result: &ResultSet) -> Option<String> {
        if !plan.implies_result() {
            return None;
        }
        if result.is_empty() {
            return Some("The query returned no rows, but an ungrouped aggregate always yields one".to_string());
        }

        let mut aggregates = plan.aggregates();
        let (kind, column) = aggregates.next()?;
        if aggregates.next().is_some() {
            return None;
        }

        let value = result.rows.first()?.last()?;
        if kind == AggregateKind::Count {
            return match value.as_f64() {
                Some(n) if n < 0.0 => Some(format!("A count cannot be negative, got {}", n)),
                _ => None,
            };
        }

        let column = column?;
        let table = plan.primary_table()?;
        // A failing probe only skips the check.
        let probe = run_with_timeout(self.executor.as_ref(), &range_probe(table, column), self.query_timeout)
            .await
            .ok()?;
        let stats = probe.rows.first()?;
        let low = stats.first().and_then(|v| v.as_f64());
        let high = stats.get(1).and_then(|v| v.as_f64());
        let non_null = stats.get(2).and_then(|v| v.as_u64()).unwrap_or(0);

        if value.is_null() {
            if non_null > 0 && !plan.has_filter() {
                return Some(format!(
                    "The {} of '{}' came back empty although the column has {} values",
                    kind.label(),
                    column,
                    non_null
                ));
            }
            return None;
        }

        let v = value.as_f64()?;
        let (low, high) = (low?, high?);
        let tolerance = 1e-9 * low.abs().max(high.abs()).max(1.0);

        match kind {
            AggregateKind::Avg | AggregateKind::Min | AggregateKind::Max | AggregateKind::Median => {
                if v < low - tolerance || v > high + tolerance {
                    return Some(format!(
                        "The {} of '{}' is {}, outside the column's range [{}, {}]",
                        kind.label(),
                        column,
                        v,
                        low,
                        high
                    ));
                }
            }
            AggregateKind::Sum => {
                if low >= 0.0 && v < -tolerance {
                    return Some(format!(
                        "The sum of '{}' is {}, but the column has no negative values",
                        column, v
                    ));
                }
            }
            AggregateKind::Count => {}
        }
        None
    }
}

fn classify_failure(error: &ExecutionError) -> ValidationVerdict {
    let outcome = match error.kind {
        ExecutionErrorKind::Syntax | ExecutionErrorKind::Timeout => VerdictOutcome::Regenerate,
        ExecutionErrorKind::MissingReference => VerdictOutcome::RePlan,
        ExecutionErrorKind::Forbidden | ExecutionErrorKind::Other => VerdictOutcome::Reject,
    };
    ValidationVerdict::retry(outcome, error.message.clone())
}
