//! Hub - the deterministic state machine behind every chat request
//!
//! ```text
//! Received ─► GuardedIn ─► Classified ─┬─► DirectAnswer ──────────────────────┐
//!    │                                 ├─► Planning ─► Generating ─► Validating ┤
//!    │ (inbound refusal)               │      ▲            ▲    re_plan │ regen  │
//!    │                                 │      └────────────┴────────────┘        │
//!    │                                 ├─► Loading ──────────────────────────────┤
//!    │                                 └─► Visualizing (query chain + render) ───┤
//!    └─────────────────────────────────────────────────────────────────► GuardedOut ─► Responded
//! ```
//!
//! Two counters bound the retry loop: generation attempts per plan and
//! plan attempts per request. The validator turns a retry verdict into
//! `Reject` once the matching ceiling is reached, so exhausting either
//! one (or both at once) ends in `Aborted` with the last diagnostic.
//!
//! Requests of one session are admitted one at a time in arrival order
//! through [`SessionGates`]. The exchange is appended to the session
//! store synchronously after the last suspension point; a request
//! cancelled earlier leaves no trace in the history.

pub mod gate;
pub mod render;
pub mod routing;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::capability::CapabilityGateway;
use crate::config::QuarryConfig;
use crate::error::{CapabilityError, ConfigError, GenerationError, QuarryError, Result, StageError};
use crate::events::{EventBus, HubEvent, HubEventEnvelope};
use crate::executor::QueryExecutor;
use crate::guardrail::{Direction, GuardrailFilter};
use crate::schema::{SchemaInspector, SchemaSnapshot};
use crate::session::{Exchange, ExchangeOutcome, InMemorySessionStore, SessionStats, SessionStore};
use crate::sql::stat_query;
use crate::stages::visualizer::{requested_chart, ChartRenderer, ChartRequest, JsonChartRenderer, Visualizer};
use crate::stages::{Classifier, DataLoader, Generator, Loader, Planner, Validator};
use crate::storage::SqliteStore;
use crate::types::{
    CandidateQuery, Category, ChatRequest, ChatResponse, Comparator, Operation, QueryPlan, Request, ResultSet,
    SessionId, StatRequest, VerdictOutcome,
};

pub use gate::{SessionGates, Ticket};
pub use routing::{Route, RoutingTable, DEFAULT_ROUTES};

/// Hub states, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Received,
    GuardedIn,
    Classified,
    DirectAnswer,
    Planning,
    Generating,
    Validating,
    Loading,
    Visualizing,
    GuardedOut,
    Responded,
    Aborted,
}

/// Response of a branch together with how it ended
struct Outcome {
    response: ChatResponse,
    kind: ExchangeOutcome,
}

impl Outcome {
    fn answered(response: ChatResponse) -> Self {
        Self {
            response,
            kind: ExchangeOutcome::Answered,
        }
    }

    fn refused(category: Category, message: impl Into<String>) -> Self {
        Self {
            response: ChatResponse::refusal(category, message),
            kind: ExchangeOutcome::Refused,
        }
    }
}

/// Result of the plan → generate → validate chain
enum Chain {
    Accepted {
        plan: QueryPlan,
        result: ResultSet,
        summary: Option<String>,
    },
    Ended(Outcome),
}

pub struct HubBuilder {
    config: QuarryConfig,
    capability: Option<Arc<dyn CapabilityGateway>>,
    inspector: Option<Arc<dyn SchemaInspector>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    loader: Option<Arc<dyn DataLoader>>,
    renderer: Option<Arc<dyn ChartRenderer>>,
    sessions: Option<Arc<dyn SessionStore>>,
    routes: Vec<(Category, Route)>,
}

impl HubBuilder {
    pub fn new(config: QuarryConfig) -> Self {
        Self {
            config,
            capability: None,
            inspector: None,
            executor: None,
            loader: None,
            renderer: None,
            sessions: None,
            routes: DEFAULT_ROUTES.to_vec(),
        }
    }

    pub fn capability(mut self, capability: Arc<dyn CapabilityGateway>) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn SchemaInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn DataLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Use one SQLite store as inspector, executor and loader
    pub fn with_sqlite(self, store: Arc<SqliteStore>) -> Self {
        self.inspector(store.clone()).executor(store.clone()).loader(store)
    }

    pub fn renderer(mut self, renderer: Arc<dyn ChartRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn routes(mut self, routes: Vec<(Category, Route)>) -> Self {
        self.routes = routes;
        self
    }

    pub fn build(self) -> Result<Hub> {
        self.config.validate()?;
        let routes = RoutingTable::from_entries(&self.routes)?;

        let missing = |what: &str| QuarryError::from(ConfigError::Invalid(format!("hub has no {}", what)));
        let capability = self.capability.ok_or_else(|| missing("capability gateway"))?;
        let inspector = self.inspector.ok_or_else(|| missing("schema inspector"))?;
        let executor = self.executor.ok_or_else(|| missing("query executor"))?;
        let loader = self.loader.ok_or_else(|| missing("data loader"))?;

        let config = self.config;
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(JsonChartRenderer::new(config.charts.output_dir.clone())));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));

        let capability_timeout = config.timeouts.capability();
        let validator = Validator::new(executor.clone(), capability.clone(), config.validator.clone())
            .with_ceilings(
                config.retry.max_generation_attempts,
                config.retry.max_plan_attempts,
            )
            .with_timeouts(config.timeouts.query(), capability_timeout);

        tracing::info!(
            backend = capability.name(),
            max_generation_attempts = config.retry.max_generation_attempts,
            max_plan_attempts = config.retry.max_plan_attempts,
            "Hub ready"
        );

        Ok(Hub {
            guardrail: GuardrailFilter::new(capability.clone(), config.guardrail.clone(), capability_timeout),
            classifier: Classifier::new(),
            planner: Planner::new(capability.clone(), capability_timeout),
            generator: Generator::new(capability.clone(), capability_timeout),
            validator,
            loader: Loader::new(capability, loader, capability_timeout),
            visualizer: Visualizer::new(renderer),
            inspector,
            sessions,
            routes,
            gates: SessionGates::new(),
            arrivals: AtomicU64::new(0),
            events: EventBus::default(),
            config,
        })
    }
}

pub struct Hub {
    config: QuarryConfig,
    guardrail: GuardrailFilter,
    classifier: Classifier,
    planner: Planner,
    generator: Generator,
    validator: Validator,
    loader: Loader,
    visualizer: Visualizer,
    inspector: Arc<dyn SchemaInspector>,
    sessions: Arc<dyn SessionStore>,
    routes: RoutingTable,
    gates: SessionGates,
    arrivals: AtomicU64,
    events: EventBus,
}

impl Hub {
    pub fn builder(config: QuarryConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    pub fn config(&self) -> &QuarryConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEventEnvelope> {
        self.events.subscribe()
    }

    /// Answer one chat message
    ///
    /// Business outcomes (refusals, aborts) are `Ok`; `Err` means the
    /// schema or the session store could not be reached.
    pub async fn handle(&self, chat: ChatRequest) -> Result<ChatResponse> {
        if chat.message.trim().is_empty() {
            return Ok(ChatResponse::refusal(Category::Rejected, render::EMPTY_MESSAGE));
        }

        let ticket = self
            .gates
            .ticket(&chat.session_id, || self.arrivals.fetch_add(1, Ordering::SeqCst) + 1);
        ticket.wait().await;

        let request = Request::new(chat.session_id, chat.message, ticket.arrival_sequence());
        self.enter(&request, HubState::Received);
        self.publish(
            &request,
            HubEvent::RequestReceived {
                length: request.raw_text.len(),
            },
        );

        let mut outcome = self.process(&request).await?;

        let decision = self.guardrail.check(&outcome.response.message, Direction::Outbound).await;
        if !decision.allowed {
            self.publish(
                &request,
                HubEvent::GuardrailBlocked {
                    direction: Direction::Outbound,
                    reason: decision.reason,
                },
            );
            outcome.response.message = self.guardrail.redirect_message().to_string();
            outcome.response.success = false;
            outcome.response.artifact = None;
            outcome.kind = ExchangeOutcome::Refused;
        }
        self.enter(&request, HubState::GuardedOut);

        // Nothing below suspends: the exchange is recorded whole or not at all.
        let response = outcome.response.clone();
        self.sessions
            .append(Exchange::new(request.clone(), outcome.response, outcome.kind))?;

        self.enter(&request, HubState::Responded);
        self.publish(
            &request,
            HubEvent::Responded {
                success: response.success,
                category: response.category,
            },
        );
        drop(ticket);
        Ok(response)
    }

    async fn process(&self, request: &Request) -> Result<Outcome> {
        let decision = self.guardrail.check(&request.raw_text, Direction::Inbound).await;
        if !decision.allowed {
            self.publish(
                request,
                HubEvent::GuardrailBlocked {
                    direction: Direction::Inbound,
                    reason: decision.reason,
                },
            );
            return Ok(Outcome::refused(Category::Rejected, self.guardrail.refusal_message()));
        }
        self.enter(request, HubState::GuardedIn);

        let schema = self.snapshot().await?;
        let classification = self.classifier.classify(request, &schema);
        self.enter(request, HubState::Classified);
        tracing::info!(
            session_id = %request.session_id,
            category = %classification.category,
            rationale = %classification.rationale,
            "Request classified"
        );
        self.publish(
            request,
            HubEvent::Classified {
                category: classification.category,
            },
        );

        match (self.routes.route(classification.category), classification.stat) {
            (Route::DirectAnswer, Some(stat)) => Ok(self.direct_answer(request, stat).await),
            (Route::DirectAnswer, None) | (Route::QueryChain, _) => {
                match self.query_chain(request, Category::StructuredQuery).await? {
                    Chain::Accepted { result, summary, .. } => Ok(Outcome::answered(ChatResponse::answer(
                        Category::StructuredQuery,
                        render::result_table(&result, summary.as_deref()),
                    ))),
                    Chain::Ended(outcome) => Ok(outcome),
                }
            }
            (Route::Load, _) => Ok(self.load(request).await),
            (Route::Visualize, _) => self.visualize(request).await,
            (Route::Refuse, _) => Ok(Outcome::refused(Category::Rejected, self.guardrail.refusal_message())),
        }
    }

    async fn direct_answer(&self, request: &Request, stat: StatRequest) -> Outcome {
        self.enter(request, HubState::DirectAnswer);

        let mut operations = Vec::new();
        if let Some(value) = &stat.matching {
            operations.push(Operation::Filter {
                column: stat.column.clone(),
                comparator: Comparator::Eq,
                value: value.clone(),
            });
        }
        operations.push(Operation::Aggregate {
            kind: stat.kind,
            column: Some(stat.column.clone()),
        });

        let plan = QueryPlan {
            id: Uuid::new_v4(),
            objective: request.raw_text.clone(),
            target_tables: BTreeSet::from([stat.table.clone()]),
            target_columns: BTreeSet::from([stat.column.clone()]),
            requested_operations: operations,
            plan_attempt: 1,
        };
        let candidate = CandidateQuery {
            text: stat_query(&stat),
            origin_plan: plan.id,
            attempt_number: 1,
        };

        let verdict = self.validator.validate_once(&candidate, &plan).await;
        match (verdict.outcome, verdict.corrected_result) {
            (VerdictOutcome::Accept, Some(result)) => Outcome::answered(ChatResponse::answer(
                Category::DirectStat,
                render::direct_stat(&stat, &result),
            )),
            _ => self.abort(request, Category::DirectStat, &verdict.diagnostic),
        }
    }

    /// Plan, generate and validate until accepted or a ceiling is hit
    async fn query_chain(&self, request: &Request, category: Category) -> Result<Chain> {
        let max_plan_attempts = self.config.retry.max_plan_attempts;
        let max_generation_attempts = self.config.retry.max_generation_attempts;
        let history = self
            .sessions
            .recent_turns(&request.session_id, self.config.session.history_window)?;

        let mut feedback: Option<String> = None;
        let mut last_diagnostic = String::new();

        'planning: for plan_attempt in 1..=max_plan_attempts {
            self.enter(request, HubState::Planning);
            let schema = self.snapshot().await?;

            let planned = self
                .planner
                .plan(&request.raw_text, &schema, history.clone(), feedback.take(), plan_attempt)
                .await;
            let plan = match planned {
                Ok(plan) => plan,
                Err(StageError::Capability(CapabilityError::Unavailable(reason))) => {
                    return Ok(Chain::Ended(self.degraded(request, category, &reason)));
                }
                Err(StageError::Planning(e)) => {
                    last_diagnostic = e.diagnostic();
                    self.plan_rejected(request, plan_attempt, &last_diagnostic);
                    feedback = Some(last_diagnostic.clone());
                    continue 'planning;
                }
                Err(e) => {
                    last_diagnostic = e.to_string();
                    self.plan_rejected(request, plan_attempt, &last_diagnostic);
                    feedback = Some(last_diagnostic.clone());
                    continue 'planning;
                }
            };
            tracing::debug!(
                session_id = %request.session_id,
                plan_attempt,
                tables = ?plan.target_tables,
                operations = plan.requested_operations.len(),
                "Plan resolved"
            );

            let mut hint: Option<String> = None;
            for attempt in 1..=max_generation_attempts {
                self.enter(request, HubState::Generating);
                let candidate = match self.generator.generate(&plan, attempt, hint.take()).await {
                    Ok(candidate) => candidate,
                    Err(StageError::Generation(GenerationError::UnsafeOperation { keyword, attempt })) => {
                        self.publish(
                            request,
                            HubEvent::UnsafeCandidate {
                                attempt,
                                keyword: keyword.clone(),
                            },
                        );
                        self.enter(request, HubState::Aborted);
                        return Ok(Chain::Ended(Outcome::refused(category, render::unsafe_refusal(&keyword))));
                    }
                    Err(StageError::Capability(CapabilityError::Unavailable(reason))) => {
                        return Ok(Chain::Ended(self.degraded(request, category, &reason)));
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %request.session_id, attempt, error = %e, "Generation failed");
                        last_diagnostic = e.to_string();
                        hint = Some(last_diagnostic.clone());
                        continue;
                    }
                };
                self.publish(request, HubEvent::CandidateGenerated { plan_attempt, attempt });

                self.enter(request, HubState::Validating);
                let verdict = match self.validator.validate(&candidate, &plan, &request.raw_text).await {
                    Ok(verdict) => verdict,
                    Err(e) => return Ok(Chain::Ended(self.degraded(request, category, &e.to_string()))),
                };
                tracing::debug!(
                    session_id = %request.session_id,
                    plan_attempt,
                    attempt,
                    outcome = ?verdict.outcome,
                    diagnostic = %verdict.diagnostic,
                    "Verdict"
                );
                self.publish(
                    request,
                    HubEvent::Verdict {
                        plan_attempt,
                        attempt,
                        outcome: verdict.outcome,
                    },
                );

                match verdict.outcome {
                    VerdictOutcome::Accept => {
                        return Ok(Chain::Accepted {
                            plan,
                            result: verdict.corrected_result.unwrap_or_default(),
                            summary: verdict.summary,
                        });
                    }
                    VerdictOutcome::Regenerate => {
                        hint = Some(verdict.diagnostic);
                    }
                    VerdictOutcome::RePlan => {
                        feedback = Some(verdict.diagnostic);
                        continue 'planning;
                    }
                    VerdictOutcome::Reject => {
                        return Ok(Chain::Ended(self.abort(request, category, &verdict.diagnostic)));
                    }
                }
            }

            // Generation attempts ran out without a verdict to end on.
            return Ok(Chain::Ended(self.abort(request, category, &last_diagnostic)));
        }

        Ok(Chain::Ended(self.abort(request, category, &last_diagnostic)))
    }

    async fn load(&self, request: &Request) -> Outcome {
        self.enter(request, HubState::Loading);

        match self.loader.load(request).await {
            Ok(report) if !report.loaded.is_empty() => {
                self.publish(
                    request,
                    HubEvent::Loaded {
                        tables: report.table_names(),
                    },
                );
                Outcome::answered(ChatResponse::answer(Category::LoadData, render::load_report(&report)))
            }
            Ok(report) => self.abort(request, Category::LoadData, &render::load_report(&report)),
            Err(StageError::Capability(CapabilityError::Unavailable(reason))) => {
                self.degraded(request, Category::LoadData, &reason)
            }
            Err(StageError::Capability(e)) => self.abort(
                request,
                Category::LoadData,
                &format!("I could not tell which file or directory to load ({}).", e),
            ),
            Err(e) => self.abort(request, Category::LoadData, &e.to_string()),
        }
    }

    async fn visualize(&self, request: &Request) -> Result<Outcome> {
        self.enter(request, HubState::Visualizing);

        let requested = match requested_chart(&request.raw_text) {
            ChartRequest::Unsupported(kind) => {
                return Ok(Outcome::answered(ChatResponse::answer(
                    Category::Visualization,
                    render::unsupported_chart(&kind),
                )));
            }
            ChartRequest::Kind(kind) => Some(kind),
            ChartRequest::Unspecified => None,
        };

        let (plan, result, summary) = match self.query_chain(request, Category::Visualization).await? {
            Chain::Accepted { plan, result, summary } => (plan, result, summary),
            Chain::Ended(outcome) => return Ok(outcome),
        };

        match self
            .visualizer
            .visualize(&request.session_id, &plan.objective, &result, requested)
        {
            Ok(artifact) => {
                self.publish(
                    request,
                    HubEvent::Visualized {
                        artifact: artifact.location.clone(),
                    },
                );
                let mut response =
                    ChatResponse::answer(Category::Visualization, render::chart(&artifact, summary.as_deref()));
                response.artifact = Some(artifact.location);
                Ok(Outcome::answered(response))
            }
            Err(e) => Ok(self.abort(request, Category::Visualization, &e.to_string())),
        }
    }

    fn abort(&self, request: &Request, category: Category, diagnostic: &str) -> Outcome {
        self.enter(request, HubState::Aborted);
        tracing::info!(session_id = %request.session_id, %diagnostic, "Request aborted");
        self.publish(
            request,
            HubEvent::Aborted {
                reason: diagnostic.to_string(),
            },
        );
        Outcome {
            response: ChatResponse::refusal(category, render::aborted(diagnostic)),
            kind: ExchangeOutcome::Aborted,
        }
    }

    fn degraded(&self, request: &Request, category: Category, reason: &str) -> Outcome {
        self.enter(request, HubState::Aborted);
        tracing::warn!(session_id = %request.session_id, %reason, "Capability unavailable");
        self.publish(
            request,
            HubEvent::Aborted {
                reason: reason.to_string(),
            },
        );
        Outcome {
            response: ChatResponse::refusal(category, render::degraded(reason)),
            kind: ExchangeOutcome::Aborted,
        }
    }

    fn plan_rejected(&self, request: &Request, plan_attempt: u32, diagnostic: &str) {
        tracing::debug!(session_id = %request.session_id, plan_attempt, %diagnostic, "Plan rejected");
        self.publish(
            request,
            HubEvent::PlanRejected {
                plan_attempt,
                diagnostic: diagnostic.to_string(),
            },
        );
    }

    async fn snapshot(&self) -> Result<SchemaSnapshot> {
        Ok(SchemaSnapshot::capture(self.inspector.as_ref(), self.config.timeouts.schema()).await?)
    }

    fn enter(&self, request: &Request, state: HubState) {
        tracing::debug!(
            session_id = %request.session_id,
            seq = request.arrival_sequence,
            state = ?state,
            "Hub transition"
        );
    }

    fn publish(&self, request: &Request, event: HubEvent) {
        self.events
            .publish(&request.session_id, request.arrival_sequence, event);
    }

    /// Drop a session's history, chart artifacts and admission gate
    ///
    /// Closing queues behind the session's admitted requests like any other
    /// arrival, so an in-flight exchange lands before the history is dropped.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<bool> {
        let ticket = self
            .gates
            .ticket(session_id, || self.arrivals.fetch_add(1, Ordering::SeqCst) + 1);
        ticket.wait().await;

        let existed = self.sessions.close(session_id)?;
        if let Err(e) = self.visualizer.cleanup(session_id) {
            tracing::warn!(%session_id, error = %e, "Chart cleanup failed");
        }
        drop(ticket);

        self.gates.remove_idle(session_id);
        Ok(existed)
    }

    pub fn session_stats(&self, session_id: &SessionId) -> Result<Option<SessionStats>> {
        self.sessions.stats(session_id)
    }

    pub fn history(&self, session_id: &SessionId) -> Result<Vec<Exchange>> {
        self.sessions.read_history(session_id)
    }

    /// One line per loaded table with its row count and columns
    pub async fn describe_datasets(&self) -> Result<String> {
        let schema = self.snapshot().await?;
        if schema.is_empty() {
            return Ok("No tables are loaded yet. Ask me to load a CSV or JSON file to get started.".to_string());
        }

        let lines: Vec<String> = schema
            .tables
            .iter()
            .map(|t| {
                let columns: Vec<String> = t
                    .columns
                    .iter()
                    .map(|c| match c.inferred_type.sql() {
                        "" => c.name.clone(),
                        ty => format!("{} {}", c.name, ty),
                    })
                    .collect();
                format!("- {} ({} rows): {}", t.name, t.row_count, columns.join(", "))
            })
            .collect();
        Ok(format!("Available tables:\n{}", lines.join("\n")))
    }
}
