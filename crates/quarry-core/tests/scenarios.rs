//! End-to-end scenarios through the Hub
//!
//! Every test runs against an in-memory SQLite store and the heuristic
//! capability, wrapped in a scripted capability so calls can be counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quarry_core::capability::{HeuristicCapability, ScriptedCapability, StageName};
use quarry_core::error::ExecutionError;
use quarry_core::executor::QueryExecutor;
use quarry_core::schema::{ColumnInfo, ColumnType};
use quarry_core::types::ResultSet;
use quarry_core::{
    Category, ChatRequest, ExchangeOutcome, Hub, HubEvent, QuarryConfig, SessionId, SqliteStore,
};
use serde_json::json;
use tempfile::TempDir;

fn seeded_store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .create_table(
            "products",
            &[
                ColumnInfo::new("id", ColumnType::Integer),
                ColumnInfo::new("name", ColumnType::Text),
                ColumnInfo::new("price", ColumnType::Real),
            ],
            &[
                vec![json!(1), json!("pen"), json!(2.0)],
                vec![json!(2), json!("book"), json!(10.0)],
                vec![json!(3), json!("mug"), json!(8.5)],
            ],
        )
        .unwrap();
    store
        .create_table(
            "sales",
            &[
                ColumnInfo::new("region", ColumnType::Text),
                ColumnInfo::new("amount", ColumnType::Integer),
            ],
            &[vec![json!("north"), json!(40)], vec![json!("south"), json!(25)]],
        )
        .unwrap();
    Arc::new(store)
}

fn scripted() -> Arc<ScriptedCapability> {
    Arc::new(ScriptedCapability::new().with_fallback(Arc::new(HeuristicCapability::new())))
}

fn build_hub(capability: Arc<ScriptedCapability>, store: Arc<SqliteStore>, charts: &TempDir) -> Hub {
    Hub::builder(QuarryConfig::new().with_charts_dir(charts.path()))
        .capability(capability)
        .with_sqlite(store)
        .build()
        .unwrap()
}

/// Executor that counts calls before delegating
struct CountingExecutor {
    inner: Arc<SqliteStore>,
    calls: AtomicUsize,
}

#[async_trait]
impl QueryExecutor for CountingExecutor {
    async fn run(&self, query: &str) -> Result<ResultSet, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run(query).await
    }

    async fn run_within(&self, query: &str, timeout: Duration) -> Result<ResultSet, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run_within(query, timeout).await
    }
}

#[tokio::test]
async fn scenario_unknown_column_aborts_after_replanning() {
    let charts = TempDir::new().unwrap();
    let capability = scripted();
    let hub = build_hub(capability.clone(), seeded_store(), &charts);

    let response = hub
        .handle(ChatRequest::new("a", "average salary in products table"))
        .await
        .unwrap();

    assert!(!response.success);
    assert!(response.message.starts_with("I could not complete this request."));
    assert!(response.message.contains("salary"));
    assert!(response.message.contains("Available: id, name, price"), "{}", response.message);
    assert_eq!(capability.call_count(StageName::Planner), 2);
    assert_eq!(capability.call_count(StageName::Generator), 0);

    let history = hub.history(&SessionId::from("a")).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, ExchangeOutcome::Aborted);
}

#[tokio::test]
async fn scenario_direct_stat_is_single_shot() {
    let charts = TempDir::new().unwrap();
    let capability = scripted();
    let hub = build_hub(capability.clone(), seeded_store(), &charts);

    let response = hub
        .handle(ChatRequest::new("b", "average price in products table"))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.category, Category::DirectStat);
    assert_eq!(response.message, "The average of 'price' in 'products' is 6.8333.");
    assert_eq!(capability.call_count(StageName::Planner), 0);
    assert_eq!(capability.call_count(StageName::Generator), 0);
    assert_eq!(capability.call_count(StageName::Evaluator), 0);

    let history = hub.history(&SessionId::from("b")).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, ExchangeOutcome::Answered);
}

#[tokio::test]
async fn scenario_mutation_is_refused_before_execution() {
    let charts = TempDir::new().unwrap();
    let capability = scripted();
    let store = seeded_store();
    let executor = Arc::new(CountingExecutor {
        inner: store.clone(),
        calls: AtomicUsize::new(0),
    });
    let hub = Hub::builder(QuarryConfig::new().with_charts_dir(charts.path()))
        .capability(capability.clone())
        .inspector(store.clone())
        .executor(executor.clone())
        .loader(store)
        .build()
        .unwrap();
    let mut events = hub.subscribe();

    let response = hub
        .handle(ChatRequest::new("c", "delete all rows from sales"))
        .await
        .unwrap();

    assert!(!response.success);
    assert!(response.message.contains("read-only"));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(capability.call_count(StageName::Generator), 1);
    assert_eq!(capability.call_count(StageName::Evaluator), 0);

    let mut saw_unsafe = false;
    while let Ok(envelope) = events.try_recv() {
        match envelope.event {
            HubEvent::UnsafeCandidate { keyword, .. } => {
                assert_eq!(keyword, "DELETE");
                saw_unsafe = true;
            }
            HubEvent::Verdict { .. } => panic!("validator must not run"),
            _ => {}
        }
    }
    assert!(saw_unsafe);

    let history = hub.history(&SessionId::from("c")).unwrap();
    assert_eq!(history[0].outcome, ExchangeOutcome::Refused);
}

#[tokio::test]
async fn scenario_off_topic_is_redirected() {
    let charts = TempDir::new().unwrap();
    let capability = scripted();
    let hub = build_hub(capability.clone(), seeded_store(), &charts);

    let response = hub.handle(ChatRequest::new("d", "tell me a joke")).await.unwrap();

    assert!(!response.success);
    assert_eq!(response.category, Category::Rejected);
    assert_eq!(response.message, QuarryConfig::default().guardrail.refusal_message);
    for stage in [StageName::Planner, StageName::Generator, StageName::Evaluator, StageName::Loader] {
        assert_eq!(capability.call_count(stage), 0, "{} was invoked", stage);
    }
}

#[tokio::test]
async fn scenario_same_session_requests_run_in_arrival_order() {
    let charts = TempDir::new().unwrap();
    let capability = Arc::new(
        ScriptedCapability::new()
            .with_fallback(Arc::new(HeuristicCapability::new()))
            .with_delay(StageName::Guardrail, Duration::from_millis(30)),
    );
    let hub = Arc::new(build_hub(capability, seeded_store(), &charts));
    let mut events = hub.subscribe();

    let first = {
        let hub = hub.clone();
        tokio::spawn(async move {
            hub.handle(ChatRequest::new("e", "average price in products table"))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
        let hub = hub.clone();
        tokio::spawn(async move {
            hub.handle(ChatRequest::new("e", "total amount in sales table"))
                .await
                .unwrap()
        })
    };

    let (first, second) = (first.await.unwrap(), second.await.unwrap());
    assert!(first.success && second.success);

    let history = hub.history(&SessionId::from("e")).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].request.raw_text, "average price in products table");
    assert_eq!(history[1].request.raw_text, "total amount in sales table");
    assert!(history[0].request.arrival_sequence < history[1].request.arrival_sequence);

    // The second request is only received once the first has responded.
    let mut order = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        match envelope.event {
            HubEvent::RequestReceived { .. } => order.push(("received", envelope.arrival_sequence)),
            HubEvent::Responded { .. } => order.push(("responded", envelope.arrival_sequence)),
            _ => {}
        }
    }
    let (a, b) = (history[0].request.arrival_sequence, history[1].request.arrival_sequence);
    assert_eq!(
        order,
        vec![("received", a), ("responded", a), ("received", b), ("responded", b)]
    );
}

#[tokio::test]
async fn scenario_follow_up_uses_session_history() {
    let charts = TempDir::new().unwrap();
    let hub = build_hub(scripted(), seeded_store(), &charts);

    let first = hub
        .handle(ChatRequest::new("f", "show the total amount by region in sales"))
        .await
        .unwrap();
    assert!(first.success, "{}", first.message);

    let follow_up = hub
        .handle(ChatRequest::new("f", "now show the maximum amount"))
        .await
        .unwrap();
    assert!(follow_up.success, "{}", follow_up.message);
    assert!(follow_up.message.contains("Result: 40"), "{}", follow_up.message);
}

#[tokio::test]
async fn scenario_closed_session_starts_fresh() {
    let charts = TempDir::new().unwrap();
    let hub = build_hub(scripted(), seeded_store(), &charts);
    let session = SessionId::from("g");

    hub.handle(ChatRequest::new("g", "average price in products table"))
        .await
        .unwrap();
    assert_eq!(hub.session_stats(&session).unwrap().unwrap().message_count, 1);

    assert!(hub.close_session(&session).await.unwrap());
    assert!(hub.history(&session).unwrap().is_empty());
    assert!(hub.session_stats(&session).unwrap().is_none());
    assert!(!hub.close_session(&session).await.unwrap());
}

#[tokio::test]
async fn scenario_cancelled_request_records_nothing() {
    let charts = TempDir::new().unwrap();
    let capability = Arc::new(
        ScriptedCapability::new()
            .with_fallback(Arc::new(HeuristicCapability::new()))
            .with_delay(StageName::Generator, Duration::from_millis(300)),
    );
    let hub = build_hub(capability.clone(), seeded_store(), &charts);
    let session = SessionId::from("h");

    // dropped while the generator is still working
    let abandoned = tokio::time::timeout(
        Duration::from_millis(60),
        hub.handle(ChatRequest::new("h", "show the total amount by region in sales")),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(capability.call_count(StageName::Generator), 1);
    assert!(hub.history(&session).unwrap().is_empty());

    let next = tokio::time::timeout(
        Duration::from_secs(5),
        hub.handle(ChatRequest::new("h", "average price in products table")),
    )
    .await
    .expect("the session gate was released")
    .unwrap();
    assert!(next.success, "{}", next.message);

    let history = hub.history(&session).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request.raw_text, "average price in products table");
    assert_eq!(history[0].outcome, ExchangeOutcome::Answered);
}
