//! Cross-cutting properties: read-only candidates, bounded retries,
//! guardrail routing, deterministic generation, per-session ordering.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use quarry_core::capability::{CapabilityReply, HeuristicCapability, ScriptedCapability, StageName};
use quarry_core::executor::{find_mutating_keyword, MUTATING_KEYWORDS};
use quarry_core::schema::{ColumnInfo, ColumnType};
use quarry_core::sql::quote_ident;
use quarry_core::stages::Generator;
use quarry_core::types::{AggregateKind, Operation, QueryPlan};
use quarry_core::{ChatRequest, Hub, QuarryConfig, SessionId, SqliteStore};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

fn store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .create_table(
            "products",
            &[
                ColumnInfo::new("name", ColumnType::Text),
                ColumnInfo::new("price", ColumnType::Real),
            ],
            &[vec![json!("pen"), json!(2.0)], vec![json!("book"), json!(10.0)]],
        )
        .unwrap();
    Arc::new(store)
}

fn hub_with(capability: Arc<ScriptedCapability>, config: QuarryConfig, charts: &TempDir) -> Hub {
    Hub::builder(config.with_charts_dir(charts.path()))
        .capability(capability)
        .with_sqlite(store())
        .build()
        .unwrap()
}

fn scripted() -> ScriptedCapability {
    ScriptedCapability::new().with_fallback(Arc::new(HeuristicCapability::new()))
}

proptest! {
    #[test]
    fn prop_select_over_plain_identifiers_is_read_only(
        columns in prop::collection::vec("[a-z][a-z0-9_]{0,10}", 1..5),
        table in "[a-z][a-z0-9_]{0,10}",
    ) {
        let query = format!(
            "SELECT {} FROM {}",
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            quote_ident(&table)
        );
        prop_assert_eq!(find_mutating_keyword(&query), None);
    }

    #[test]
    fn prop_keywords_inside_quoted_identifiers_are_ignored(
        index in 0..MUTATING_KEYWORDS.len(),
        prefix in "[A-Za-z ']{0,8}",
        suffix in "[A-Za-z \"]{0,8}",
        lower in any::<bool>(),
    ) {
        let keyword = MUTATING_KEYWORDS[index];
        let spelled = if lower { keyword.to_ascii_lowercase() } else { keyword.to_string() };
        let column = format!("{}{} {}", prefix, spelled, suffix);
        let query = format!(
            "SELECT MAX({}) AS value FROM {} WHERE {} IS NOT NULL",
            quote_ident(&column),
            quote_ident(&format!("{} log", spelled)),
            quote_ident(&column)
        );
        prop_assert_eq!(find_mutating_keyword(&query), None);
    }

    #[test]
    fn prop_replace_function_is_read_only(column in "[a-z][a-z0-9_]{0,10}", lower in any::<bool>()) {
        let function = if lower { "replace" } else { "REPLACE" };
        let query = format!("SELECT {}({}, 'a', 'b') AS value FROM t", function, quote_ident(&column));
        prop_assert_eq!(find_mutating_keyword(&query), None);
    }

    #[test]
    fn prop_mutating_keyword_is_always_found(
        index in 0..MUTATING_KEYWORDS.len(),
        table in "[a-z][a-z0-9_]{0,10}",
        lower in any::<bool>(),
    ) {
        let keyword = MUTATING_KEYWORDS[index];
        let spelled = if lower { keyword.to_ascii_lowercase() } else { keyword.to_string() };
        let query = format!("SELECT 1; {} {}", spelled, table);
        prop_assert_eq!(find_mutating_keyword(&query), Some(keyword.to_string()));
    }

    #[test]
    fn prop_keywords_inside_literals_are_ignored(index in 0..MUTATING_KEYWORDS.len()) {
        let query = format!("SELECT * FROM notes WHERE body = '{} everything'", MUTATING_KEYWORDS[index]);
        prop_assert_eq!(find_mutating_keyword(&query), None);
    }

    #[test]
    fn prop_quote_ident_round_trips(name in "\\PC{0,20}") {
        let quoted = quote_ident(&name);
        prop_assert!(quoted.starts_with('"') && quoted.ends_with('"'));
        let inner = &quoted[1..quoted.len() - 1];
        prop_assert_eq!(inner.replace("\"\"", "\""), name);
    }
}

#[tokio::test]
async fn generation_attempts_never_exceed_ceiling() {
    for max_generation in 1..=4u32 {
        let charts = TempDir::new().unwrap();
        let capability = scripted();
        capability.push_repeated(
            StageName::Generator,
            Ok(CapabilityReply::Query("SELEC price FROM products".into())),
            20,
        );
        let capability = Arc::new(capability);
        let config = QuarryConfig::new().with_max_generation_attempts(max_generation);
        let hub = hub_with(capability.clone(), config, &charts);

        let response = hub
            .handle(ChatRequest::new("s", "show the maximum price by name"))
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(capability.call_count(StageName::Generator), max_generation as usize);
        assert_eq!(capability.call_count(StageName::Planner), 1);
    }
}

#[tokio::test]
async fn plan_attempts_never_exceed_ceiling() {
    for max_plan in 1..=3u32 {
        let charts = TempDir::new().unwrap();
        let capability = scripted();
        capability.push_repeated(
            StageName::Generator,
            Ok(CapabilityReply::Query("SELECT missing_column FROM products".into())),
            20,
        );
        let capability = Arc::new(capability);
        let config = QuarryConfig::new().with_max_plan_attempts(max_plan);
        let hub = hub_with(capability.clone(), config, &charts);

        let response = hub
            .handle(ChatRequest::new("s", "show the maximum price by name"))
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(capability.call_count(StageName::Planner), max_plan as usize);
        assert_eq!(capability.call_count(StageName::Generator), max_plan as usize);
    }
}

#[tokio::test]
async fn executed_candidates_are_read_only() {
    let charts = TempDir::new().unwrap();
    let capability = scripted();
    capability.push(
        StageName::Generator,
        Ok(CapabilityReply::Query("UPDATE products SET price = 0".into())),
    );
    let capability = Arc::new(capability);
    let hub = hub_with(capability.clone(), QuarryConfig::new(), &charts);

    let response = hub
        .handle(ChatRequest::new("s", "show the maximum price by name"))
        .await
        .unwrap();
    assert!(!response.success);

    let after = hub
        .handle(ChatRequest::new("s", "what is the minimum price in products?"))
        .await
        .unwrap();
    assert_eq!(after.message, "The minimum of 'price' in 'products' is 2.0.");
}

#[tokio::test]
async fn refused_requests_never_reach_later_stages() {
    let charts = TempDir::new().unwrap();
    let capability = Arc::new(scripted());
    let hub = hub_with(capability.clone(), QuarryConfig::new(), &charts);

    for message in ["tell me a joke", "who won the football game", "write me a poem about spring"] {
        let response = hub.handle(ChatRequest::new("s", message)).await.unwrap();
        assert!(!response.success, "{} was answered", message);
    }
    assert_eq!(capability.call_count(StageName::Guardrail), 3);
    for stage in [StageName::Planner, StageName::Generator, StageName::Evaluator, StageName::Loader] {
        assert_eq!(capability.call_count(stage), 0);
    }
}

#[tokio::test]
async fn generation_is_deterministic_for_identical_input() {
    let generator = Generator::new(Arc::new(HeuristicCapability::new()), Duration::from_secs(1));
    let plan = QueryPlan {
        id: Uuid::new_v4(),
        objective: "maximum price".into(),
        target_tables: BTreeSet::from(["products".to_string()]),
        target_columns: BTreeSet::from(["price".to_string()]),
        requested_operations: vec![Operation::Aggregate {
            kind: AggregateKind::Max,
            column: Some("price".into()),
        }],
        plan_attempt: 1,
    };

    let first = generator.generate(&plan, 2, None).await.unwrap();
    let second = generator.generate(&plan, 2, None).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.attempt_number, 2);
    assert_eq!(first.origin_plan, plan.id);
}

#[tokio::test]
async fn concurrent_sessions_keep_their_own_ordered_history() {
    let charts = TempDir::new().unwrap();
    let capability = Arc::new(scripted().with_delay(StageName::Guardrail, Duration::from_millis(2)));
    let hub = Arc::new(hub_with(capability, QuarryConfig::new(), &charts));

    let questions = [
        "average price in products table",
        "maximum price in products table",
        "minimum price in products table",
        "total price in products table",
    ];

    let mut tasks = Vec::new();
    for session in ["alpha", "beta", "gamma"] {
        for question in questions {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                hub.handle(ChatRequest::new(session, question)).await.unwrap()
            }));
        }
    }
    for response in futures::future::join_all(tasks).await {
        assert!(response.unwrap().success);
    }

    for session in ["alpha", "beta", "gamma"] {
        let history = hub.history(&SessionId::from(session)).unwrap();
        assert_eq!(history.len(), questions.len());
        assert!(history.iter().all(|e| e.request.session_id.as_str() == session));
        let sequences: Vec<u64> = history.iter().map(|e| e.request.arrival_sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);
    }
}
