//! Quarry Core - natural-language analytics over tabular data
//!
//! Quarry answers chat messages about loaded datasets by running them
//! through a fixed sequence of stages, coordinated by a central [`Hub`]:
//!
//! 1. **Guardrail** (`guardrail`): keeps conversations on data analysis, both ways
//! 2. **Classifier** (`stages::classifier`): direct stat, structured query, chart or load
//! 3. **Planner** (`stages::planner`): question → [`types::QueryPlan`] resolved against the schema
//! 4. **Generator** (`stages::generator`): plan → read-only SQL candidate
//! 5. **Validator** (`stages::validator`): executes, checks plausibility, decides retries
//! 6. **Loader / Visualizer**: CSV and JSON ingestion, chart artifacts
//!
//! Every model-backed step goes through one [`capability::CapabilityGateway`],
//! so the whole pipeline runs offline with [`capability::HeuristicCapability`]
//! and deterministically in tests with [`capability::ScriptedCapability`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use quarry_core::capability::HeuristicCapability;
//! use quarry_core::storage::SqliteStore;
//! use quarry_core::{ChatRequest, Hub, QuarryConfig};
//!
//! # async fn run() -> quarry_core::Result<()> {
//! let store = Arc::new(SqliteStore::open_in_memory()?);
//! let hub = Hub::builder(QuarryConfig::new())
//!     .capability(Arc::new(HeuristicCapability::new()))
//!     .with_sqlite(store)
//!     .build()?;
//!
//! let response = hub
//!     .handle(ChatRequest::new("demo", "load data/sales.csv as sales"))
//!     .await?;
//! println!("{}", response.message);
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - Generated SQL never mutates data: candidates are screened before execution
//! - Retries are bounded by `retry.max_generation_attempts` and `retry.max_plan_attempts`
//! - One session's requests are processed one at a time, in arrival order
//! - Sessions never see each other's history

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod guardrail;
pub mod hub;
pub mod schema;
pub mod session;
pub mod sql;
pub mod stages;
pub mod storage;
pub mod types;

// Re-export commonly used types for convenience
pub use capability::{CapabilityGateway, HeuristicCapability, OpenAiCompatibleCapability, ScriptedCapability};
pub use config::QuarryConfig;
pub use error::{QuarryError, Result};
pub use events::{EventBus, HubEvent, HubEventEnvelope};
pub use hub::{Hub, HubBuilder, HubState, Route, RoutingTable};
pub use schema::{SchemaInspector, SchemaSnapshot};
pub use session::{Exchange, ExchangeOutcome, InMemorySessionStore, SessionStats, SessionStore};
pub use storage::{SqliteSessionLog, SqliteStore};
pub use types::{Category, ChatRequest, ChatResponse, SessionId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
