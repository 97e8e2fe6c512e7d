//! Persistent Storage Layer - SQLite
//!
//! Two independent stores share the same engine:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │         SqliteStore          │   │     SqliteSessionLog     │
//! ├──────────────────────────────┤   ├──────────────────────────┤
//! │ inspector │ executor │ loader│   │ exchanges (append-only)  │
//! └──────────────────────────────┘   └──────────────────────────┘
//!      analytic tables                  conversation history
//! ```
//!
//! # Example
//!
//! ```no_run
//! use quarry_core::storage::SqliteStore;
//!
//! # fn example() -> quarry_core::Result<()> {
//! let store = SqliteStore::open("quarry.db")?;
//! # Ok(())
//! # }
//! ```

pub mod session_log;
pub mod sqlite_store;

pub use session_log::SqliteSessionLog;
pub use sqlite_store::SqliteStore;
