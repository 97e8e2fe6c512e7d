//! Quarry Gateway - the chat boundary around the analytics hub
//!
//! ```text
//! ┌───────────────┐   ┌───────────────┐
//! │  HTTP client  │   │   terminal    │
//! └───────┬───────┘   └───────┬───────┘
//!         │ POST /chat        │ stdin
//!         └─────────┬─────────┘
//!          ┌────────▼────────┐
//!          │   Hub::handle   │
//!          └─────────────────┘
//! ```
//!
//! The gateway only adapts [`quarry_core::Hub`] to the outside world:
//! refusals and aborted requests are ordinary `200` responses with
//! `success = false`; only infrastructure failures become `500`.

pub mod bootstrap;
pub mod error;
pub mod server;
pub mod terminal;

pub use bootstrap::build_hub;
pub use error::{GatewayError, Result};
pub use server::Server;
pub use terminal::Terminal;

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
