//! Quarry binary
//!
//! # Usage
//! ```bash
//! quarry [--config quarry.toml] [--offline] [--verbose] serve [--host 127.0.0.1] [--port 8080]
//! quarry [--config quarry.toml] [--offline] chat [--session NAME]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quarry_core::{QuarryConfig, SessionId};
use quarry_gateway::{build_hub, Server, Terminal};
use tracing_subscriber::EnvFilter;

/// Quarry - ask questions about tabular data in plain language
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the offline heuristic backend regardless of configuration
    #[arg(long, global = true)]
    offline: bool,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP chat endpoint
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Chat in the terminal
    Chat {
        /// Session name (a fresh one by default)
        #[arg(short, long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => QuarryConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => QuarryConfig::default(),
    }
    .apply_env();

    match args.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let hub = build_hub(config, args.offline).await?;
            Server::new(Arc::new(hub)).start().await?;
        }
        Command::Chat { session } => {
            let hub = build_hub(config, args.offline).await?;
            let session = session.map_or_else(SessionId::new, SessionId::from);
            Terminal::new(Arc::new(hub), session).run().await?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise info, or debug with `--verbose`
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
