//! Terminal chat loop

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use quarry_core::{Hub, SessionId};

use crate::Result;

const HELP: &str = "Commands: /tables, /stats, /new, /help, /quit";

/// What the loop should do after one line
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Print(String),
    Quit,
}

pub struct Terminal {
    hub: Arc<Hub>,
    session: SessionId,
}

impl Terminal {
    pub fn new(hub: Arc<Hub>, session: SessionId) -> Self {
        Self { hub, session }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Welcome text with the currently loaded tables
    pub async fn banner(&self) -> Result<String> {
        let tables = self.hub.describe_datasets().await?;
        Ok(format!(
            "Quarry {} - ask questions about your data.\n{}\n{}",
            crate::VERSION,
            tables,
            HELP
        ))
    }

    /// Handle one input line
    pub async fn respond(&mut self, line: &str) -> Result<Reply> {
        let line = line.trim();
        let reply = match line {
            "/quit" | "/exit" | "exit" | "quit" => Reply::Quit,
            "/help" => Reply::Print(HELP.to_string()),
            "/tables" => Reply::Print(self.hub.describe_datasets().await?),
            "/stats" => Reply::Print(match self.hub.session_stats(&self.session)? {
                Some(stats) => format!(
                    "{} messages, {} refused, {} aborted",
                    stats.message_count, stats.refusals, stats.aborts
                ),
                None => "No messages in this session yet.".to_string(),
            }),
            "/new" => {
                self.hub.close_session(&self.session).await?;
                self.session = SessionId::new();
                Reply::Print(format!("Started {}", self.session))
            }
            _ => {
                let response = self
                    .hub
                    .handle(quarry_core::ChatRequest::new(self.session.clone(), line))
                    .await?;
                Reply::Print(response.message)
            }
        };
        Ok(reply)
    }

    /// Read stdin until end of input or `/quit`
    pub async fn run(mut self) -> Result<()> {
        println!("{}", self.banner().await?);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            eprint!("> ");
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match self.respond(&line).await? {
                Reply::Print(text) => println!("{}\n", text),
                Reply::Quit => break,
            }
        }

        if let Err(e) = self.hub.close_session(&self.session).await {
            tracing::warn!(session_id = %self.session, error = %e, "Could not close session");
        }
        Ok(())
    }
}
