//! Wire a [`Hub`] from configuration

use std::sync::Arc;

use quarry_core::capability::CapabilityGateway;
use quarry_core::config::CapabilityProvider;
use quarry_core::stages::DataLoader;
use quarry_core::types::DataSourceDescriptor;
use quarry_core::{
    HeuristicCapability, Hub, InMemorySessionStore, OpenAiCompatibleCapability, QuarryConfig, SessionStore,
    SqliteSessionLog, SqliteStore,
};

use crate::Result;

/// Capability backend for `config`; `offline` forces the heuristic backend
pub fn capability_for(config: &QuarryConfig, offline: bool) -> Arc<dyn CapabilityGateway> {
    match (offline, config.capability.provider) {
        (true, _) | (false, CapabilityProvider::Heuristic) => Arc::new(HeuristicCapability::new()),
        (false, CapabilityProvider::OpenaiCompatible) => {
            Arc::new(OpenAiCompatibleCapability::from_settings(&config.capability))
        }
    }
}

/// Open storage, pick the capability backend and preload `storage.data_dir`
pub async fn build_hub(config: QuarryConfig, offline: bool) -> Result<Hub> {
    let store = Arc::new(SqliteStore::open(&config.storage.database)?);

    if let Some(dir) = &config.storage.data_dir {
        let source = DataSourceDescriptor {
            location: dir.display().to_string(),
            table_name: None,
        };
        match store.load(&source).await {
            Ok(report) => {
                tracing::info!(tables = ?report.table_names(), "Preloaded data directory");
                for failure in &report.failures {
                    tracing::warn!(source = %failure.source, error = %failure.error, "Skipped file");
                }
            }
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Could not preload data directory"),
        }
    }

    let sessions: Arc<dyn SessionStore> = match &config.session.log_path {
        Some(path) => Arc::new(SqliteSessionLog::open(path)?),
        None => Arc::new(InMemorySessionStore::new()),
    };

    let capability = capability_for(&config, offline);
    let hub = Hub::builder(config)
        .capability(capability)
        .with_sqlite(store)
        .sessions(sessions)
        .build()?;
    Ok(hub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{Category, ChatRequest};

    #[tokio::test]
    async fn test_preloads_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("orders.csv"), "id,total\n1,9.5\n2,20\n").unwrap();

        let mut config = QuarryConfig::new().with_charts_dir(dir.path().join("charts"));
        config.storage.data_dir = Some(dir.path().to_path_buf());
        let hub = build_hub(config, true).await.unwrap();

        let tables = hub.describe_datasets().await.unwrap();
        assert!(tables.contains("- orders (2 rows)"), "{}", tables);

        let response = hub
            .handle(ChatRequest::new("t", "what is the maximum total in orders?"))
            .await
            .unwrap();
        assert_eq!(response.category, Category::DirectStat);
        assert_eq!(response.message, "The maximum of 'total' in 'orders' is 20.0.");
    }

    #[tokio::test]
    async fn test_session_log_persists_across_hubs() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = QuarryConfig::new().with_charts_dir(dir.path().join("charts"));
        config.session.log_path = Some(dir.path().join("sessions.db"));

        let hub = build_hub(config.clone(), true).await.unwrap();
        hub.handle(ChatRequest::new("p", "tell me a joke")).await.unwrap();
        drop(hub);

        let reopened = build_hub(config, true).await.unwrap();
        let history = reopened.history(&"p".into()).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].response.success);
    }

    #[test]
    fn test_offline_overrides_provider() {
        let mut config = QuarryConfig::new();
        config.capability.provider = CapabilityProvider::OpenaiCompatible;
        assert_eq!(capability_for(&config, true).name(), "heuristic");
        assert_ne!(capability_for(&config, false).name(), "heuristic");
    }
}
