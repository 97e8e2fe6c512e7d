//! Load path: registers a new data source with the storage engine

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{invoke_with_timeout, CapabilityGateway, CapabilityRequest};
use crate::error::{LoadError, StageError};
use crate::schema::ColumnInfo;
use crate::types::{DataSourceDescriptor, Request};

/// One table created by a load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedTable {
    pub table: String,
    pub source: String,
    pub row_count: u64,
    pub columns: Vec<ColumnInfo>,
}

/// One file that failed inside a directory load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFailure {
    pub source: String,
    pub error: LoadError,
}

/// Outcome of a load; directory loads may partially succeed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<LoadedTable>,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    pub fn table_names(&self) -> Vec<String> {
        self.loaded.iter().map(|t| t.table.clone()).collect()
    }
}

/// Storage side of the load path
#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Load a file as one table, or every supported file in a directory
    async fn load(&self, source: &DataSourceDescriptor) -> Result<LoadReport, LoadError>;
}

pub struct Loader {
    gateway: Arc<dyn CapabilityGateway>,
    storage: Arc<dyn DataLoader>,
    timeout: Duration,
}

impl Loader {
    pub fn new(gateway: Arc<dyn CapabilityGateway>, storage: Arc<dyn DataLoader>, timeout: Duration) -> Self {
        Self {
            gateway,
            storage,
            timeout,
        }
    }

    /// Extract the source from the request text and load it
    pub async fn load(&self, request: &Request) -> Result<LoadReport, StageError> {
        let descriptor = invoke_with_timeout(
            self.gateway.as_ref(),
            CapabilityRequest::ExtractSource {
                question: request.raw_text.clone(),
            },
            self.timeout,
        )
        .await?
        .into_source()?;

        tracing::info!(
            session_id = %request.session_id,
            location = %descriptor.location,
            "Loading data source"
        );

        let report = self.storage.load(&descriptor).await?;
        for failure in &report.failures {
            tracing::warn!(source = %failure.source, error = %failure.error, "File skipped during load");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityReply, ScriptedCapability, StageName};
    use crate::schema::ColumnType;
    use crate::types::SessionId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingLoader {
        seen: Mutex<Vec<DataSourceDescriptor>>,
    }

    #[async_trait]
    impl DataLoader for RecordingLoader {
        async fn load(&self, source: &DataSourceDescriptor) -> Result<LoadReport, LoadError> {
            self.seen.lock().push(source.clone());
            Ok(LoadReport {
                loaded: vec![LoadedTable {
                    table: "sales".into(),
                    source: source.location.clone(),
                    row_count: 2,
                    columns: vec![ColumnInfo::new("amount", ColumnType::Real)],
                }],
                failures: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_descriptor_flows_to_storage() {
        let gateway = Arc::new(ScriptedCapability::new());
        gateway.push(
            StageName::Loader,
            Ok(CapabilityReply::Source(DataSourceDescriptor {
                location: "data/sales.csv".into(),
                table_name: None,
            })),
        );
        let storage = Arc::new(RecordingLoader::default());
        let loader = Loader::new(gateway, storage.clone(), Duration::from_secs(1));

        let request = Request::new(SessionId::from("s1"), "load data/sales.csv", 1);
        let report = loader.load(&request).await.unwrap();

        assert_eq!(report.table_names(), vec!["sales".to_string()]);
        assert_eq!(storage.seen.lock()[0].location, "data/sales.csv");
    }

    #[tokio::test]
    async fn test_capability_failure_is_reported() {
        let gateway = Arc::new(ScriptedCapability::new());
        let loader = Loader::new(gateway, Arc::new(RecordingLoader::default()), Duration::from_secs(1));

        let request = Request::new(SessionId::from("s1"), "load something", 1);
        let err = loader.load(&request).await.unwrap_err();
        assert!(matches!(err, StageError::Capability(_)));
    }
}
