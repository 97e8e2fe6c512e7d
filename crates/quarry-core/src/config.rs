//! Hub configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Default HTTP port of the chat gateway
pub const DEFAULT_PORT: u16 = 18790;

/// Default host of the chat gateway
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarryConfig {
    /// Retry ceilings
    pub retry: RetrySettings,

    /// Per-call time ceilings
    pub timeouts: TimeoutSettings,

    /// Topic policy and fixed messages
    pub guardrail: GuardrailSettings,

    /// Validator behaviour
    pub validator: ValidatorSettings,

    /// Language capability backend
    pub capability: CapabilitySettings,

    /// Tabular storage
    pub storage: StorageSettings,

    /// Session history
    pub session: SessionSettings,

    /// Chart artifacts
    pub charts: ChartSettings,

    /// Chat gateway binding
    pub server: ServerSettings,
}

impl QuarryConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the generation ceiling
    pub fn with_max_generation_attempts(mut self, max: u32) -> Self {
        self.retry.max_generation_attempts = max;
        self
    }

    /// Set the plan ceiling
    pub fn with_max_plan_attempts(mut self, max: u32) -> Self {
        self.retry.max_plan_attempts = max;
        self
    }

    /// Set the capability timeout
    pub fn with_capability_timeout_ms(mut self, ms: u64) -> Self {
        self.timeouts.capability_ms = ms;
        self
    }

    /// Set the query timeout
    pub fn with_query_timeout_ms(mut self, ms: u64) -> Self {
        self.timeouts.query_ms = ms;
        self
    }

    /// Set the database path
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.storage.database = database.into();
        self
    }

    /// Set the charts directory
    pub fn with_charts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.charts.output_dir = dir.into();
        self
    }

    /// Toggle the evaluator review in the validator
    pub fn with_semantic_review(mut self, enabled: bool) -> Self {
        self.validator.semantic_review = enabled;
        self
    }

    /// Load configuration from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?,
            Some("json") => serde_json::from_str(&content)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                )
                .into())
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a `.toml` or `.json` file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override settings from the process environment (reads `.env` first)
    pub fn apply_env(mut self) -> Self {
        let _ = dotenvy::dotenv();

        if let Ok(endpoint) = std::env::var("OPENAI_API_ENDPOINT") {
            self.capability.base_url = endpoint;
        }
        if let Ok(model) = std::env::var("QUARRY_MODEL") {
            self.capability.model = model;
        }
        if let Ok(database) = std::env::var("QUARRY_DATABASE") {
            self.storage.database = database;
        }
        if let Ok(dir) = std::env::var("QUARRY_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Reject settings that would let a request loop or never time out
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_generation_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_generation_attempts must be > 0".into()).into());
        }
        if self.retry.max_plan_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_plan_attempts must be > 0".into()).into());
        }
        if self.timeouts.capability_ms == 0
            || self.timeouts.query_ms == 0
            || self.timeouts.schema_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()).into());
        }
        if self.guardrail.outbound_redirect_message.trim().is_empty() {
            return Err(ConfigError::Invalid("guardrail.outbound_redirect_message is empty".into()).into());
        }
        Ok(())
    }
}

/// Retry ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Generation attempts allowed per plan
    pub max_generation_attempts: u32,

    /// Plan attempts allowed per request
    pub max_plan_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_generation_attempts: 3,
            max_plan_attempts: 2,
        }
    }
}

/// Per-call timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub capability_ms: u64,
    pub query_ms: u64,
    pub schema_ms: u64,
}

impl TimeoutSettings {
    pub fn capability(&self) -> Duration {
        Duration::from_millis(self.capability_ms)
    }

    pub fn query(&self) -> Duration {
        Duration::from_millis(self.query_ms)
    }

    pub fn schema(&self) -> Duration {
        Duration::from_millis(self.schema_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            capability_ms: 20_000,
            query_ms: 5_000,
            schema_ms: 2_000,
        }
    }
}

/// Guardrail policy and fixed messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailSettings {
    /// Topics requests and responses must stay within
    pub allowed_topics: Vec<String>,

    /// Returned when the inbound check rejects a request
    pub refusal_message: String,

    /// Substituted when the outbound check rejects a response
    pub outbound_redirect_message: String,
}

impl Default for GuardrailSettings {
    fn default() -> Self {
        Self {
            allowed_topics: vec![
                "data analysis and statistics".to_string(),
                "tables, columns and datasets".to_string(),
                "loading or querying data".to_string(),
                "charts and visualizations of data".to_string(),
                "errors and guidance about data operations".to_string(),
            ],
            refusal_message: "I can only help with data analysis questions about your datasets. \
                Please ask about your data, table schemas, or analytics queries."
                .to_string(),
            outbound_redirect_message: "I can only provide responses about data analysis and your datasets. \
                Please ask questions about your data, calculations, or insights from your tables."
                .to_string(),
        }
    }
}

/// Validator behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSettings {
    /// Ask the capability whether an executed result answers the question
    pub semantic_review: bool,

    /// Rows shown to the evaluator
    pub review_preview_rows: usize,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            semantic_review: true,
            review_preview_rows: 20,
        }
    }
}

/// Capability backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityProvider {
    /// Deterministic keyword rules, no network
    Heuristic,
    /// Any `/chat/completions` compatible endpoint
    OpenaiCompatible,
}

/// Capability backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySettings {
    pub provider: CapabilityProvider,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            provider: CapabilityProvider::Heuristic,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}

/// Tabular storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite path, `:memory:` for a private in-memory database
    pub database: String,

    /// Directory loaded at start-up
    pub data_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: ":memory:".to_string(),
            data_dir: None,
        }
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Prior exchanges passed to the capability as context
    pub history_window: usize,

    /// SQLite append-only session log; in-memory when unset
    pub log_path: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_window: 6,
            log_path: None,
        }
    }
}

/// Chart artifact settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartSettings {
    pub output_dir: PathBuf,
}

impl Default for ChartSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("charts"),
        }
    }
}

/// Chat gateway binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}
