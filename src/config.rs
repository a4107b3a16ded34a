use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::translator::MAX_ATTEMPTS;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Path to a service-account key; falls back to application default credentials.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Fixed bearer token. Without one the client authenticates with the
    /// warehouse credentials file or application default credentials.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_context_tables")]
    pub max_context_tables: usize,
    /// Deadline for gathering the schema context that precedes the first model call.
    #[serde(default = "default_context_timeout_ms")]
    pub context_timeout_ms: u64,
}

fn default_model() -> String {
    "gemini-1.0-pro".to_string()
}

fn default_location() -> String {
    "us-central1".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_output_tokens() -> u32 {
    2048
}

fn default_top_p() -> f32 {
    0.8
}

fn default_top_k() -> u32 {
    40
}

fn default_llm_timeout_ms() -> u64 {
    30_000
}

fn default_max_context_tables() -> usize {
    20
}

fn default_context_timeout_ms() -> u64 {
    30_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            location: default_location(),
            endpoint: None,
            access_token: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            timeout_ms: default_llm_timeout_ms(),
            max_context_tables: default_max_context_tables(),
            context_timeout_ms: default_context_timeout_ms(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
    #[serde(default = "default_sample_rows")]
    pub default_sample_rows: usize,
    #[serde(default = "default_max_sample_rows")]
    pub max_sample_rows: usize,
}

fn default_max_rows() -> usize {
    1000
}

fn default_query_timeout_ms() -> u64 {
    60_000
}

fn default_max_result_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_sample_rows() -> usize {
    5
}

fn default_max_sample_rows() -> usize {
    100
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            timeout_ms: default_query_timeout_ms(),
            max_result_bytes: default_max_result_bytes(),
            default_sample_rows: default_sample_rows(),
            max_sample_rows: default_max_sample_rows(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_max_statement_length")]
    pub max_statement_length: usize,
    #[serde(default)]
    pub denied_tables: Vec<String>,
}

fn default_max_statement_length() -> usize {
    100_000
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_statement_length: default_max_statement_length(),
            denied_tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub audit_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let contents = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("Cannot read config file: {}", e)))?;
                toml::from_str(&contents)
                    .map_err(|e| Error::Config(format!("Invalid config file: {}", e)))?
            }
            None => Config::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("PROJECT_ID") {
            self.warehouse.project_id = Some(val);
        }
        if let Ok(val) = std::env::var("DATASET_ID") {
            self.warehouse.dataset_id = Some(val);
        }
        if let Ok(val) = std::env::var("SQLGENIUS_CREDENTIALS_PATH") {
            self.warehouse.credentials_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("VERTEX_AI_LOCATION") {
            self.llm.location = val;
        }
        if let Ok(val) = std::env::var("SQLGENIUS_LLM_ACCESS_TOKEN") {
            self.llm.access_token = Some(val);
        }
        if let Ok(val) = std::env::var("SQLGENIUS_MAX_ROWS") {
            self.limits.max_rows = parse_env("SQLGENIUS_MAX_ROWS", &val)?;
        }
        if let Ok(val) = std::env::var("SQLGENIUS_QUERY_TIMEOUT_MS") {
            self.limits.timeout_ms = parse_env("SQLGENIUS_QUERY_TIMEOUT_MS", &val)?;
        }
        if let Ok(val) = std::env::var("SQLGENIUS_AUDIT_LOGGING") {
            self.logging.audit_enabled = val == "true" || val == "1";
        }
        if let Ok(val) = std::env::var("SQLGENIUS_LOG_FORMAT") {
            self.logging.format = match val.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_rows == 0 {
            return Err(Error::Config("limits.max_rows must be greater than zero".into()));
        }
        if self.limits.timeout_ms == 0 {
            return Err(Error::Config("limits.timeout_ms must be greater than zero".into()));
        }
        if self.llm.timeout_ms == 0 {
            return Err(Error::Config("llm.timeout_ms must be greater than zero".into()));
        }
        if self.llm.context_timeout_ms == 0 {
            return Err(Error::Config(
                "llm.context_timeout_ms must be greater than zero".into(),
            ));
        }
        let request_budget_ms = self.rpc.request_timeout_secs.saturating_mul(1000);
        let worst_case_ms = self.worst_case_request_ms();
        if request_budget_ms < worst_case_ms {
            return Err(Error::Config(format!(
                "rpc.request_timeout_secs ({}s) is shorter than the worst-case question ({} ms: schema context, {} model calls, query)",
                self.rpc.request_timeout_secs, worst_case_ms, MAX_ATTEMPTS
            )));
        }
        if self.limits.default_sample_rows > self.limits.max_sample_rows {
            return Err(Error::Config(
                "limits.default_sample_rows cannot exceed limits.max_sample_rows".into(),
            ));
        }
        if self.policy.max_statement_length == 0 {
            return Err(Error::Config(
                "policy.max_statement_length must be greater than zero".into(),
            ));
        }
        if self.warehouse.project_id.is_none() || self.warehouse.dataset_id.is_none() {
            warn!("No warehouse project_id/dataset_id configured - the BigQuery backend will not start");
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.timeout_ms)
    }

    /// Sum of the inner deadlines a natural-language question can run into.
    pub fn worst_case_request_ms(&self) -> u64 {
        self.llm
            .context_timeout_ms
            .saturating_add(self.llm.timeout_ms.saturating_mul(u64::from(MAX_ATTEMPTS)))
            .saturating_add(self.limits.timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {}", name, val)))
}
