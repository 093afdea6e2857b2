use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lake_core::PipelineError;
use lake_storage::{ApiClient, ApiClientConfig, BackoffPolicy, StoreConfig, TokenBucketConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::extractor::ExtractFailurePolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LakeConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub pipelines_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_concurrent_runs: usize,
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://lake.db".to_string(),
            db_max_connections: 5,
            pipelines_file: PathBuf::from("pipelines.yaml"),
            user_agent: "lake-bot/0.1".to_string(),
            http_timeout_secs: 20,
            max_concurrent_runs: 4,
        }
    }
}

impl LakeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LakeConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: lookup("LAKE_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db_max_connections),
            pipelines_file: lookup("LAKE_PIPELINES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.pipelines_file),
            user_agent: lookup("LAKE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: lookup("LAKE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            max_concurrent_runs: lookup("LAKE_MAX_CONCURRENT_RUNS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_runs),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.db_max_connections,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub endpoint: String,
    /// Sent verbatim on every request; auth lives here.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl ConnectionConfig {
    pub fn api_client(&self, config: &LakeConfig) -> Result<ApiClient, PipelineError> {
        if self.endpoint.trim().is_empty() {
            return Err(PipelineError::config("connection.endpoint is required"));
        }
        let defaults = ApiClientConfig::default();
        let backoff = BackoffPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.backoff.max_retries),
            ..defaults.backoff
        };
        ApiClient::new(ApiClientConfig {
            endpoint: self.endpoint.clone(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency),
            backoff,
            token_bucket: self.rate_limit.map(|limit| TokenBucketConfig {
                capacity: limit.capacity,
                refill_every: Duration::from_millis(limit.refill_every_ms),
            }),
        })
        .map_err(|err| PipelineError::config(format!("building api client: {err}")))
    }
}

/// One entry of the pipelines file: a plugin run over one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub plugin: String,
    #[serde(default = "empty_options")]
    pub options: serde_json::Value,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Overrides of each subtask's default enablement.
    #[serde(default)]
    pub subtasks: BTreeMap<String, bool>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub extract_failure_policy: ExtractFailurePolicy,
}

fn empty_options() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TaskInvocation {
    pub fn new(plugin: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            plugin: plugin.into(),
            options,
            connection: ConnectionConfig::default(),
            subtasks: BTreeMap::new(),
            incremental: false,
            extract_failure_policy: ExtractFailurePolicy::default(),
        }
    }

    /// Decode `options` into the plugin's typed options.
    pub fn typed_options<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_value(self.options.clone()).map_err(|err| {
            PipelineError::config(format!("invalid options for plugin {}: {err}", self.plugin))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFile {
    pub pipelines: Vec<TaskInvocation>,
}

pub fn parse_pipelines(raw: &str) -> Result<Vec<TaskInvocation>, PipelineError> {
    let file: PipelineFile = serde_yaml::from_str(raw)
        .map_err(|err| PipelineError::config(format!("parsing pipelines file: {err}")))?;
    Ok(file.pipelines)
}

pub async fn load_pipelines(path: &Path) -> Result<Vec<TaskInvocation>, PipelineError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        PipelineError::config(format!("reading {}: {err}", path.display()))
    })?;
    parse_pipelines(&raw)
}
