use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_WORKER_COUNT: usize = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine configuration. Immutable once handed to a `Dispatcher`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Workflow name → endpoint path on the runtime.
    pub workflows: BTreeMap<String, String>,
    pub default_timeout: Duration,
    pub max_retries: u32,
    /// Unit of the linear retry backoff.
    pub retry_delay: Duration,
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Reported through stats; not used for scheduling.
    pub batch_size: usize,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub verbose: bool,
}

impl DispatchConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            workflows: BTreeMap::new(),
            default_timeout: Duration::ZERO,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            worker_count: 0,
            queue_capacity: 0,
            batch_size: 0,
            health_interval: Duration::ZERO,
            health_timeout: Duration::ZERO,
            verbose: false,
        }
        .normalized()
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = if key.trim().is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_workflow(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.workflows.insert(name.into(), path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self.normalized()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self.normalized()
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self.normalized()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self.normalized()
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self.normalized()
    }

    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch_size = batch;
        self.normalized()
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self.normalized()
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self.normalized()
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Replace zero values with the documented defaults.
    pub fn normalized(mut self) -> Self {
        if self.default_timeout.is_zero() {
            self.default_timeout = DEFAULT_TIMEOUT;
        }
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = DEFAULT_RETRY_DELAY;
        }
        if self.worker_count == 0 {
            self.worker_count = DEFAULT_WORKER_COUNT;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.health_interval.is_zero() {
            self.health_interval = DEFAULT_HEALTH_INTERVAL;
        }
        if self.health_timeout.is_zero() {
            self.health_timeout = DEFAULT_HEALTH_TIMEOUT;
        }
        self
    }

    /// Base URL without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RuntimeSettings {
    /// Base URL of the workflow runtime, e.g. <http://127.0.0.1:5678>
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key sent with every runtime call except the bare-root health probe.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct DispatchSettings {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub health_interval_ms: Option<u64>,
    #[serde(default)]
    pub health_timeout_ms: Option<u64>,
    #[serde(default)]
    pub verbose: Option<bool>,
}

/// On-disk configuration model.
#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// Workflow name → endpoint path (e.g. `/webhook/document-analysis`).
    #[serde(default)]
    pub workflows: BTreeMap<String, String>,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

static SETTINGS_SCHEMA: Lazy<std::result::Result<Validator, String>> = Lazy::new(|| {
    let schema = schemars::schema_for!(Settings);
    let schema_value = serde_json::to_value(&schema).map_err(|e| e.to_string())?;
    validator_for(&schema_value).map_err(|e| e.to_string())
});

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Settings);
    serde_json::to_value(&schema).unwrap_or_default()
}

pub fn parse_settings(content: &str) -> Result<Settings> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validator = SETTINGS_SCHEMA
        .as_ref()
        .map_err(|e| anyhow!("settings schema unavailable: {e}"))?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let settings: Settings = toml::from_str(content)?;
    Ok(settings)
}

pub fn load_settings(path: &str) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

impl Settings {
    /// `WFD_RUNTIME_URL`, `WFD_RUNTIME_API_KEY` and `WFD_VERBOSE` win over
    /// file values.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(url) = env_nonempty("WFD_RUNTIME_URL") {
            self.runtime.base_url = Some(url);
        }
        if let Some(key) = env_nonempty("WFD_RUNTIME_API_KEY") {
            self.runtime.api_key = Some(key);
        }
        if let Some(flag) = env_nonempty("WFD_VERBOSE") {
            self.dispatch.verbose = Some(matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ));
        }
        self
    }

    pub fn into_config(self) -> Result<DispatchConfig> {
        let base_url = self
            .runtime
            .base_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow!("runtime.base_url is required"))?;
        let d = self.dispatch;
        let mut cfg = DispatchConfig {
            base_url,
            api_key: self.runtime.api_key.filter(|k| !k.trim().is_empty()),
            workflows: self.workflows,
            default_timeout: Duration::from_millis(d.timeout_ms.unwrap_or(0)),
            max_retries: d.max_retries.unwrap_or(0),
            retry_delay: Duration::from_millis(d.retry_delay_ms.unwrap_or(0)),
            worker_count: d.workers.unwrap_or(0),
            queue_capacity: d.queue_capacity.unwrap_or(0),
            batch_size: d.batch_size.unwrap_or(0),
            health_interval: Duration::from_millis(d.health_interval_ms.unwrap_or(0)),
            health_timeout: Duration::from_millis(d.health_timeout_ms.unwrap_or(0)),
            verbose: d.verbose.unwrap_or(false),
        };
        cfg = cfg.normalized();
        Ok(cfg)
    }
}

/// Load, validate, apply env overrides and normalize in one step.
pub fn load_config(path: &str) -> Result<DispatchConfig> {
    load_settings(path)?.apply_env_overrides().into_config()
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
