use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bulk::{BatcherConfig, ScriptType, UpdateOptions, DEFAULT_BULK_PATH, TARGET_BULK_BYTES};
use crate::pool::{PoolConfig, ProbeConfig};
use crate::retry::{RetryConfig, CONFLICT_CODE, SUCCESS_CODES};
use crate::transport::TransportConfig;

/// Cluster addresses and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Initial endpoint URLs
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Sent as `Authorization: ApiKey <value>`; excludes `user`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Verify TLS certificates (default: true)
    #[serde(default = "default_true")]
    pub ssl_verification: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_hosts() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            user: None,
            password: None,
            api_key: None,
            ssl_verification: true,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Health checking and discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_healthcheck_path")]
    pub healthcheck_path: String,

    #[serde(default)]
    pub sniffing: bool,

    #[serde(default = "default_five_secs")]
    pub sniffing_delay_secs: u64,

    #[serde(default = "default_sniffing_path")]
    pub sniffing_path: String,

    /// Delay between resurrection passes over dead endpoints
    #[serde(default = "default_five_secs")]
    pub resurrect_delay_secs: u64,
}

fn default_healthcheck_path() -> String {
    "/".to_string()
}

fn default_sniffing_path() -> String {
    "/_nodes/http".to_string()
}

fn default_five_secs() -> u64 {
    5
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            healthcheck_path: default_healthcheck_path(),
            sniffing: false,
            sniffing_delay_secs: default_five_secs(),
            sniffing_path: default_sniffing_path(),
            resurrect_delay_secs: default_five_secs(),
        }
    }
}

/// Bulk request shaping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSettings {
    /// gzip level 0-9, 0 disables compression
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Uncompressed byte budget per sub-request
    #[serde(default = "default_target_bulk_bytes")]
    pub target_bulk_bytes: usize,

    #[serde(default = "default_bulk_path")]
    pub bulk_path: String,
}

fn default_compression_level() -> u32 {
    1
}

fn default_target_bulk_bytes() -> usize {
    TARGET_BULK_BYTES
}

fn default_bulk_path() -> String {
    DEFAULT_BULK_PATH.to_string()
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            target_bulk_bytes: default_target_bulk_bytes(),
            bulk_path: default_bulk_path(),
        }
    }
}

/// Backoff and failure routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_initial_interval")]
    pub retry_initial_interval_secs: u64,

    #[serde(default = "default_retry_max_interval")]
    pub retry_max_interval_secs: u64,

    /// Extra item statuses routed to the dead letter sink
    #[serde(default)]
    pub dlq_custom_codes: Vec<u16>,

    /// Error types whose item failures are not logged
    #[serde(default)]
    pub silence_errors_in_log: Vec<String>,

    /// NDJSON file receiving dead-lettered actions; logged only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_path: Option<String>,
}

fn default_retry_initial_interval() -> u64 {
    2
}

fn default_retry_max_interval() -> u64 {
    64
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_initial_interval_secs: default_retry_initial_interval(),
            retry_max_interval_secs: default_retry_max_interval(),
            dlq_custom_codes: Vec::new(),
            silence_errors_in_log: Vec::new(),
            dead_letter_path: None,
        }
    }
}

/// How update actions are rendered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSettings {
    #[serde(default)]
    pub doc_as_upsert: bool,

    #[serde(default)]
    pub scripted_upsert: bool,

    /// inline, indexed or file
    #[serde(default)]
    pub script_type: ScriptType,

    #[serde(default = "default_script_lang")]
    pub script_lang: String,

    #[serde(default = "default_script_var_name")]
    pub script_var_name: String,
}

fn default_script_lang() -> String {
    "painless".to_string()
}

fn default_script_var_name() -> String {
    "event".to_string()
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            doc_as_upsert: false,
            scripted_upsert: false,
            script_type: ScriptType::Inline,
            script_lang: default_script_lang(),
            script_var_name: default_script_var_name(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub bulk: BulkSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub action: ActionSettings,
}

impl Config {
    /// Reject settings the rest of the crate cannot honor
    pub fn validate(&self) -> Result<()> {
        let cluster = &self.cluster;
        if cluster.hosts.is_empty() {
            anyhow::bail!("At least one host must be configured");
        }
        for host in &cluster.hosts {
            let with_scheme = if host.contains("://") {
                host.clone()
            } else {
                format!("http://{}", host)
            };
            let parsed = url::Url::parse(&with_scheme)
                .with_context(|| format!("Invalid host URL: {}", host))?;
            if parsed.host_str().is_none() {
                anyhow::bail!("Host URL has no host: {}", host);
            }
        }
        if cluster.api_key.is_some() && cluster.user.is_some() {
            anyhow::bail!("Only one of api_key and user/password may be set");
        }
        if cluster.password.is_some() && cluster.user.is_none() {
            anyhow::bail!("password is set without user");
        }

        if self.action.doc_as_upsert && self.action.scripted_upsert {
            anyhow::bail!("doc_as_upsert and scripted_upsert are mutually exclusive");
        }

        if self.bulk.compression_level > 9 {
            anyhow::bail!(
                "compression_level must be between 0 and 9, got {}",
                self.bulk.compression_level
            );
        }
        if self.bulk.target_bulk_bytes == 0 {
            anyhow::bail!("target_bulk_bytes must be greater than zero");
        }

        let pool = &self.pool;
        if pool.resurrect_delay_secs == 0 {
            anyhow::bail!("resurrect_delay_secs must be greater than zero");
        }
        if pool.sniffing && pool.sniffing_delay_secs == 0 {
            anyhow::bail!("sniffing_delay_secs must be greater than zero when sniffing is enabled");
        }

        let retry = &self.retry;
        if retry.retry_initial_interval_secs == 0 {
            anyhow::bail!("retry_initial_interval_secs must be greater than zero");
        }
        if retry.retry_initial_interval_secs > retry.retry_max_interval_secs {
            anyhow::bail!(
                "retry_initial_interval_secs ({}) exceeds retry_max_interval_secs ({})",
                retry.retry_initial_interval_secs,
                retry.retry_max_interval_secs
            );
        }
        for code in &retry.dlq_custom_codes {
            if SUCCESS_CODES.contains(code) || *code == CONFLICT_CODE {
                anyhow::bail!("dlq_custom_codes may not contain success or conflict code {}", code);
            }
        }

        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            request_timeout: Duration::from_secs(self.cluster.request_timeout_secs),
            ssl_verification: self.cluster.ssl_verification,
            user: self.cluster.user.clone(),
            password: self.cluster.password.clone(),
            api_key: self.cluster.api_key.clone(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            probe: ProbeConfig {
                healthcheck_path: self.pool.healthcheck_path.clone(),
            },
            resurrect_delay: Duration::from_secs(self.pool.resurrect_delay_secs),
            sniffing: self.pool.sniffing,
            sniffing_delay: Duration::from_secs(self.pool.sniffing_delay_secs),
            sniffing_path: self.pool.sniffing_path.clone(),
            ..PoolConfig::default()
        }
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            target_bulk_bytes: self.bulk.target_bulk_bytes,
            compression_level: self.bulk.compression_level,
            bulk_path: self.bulk.bulk_path.clone(),
            update: UpdateOptions {
                doc_as_upsert: self.action.doc_as_upsert,
                scripted_upsert: self.action.scripted_upsert,
                script_type: self.action.script_type,
                script_lang: self.action.script_lang.clone(),
                script_var_name: self.action.script_var_name.clone(),
            },
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_secs(self.retry.retry_initial_interval_secs),
            max_interval: Duration::from_secs(self.retry.retry_max_interval_secs),
            dlq_custom_codes: self.retry.dlq_custom_codes.clone(),
            silence_errors_in_log: self.retry.silence_errors_in_log.clone(),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// - BULKSHIP_HOSTS (comma-separated list of URLs)
/// - BULKSHIP_USER / BULKSHIP_PASSWORD
/// - BULKSHIP_API_KEY
/// - BULKSHIP_SNIFFING (true/false)
/// - BULKSHIP_COMPRESSION_LEVEL (0-9)
/// - BULKSHIP_TARGET_BULK_BYTES
///
/// Everything else keeps its default.
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    if let Ok(hosts) = std::env::var("BULKSHIP_HOSTS") {
        config.cluster.hosts = hosts
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if config.cluster.hosts.is_empty() {
            anyhow::bail!("BULKSHIP_HOSTS contains no valid hosts");
        }
    }

    config.cluster.user = std::env::var("BULKSHIP_USER").ok();
    config.cluster.password = std::env::var("BULKSHIP_PASSWORD").ok();
    config.cluster.api_key = std::env::var("BULKSHIP_API_KEY").ok();

    if let Some(sniffing) = env_parse("BULKSHIP_SNIFFING")? {
        config.pool.sniffing = sniffing;
    }
    if let Some(level) = env_parse("BULKSHIP_COMPRESSION_LEVEL")? {
        config.bulk.compression_level = level;
    }
    if let Some(bytes) = env_parse("BULKSHIP_TARGET_BULK_BYTES")? {
        config.bulk.target_bulk_bytes = bytes;
    }

    Ok(config)
}

/// Load configuration from file or environment, then validate it
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };
    config.validate()?;
    Ok(config)
}
