//! Process-wide configuration.
//!
//! Built once at startup and passed explicitly to the engine registry.
//! Sources, lowest to highest precedence: built-in defaults, an optional
//! TOML file, `SIFT_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SiftError};

const DEFAULT_CONFIG_PATH: &str = "sift.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub search_engine: SearchEngineConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchEngineConfig {
    /// Registry name of the engine to construct.
    pub engine: String,
    /// Index names are `<index_prefix>.<dataset id>`.
    pub index_prefix: String,
}

impl Default for SearchEngineConfig {
    fn default() -> Self {
        Self {
            engine: "elasticsearch".to_string(),
            index_prefix: "ds".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub hosts: Vec<String>,
    pub ssl_verify: bool,
    pub ca_path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    /// Applied to every dataset index at creation.
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub request_timeout_secs: u64,
    /// Extra attempts after the first one, for connection failures and
    /// (when `retry_on_timeout`) timeouts.
    pub max_retries: u32,
    pub retry_on_timeout: bool,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["http://localhost:9200".to_string()],
            ssl_verify: true,
            ca_path: None,
            username: None,
            password: None,
            api_key: None,
            number_of_shards: 1,
            number_of_replicas: 0,
            request_timeout_secs: 30,
            max_retries: 5,
            retry_on_timeout: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `sift.toml` if it exists), then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `SIFT_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SIFT_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("SIFT_PORT") {
            self.server.port = parse_env("SIFT_PORT", &v)?;
        }
        if let Some(v) = lookup("SIFT_SEARCH_ENGINE") {
            self.search_engine.engine = v;
        }
        if let Some(v) = lookup("SIFT_INDEX_PREFIX") {
            self.search_engine.index_prefix = v;
        }

        let es = &mut self.elasticsearch;
        if let Some(v) = lookup("SIFT_ELASTICSEARCH") {
            es.hosts = v
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("SIFT_ELASTICSEARCH_SSL_VERIFY") {
            es.ssl_verify = parse_env("SIFT_ELASTICSEARCH_SSL_VERIFY", &v)?;
        }
        if let Some(v) = lookup("SIFT_ELASTICSEARCH_CA_PATH") {
            es.ca_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SIFT_ELASTICSEARCH_USERNAME") {
            es.username = Some(v);
        }
        if let Some(v) = lookup("SIFT_ELASTICSEARCH_PASSWORD") {
            es.password = Some(v);
        }
        if let Some(v) = lookup("SIFT_ELASTICSEARCH_API_KEY") {
            es.api_key = Some(v);
        }
        if let Some(v) = lookup("SIFT_ES_RECORDS_INDEX_SHARDS") {
            es.number_of_shards = parse_env("SIFT_ES_RECORDS_INDEX_SHARDS", &v)?;
        }
        if let Some(v) = lookup("SIFT_ES_RECORDS_INDEX_REPLICAS") {
            es.number_of_replicas = parse_env("SIFT_ES_RECORDS_INDEX_REPLICAS", &v)?;
        }
        if let Some(v) = lookup("SIFT_ELASTICSEARCH_TIMEOUT_SECS") {
            es.request_timeout_secs = parse_env("SIFT_ELASTICSEARCH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("SIFT_ELASTICSEARCH_MAX_RETRIES") {
            es.max_retries = parse_env("SIFT_ELASTICSEARCH_MAX_RETRIES", &v)?;
        }

        if let Some(v) = lookup("SIFT_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("SIFT_LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.search_engine.engine.trim().is_empty() {
            return Err(SiftError::Config("search_engine.engine must be set".into()));
        }
        validate_index_prefix(&self.search_engine.index_prefix)?;
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(SiftError::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }
        self.elasticsearch.validate()
    }
}

/// Elasticsearch index names are lowercase and exclude a fixed set of
/// characters; the prefix may also not start with `-`, `_` or `+`.
fn validate_index_prefix(prefix: &str) -> Result<()> {
    const FORBIDDEN: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];
    let invalid = prefix.is_empty()
        || prefix.starts_with(['-', '_', '+'])
        || prefix.chars().any(|c| c.is_uppercase() || FORBIDDEN.contains(&c));
    if invalid {
        return Err(SiftError::Config(format!(
            "invalid index prefix '{prefix}': must be non-empty lowercase and a valid index name"
        )));
    }
    Ok(())
}

impl ElasticsearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(SiftError::Config(
                "at least one elasticsearch host is required".into(),
            ));
        }
        for host in &self.hosts {
            let url = Url::parse(host)
                .map_err(|e| SiftError::Config(format!("invalid elasticsearch host '{host}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SiftError::Config(format!(
                    "elasticsearch host '{host}' must use http or https"
                )));
            }
        }
        if self.number_of_shards == 0 {
            return Err(SiftError::Config("number_of_shards must be > 0".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SiftError::Config("request_timeout_secs must be > 0".into()));
        }
        if self.api_key.is_some() && self.username.is_some() {
            return Err(SiftError::Config(
                "configure either api_key or username/password, not both".into(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(SiftError::Config("password given without username".into()));
        }
        Ok(())
    }

    /// Parsed host URLs. Call after `validate`.
    pub fn host_urls(&self) -> Result<Vec<Url>> {
        self.hosts
            .iter()
            .map(|h| {
                Url::parse(h)
                    .map_err(|e| SiftError::Config(format!("invalid elasticsearch host '{h}': {e}")))
            })
            .collect()
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SiftError::Config(format!("invalid value for {key} ('{value}'): {e}")))
}
