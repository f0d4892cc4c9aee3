use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

pub use crate::core::queue::QueueSettings as QueueDefaults;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix for every backend key; lets tenants share one store.
    pub namespace: Option<String>,
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Lost claim races tolerated inside one `receive`/`pop`.
    pub claim_attempts: usize,
    pub cache_capacity: usize,
    pub cache_ttl_ms: u64,
    pub reap_interval_ms: u64,
    pub reap_batch: usize,
    /// Flake worker id; random when unset.
    pub worker_id: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            claim_attempts: 5,
            cache_capacity: 256,
            cache_ttl_ms: 30_000,
            reap_interval_ms: 1_000,
            reap_batch: 128,
            worker_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub queue: QueueDefaults,
    pub engine: EngineConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

fn env_parse<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl Config {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: built-in defaults, then the file (`path`, else
    /// `XSMQ_CONFIG`), then `XSMQ_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("XSMQ_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let mut config = match effective_path {
            Some(p) => Self::load_file(p)?,
            None => Config::default(),
        };

        // Env overrides.
        if let Ok(v) = env::var("XSMQ_NAMESPACE") {
            let v = v.trim().to_string();
            config.store.namespace = (!v.is_empty()).then_some(v);
        }
        if let Ok(v) = env::var("XSMQ_REDIS_URL") {
            config.store.redis_url = v;
        }
        if let Some(v) = env_parse("XSMQ_HTIMEOUT")? {
            config.queue.htimeout = v;
        }
        if let Some(v) = env_parse("XSMQ_ETIMEOUT")? {
            config.queue.etimeout = v;
        }
        if let Some(v) = env_parse("XSMQ_PLIMIT")? {
            config.queue.plimit = v;
        }
        if let Some(v) = env_parse("XSMQ_CLAIM_ATTEMPTS")? {
            config.engine.claim_attempts = v;
        }
        if let Some(v) = env_parse("XSMQ_REAP_INTERVAL_MS")? {
            config.engine.reap_interval_ms = v;
        }

        config
            .queue
            .validate()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }
}

/// Strict parse of a TOML file; no environment overlay.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [queue]
            htimeout = 5

            [engine]
            worker_id = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.htimeout, 5);
        assert_eq!(config.queue.etimeout, -1);
        assert_eq!(config.engine.worker_id, Some(7));
        assert_eq!(config.engine.claim_attempts, 5);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn unknown_types_are_rejected() {
        let err = toml::from_str::<Config>("[queue]\nhtimeout = \"soon\"\n");
        assert!(err.is_err());
    }
}
