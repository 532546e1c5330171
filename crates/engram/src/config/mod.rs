//! Configuration loading
//!
//! TOML file discovered from an explicit path, `ENGRAM_CONFIG`, or the
//! platform config directory, with a handful of environment overrides on
//! top. Every field has a default so an empty file (or no file) works.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub brief: BriefConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the LanceDB dataset
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// TTL for the ephemeral read cache
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bearer token required on every endpoint except the health probe.
    /// Empty disables auth; only sensible for local development.
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_token: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "fastembed" or "hash"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Deadline for embedding a single text before degrading
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            dimension: default_embedding_dimension(),
            timeout_ms: default_embedding_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Session-tier records older than this are deleted
    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,
    /// Short-term window in days; expiry deletes
    #[serde(default = "default_short_term_days")]
    pub short_term_days: u32,
    /// Medium-term window in days; expiry demotes
    #[serde(default = "default_medium_term_days")]
    pub medium_term_days: u32,
    /// Long-term window in days; expiry demotes
    #[serde(default = "default_long_term_days")]
    pub long_term_days: u32,
    /// Records below this confidence age out one window early
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f32,
    /// Accesses within the window required for promotion
    #[serde(default = "default_promote_access_threshold")]
    pub promote_access_threshold: u32,
    /// Max records processed per maintenance batch
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Scheduler interval between maintenance runs
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
    /// Store a summary record after each maintenance run
    #[serde(default)]
    pub record_summary: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_max_age_secs: default_session_max_age_secs(),
            short_term_days: default_short_term_days(),
            medium_term_days: default_medium_term_days(),
            long_term_days: default_long_term_days(),
            low_confidence_threshold: default_low_confidence_threshold(),
            promote_access_threshold: default_promote_access_threshold(),
            batch_limit: default_batch_limit(),
            interval_secs: default_maintenance_interval_secs(),
            record_summary: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefConfig {
    #[serde(default = "default_brief_window_hours")]
    pub default_window_hours: u32,
    #[serde(default = "default_brief_max_items")]
    pub max_items: usize,
}

impl Default for BriefConfig {
    fn default() -> Self {
        Self {
            default_window_hours: default_brief_window_hours(),
            max_items: default_brief_max_items(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("engram")
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_listen_addr() -> String {
    "127.0.0.1:7977".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_embedding_provider() -> String {
    "fastembed".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_timeout_ms() -> u64 {
    5000
}

fn default_session_max_age_secs() -> u64 {
    3600
}

fn default_short_term_days() -> u32 {
    7
}

fn default_medium_term_days() -> u32 {
    30
}

fn default_long_term_days() -> u32 {
    365
}

fn default_low_confidence_threshold() -> f32 {
    0.3
}

fn default_promote_access_threshold() -> u32 {
    5
}

fn default_batch_limit() -> usize {
    500
}

fn default_maintenance_interval_secs() -> u64 {
    86400
}

fn default_brief_window_hours() -> u32 {
    24
}

fn default_brief_max_items() -> usize {
    20
}

impl Config {
    /// Load configuration, layering: defaults, TOML file, env overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = match Self::discover_path(path) {
            Some(file) => {
                let contents = std::fs::read_to_string(&file)?;
                toml::from_str(&contents).map_err(|e| {
                    EngramError::Config(format!("Failed to parse {}: {e}", file.display()))
                })?
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn discover_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path);
        }
        if let Ok(path) = std::env::var("ENGRAM_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let candidate = dirs::config_dir()?.join("engram").join("config.toml");
        candidate.exists().then_some(candidate)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("ENGRAM_TOKEN") {
            self.server.auth_token = token;
        }
        if let Ok(dir) = std::env::var("ENGRAM_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("ENGRAM_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(EngramError::Config(
                "embedding.dimension must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retention.low_confidence_threshold) {
            return Err(EngramError::Config(
                "retention.low_confidence_threshold must be in [0, 1]".to_string(),
            ));
        }
        if self.retention.batch_limit == 0 {
            return Err(EngramError::Config(
                "retention.batch_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:7977");
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.retention.short_term_days, 7);
        assert_eq!(config.retention.medium_term_days, 30);
        assert_eq!(config.retention.long_term_days, 365);
        assert_eq!(config.retention.session_max_age_secs, 3600);
        assert_eq!(config.brief.default_window_hours, 24);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            [server]
            listen_addr = "0.0.0.0:8080"

            [retention]
            short_term_days = 14
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.retention.short_term_days, 14);
        // untouched sections keep defaults
        assert_eq!(config.retention.medium_term_days, 30);
        assert_eq!(config.embedding.provider, "fastembed");
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.embedding.timeout_ms, 5000);
        assert_eq!(config.storage.cache_ttl_secs, 30);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.retention.low_confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let mut config = Config::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());
    }
}
