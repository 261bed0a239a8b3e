//! Engine configuration
//!
//! `EngineConfig` is loaded once at startup from an optional JSON file and
//! environment overrides, then handed to the store opener, the flusher and the
//! sync queue. Every field has a serde default so partial files (or files
//! written by older versions) deserialize without error.
//!
//! User-facing settings that change at runtime (theme, search filters, last
//! backup) are not configuration; they live in the store's settings
//! collection, see [`crate::settings`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `store.database_path`
pub const ENV_DB_PATH: &str = "NOTEKEEP_DB_PATH";
/// Environment variable overriding `sync.failure_rate`
pub const ENV_SYNC_FAILURE_RATE: &str = "NOTEKEEP_SYNC_FAILURE_RATE";
/// Environment variable overriding `store.open_retries`
pub const ENV_OPEN_RETRIES: &str = "NOTEKEEP_OPEN_RETRIES";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub flush: FlushConfig,
}

/// Persistent store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file location
    pub database_path: PathBuf,

    /// Retries after the first failed open attempt
    pub open_retries: u32,

    /// Linear backoff base: retry `n` waits `n * retry_backoff_ms`
    pub retry_backoff_ms: u64,

    /// Bound on a single open attempt
    pub open_timeout_ms: u64,

    /// Bound on single queries issued by the sync path
    pub query_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("notekeep.db"),
            open_retries: 3,
            retry_backoff_ms: 1_000,
            open_timeout_ms: 10_000,
            query_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Config for a database at `path` with default retry and timeout settings
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Default::default()
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Sync queue settings, including the simulated remote's behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,

    /// Probability in `[0, 1]` that a simulated push fails
    pub failure_rate: f64,

    /// Run a cycle periodically in addition to explicit triggers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            latency_min_ms: 500,
            latency_max_ms: 1_500,
            failure_rate: 0.1,
            interval_secs: None,
        }
    }
}

impl SyncConfig {
    /// Period of the background sync worker; `None` (or zero) means cycles
    /// only run when requested
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Background flusher settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlushConfig {
    /// Delay before retrying a failed background save
    pub retry_delay_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 2_000,
        }
    }
}

impl FlushConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; an unreadable or malformed file is
    /// an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(config.validated())
    }

    /// Apply `NOTEKEEP_*` environment overrides
    pub fn apply_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self.validated()
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            self.store.database_path = PathBuf::from(path);
        }
        if let Some(rate) = lookup(ENV_SYNC_FAILURE_RATE).and_then(|r| r.parse::<f64>().ok()) {
            self.sync.failure_rate = rate;
        }
        if let Some(retries) = lookup(ENV_OPEN_RETRIES).and_then(|r| r.parse::<u32>().ok()) {
            self.store.open_retries = retries;
        }
    }

    /// Clamp values that would make the engine misbehave
    pub fn validated(mut self) -> Self {
        if !self.sync.failure_rate.is_finite() {
            self.sync.failure_rate = SyncConfig::default().failure_rate;
        }
        self.sync.failure_rate = self.sync.failure_rate.clamp(0.0, 1.0);
        if self.sync.latency_min_ms > self.sync.latency_max_ms {
            std::mem::swap(&mut self.sync.latency_min_ms, &mut self.sync.latency_max_ms);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.store.open_retries, 3);
        assert_eq!(config.store.retry_backoff(), Duration::from_secs(1));
        assert_eq!(config.store.open_timeout(), Duration::from_secs(10));
        assert_eq!(config.store.query_timeout(), Duration::from_secs(5));
        assert_eq!(config.sync.latency_min_ms, 500);
        assert_eq!(config.sync.latency_max_ms, 1_500);
        assert!((config.sync.failure_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&temp_dir.path().join("absent.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"store": {"databasePath": "x"}, "sync": {"failure_rate": 0.5}}"#)
            .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        // Unknown keys are ignored; field names are snake_case
        assert_eq!(config.store.database_path, PathBuf::from("notekeep.db"));
        assert!((config.sync.failure_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.store.open_retries, 3);
    }

    #[test]
    fn test_sync_interval_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"sync": {"interval_secs": 30}}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.sync.interval(), Some(Duration::from_secs(30)));

        assert_eq!(EngineConfig::default().sync.interval(), None);
        let disabled = SyncConfig {
            interval_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(disabled.interval(), None);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overrides_and_clamping() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DB_PATH, "/tmp/other.db"),
            (ENV_SYNC_FAILURE_RATE, "7.5"),
            (ENV_OPEN_RETRIES, "1"),
        ]);

        let mut config = EngineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        let config = config.validated();

        assert_eq!(config.store.database_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.store.open_retries, 1);
        assert!((config.sync.failure_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_bounds_are_ordered() {
        let mut config = EngineConfig::default();
        config.sync.latency_min_ms = 900;
        config.sync.latency_max_ms = 100;
        let config = config.validated();
        assert_eq!(config.sync.latency_min_ms, 100);
        assert_eq!(config.sync.latency_max_ms, 900);
    }
}
