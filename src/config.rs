//! Internal library configuration: the HTTP client's cache/rate-limit knobs
//! and the feed store's database path. Loading a YAML document is provided
//! as a convenience (`Config::load`); wiring it up from a CLI or env is the
//! out-of-scope outer layer's job (spec.md §1).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpClientConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Cached-bundle-GET and rate-limited-JSON-GET knobs (spec.md §4.8/§5).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpClientConfig {
    /// Directory holding cached feed bundles + ETag/Last-Modified metadata.
    #[serde(default = "HttpClientConfig::default_cache_dir")]
    pub cache_dir: String,
    /// Lower bound between successive realtime requests across the session.
    #[serde(default = "HttpClientConfig::default_min_interval_ms", rename = "min_interval_ms")]
    pub min_interval_ms: u64,
    /// Per-URL memoization TTL for realtime responses.
    #[serde(default = "HttpClientConfig::default_per_url_interval_ms", rename = "per_url_interval_ms")]
    pub per_url_interval_ms: u64,
    #[serde(default = "HttpClientConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl HttpClientConfig {
    fn default_cache_dir() -> String {
        "./gtfs-cache".to_string()
    }
    fn default_min_interval_ms() -> u64 {
        250
    }
    fn default_per_url_interval_ms() -> u64 {
        15_000
    }
    fn default_request_timeout_secs() -> u64 {
        30
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn per_url_interval(&self) -> Duration {
        Duration::from_millis(self.per_url_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
            min_interval_ms: Self::default_min_interval_ms(),
            per_url_interval_ms: Self::default_per_url_interval_ms(),
            request_timeout_secs: Self::default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite connection string, e.g. `sqlite::memory:` or `sqlite:feeds.db?mode=rwc`.
    #[serde(default = "StoreConfig::default_url")]
    pub url: String,
}

impl StoreConfig {
    fn default_url() -> String {
        "sqlite::memory:".to_string()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::MalformedFeed(format!("invalid config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.http.min_interval(), Duration::from_millis(250));
        assert_eq!(cfg.store.url, "sqlite::memory:");
    }

    #[test]
    fn loads_partial_yaml_with_defaults() {
        let dir = std::env::temp_dir().join(format!("gtfs-cache-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(&path, "store:\n  url: \"sqlite:test.db\"\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.store.url, "sqlite:test.db");
        assert_eq!(cfg.http.per_url_interval_ms, 15_000);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(Config::load("/nonexistent/path/config.yaml").is_err());
    }
}
