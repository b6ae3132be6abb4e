//! Catalog configuration management

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::FieldCipher;
use crate::error::CatalogError;

/// Provider names that may carry credentials, read from `<NAME>_API_KEY`
pub const KNOWN_PROVIDERS: &[&str] = &[
    "tmdb",
    "imdb",
    "tvdb",
    "musicbrainz",
    "lastfm",
    "spotify",
    "openlibrary",
    "goodreads",
    "igdb",
    "steam",
    "anidb",
    "myanimelist",
    "youtube",
    "github",
];

/// A share root the watcher subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedRoot {
    /// Logical share name, stored as `smb_root` in the catalog
    pub name: String,
    /// Where the share is mounted locally
    pub local_path: PathBuf,
    pub enabled: bool,
}

/// Catalog configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or path
    pub database_url: String,

    /// Base64 AES-256 key for encrypted catalog fields
    pub encryption_key: Option<String>,

    /// Analysis Scheduler worker pool size
    pub analysis_workers: usize,

    /// Maximum queued analysis requests before enqueue waits
    pub analysis_queue_capacity: usize,

    /// Change Processor worker pool size
    pub change_workers: usize,

    /// Window in which events for one path are coalesced
    pub debounce_delay: Duration,

    /// Bounded change-event queue between watcher and processor
    pub change_queue_capacity: usize,

    /// Per-request timeout for metadata provider calls
    pub provider_timeout: Duration,

    /// Start the filesystem watcher with the manager
    pub enable_realtime: bool,

    /// External metadata older than this is refreshed
    pub metadata_ttl: Duration,

    /// Provider name -> API key
    pub provider_api_keys: HashMap<String, String>,

    /// Contact string sent as MusicBrainz user agent
    pub musicbrainz_contact: Option<String>,

    pub watched_roots: Vec<WatchedRoot>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            encryption_key: Some(FieldCipher::generate_key()),
            analysis_workers: 4,
            analysis_queue_capacity: 1000,
            change_workers: 2,
            debounce_delay: Duration::from_secs(2),
            change_queue_capacity: 10_000,
            provider_timeout: Duration::from_secs(30),
            enable_realtime: true,
            metadata_ttl: Duration::from_secs(168 * 3600),
            provider_api_keys: HashMap::new(),
            musicbrainz_contact: None,
            watched_roots: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_PATH")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| default_database_url());

        let mut provider_api_keys = HashMap::new();
        for name in KNOWN_PROVIDERS {
            let var = format!("{}_API_KEY", name.to_uppercase());
            if let Ok(key) = env::var(&var) {
                if !key.trim().is_empty() {
                    provider_api_keys.insert(name.to_string(), key.trim().to_string());
                }
            }
        }

        let watched_roots = match env::var("WATCH_ROOTS") {
            Ok(spec) => parse_watch_roots(&spec).context("Invalid WATCH_ROOTS")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            database_url,

            encryption_key: env::var("CATALOG_ENCRYPTION_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),

            analysis_workers: env_or("ANALYSIS_WORKERS", 4),

            analysis_queue_capacity: env_or("ANALYSIS_QUEUE_CAPACITY", 1000),

            change_workers: env_or("CHANGE_WORKERS", 2),

            debounce_delay: Duration::from_millis(env_or("DEBOUNCE_DELAY_MS", 2000)),

            change_queue_capacity: env_or("CHANGE_QUEUE_CAPACITY", 10_000),

            provider_timeout: Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 30)),

            enable_realtime: env::var("ENABLE_REALTIME")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),

            metadata_ttl: Duration::from_secs(env_or::<u64>("METADATA_REFRESH_HOURS", 168) * 3600),

            provider_api_keys,

            musicbrainz_contact: env::var("MUSICBRAINZ_CONTACT").ok(),

            watched_roots,
        })
    }

    /// Check the invariants the components rely on before anything starts.
    pub fn validate(&self) -> std::result::Result<(), CatalogError> {
        if self.analysis_workers == 0 || self.change_workers == 0 {
            return Err(CatalogError::Config("worker pool size must be at least 1".into()));
        }
        if self.analysis_queue_capacity == 0 || self.change_queue_capacity == 0 {
            return Err(CatalogError::Config("queue capacity must be at least 1".into()));
        }
        match &self.encryption_key {
            Some(key) if !key.trim().is_empty() => {
                FieldCipher::decode_key(key)?;
            }
            _ => {
                return Err(CatalogError::Config(
                    "CATALOG_ENCRYPTION_KEY is required".into(),
                ));
            }
        }
        let mut seen = HashSet::new();
        for root in &self.watched_roots {
            if !seen.insert(root.name.as_str()) {
                return Err(CatalogError::Config(format!(
                    "watched root '{}' is declared twice",
                    root.name
                )));
            }
        }
        Ok(())
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.provider_api_keys.get(provider).map(String::as_str)
    }

    pub fn enabled_roots(&self) -> impl Iterator<Item = &WatchedRoot> {
        self.watched_roots.iter().filter(|r| r.enabled)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn default_database_url() -> String {
    match dirs::data_local_dir() {
        Some(dir) => format!("sqlite:{}", dir.join("catalog").join("catalog.db").display()),
        None => "sqlite:./data/catalog.db".to_string(),
    }
}

/// Parse `name=/local/path;!disabled=/other` into watched roots.
pub fn parse_watch_roots(spec: &str) -> Result<Vec<WatchedRoot>> {
    let mut roots = Vec::new();
    for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (enabled, entry) = match entry.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, entry),
        };
        let (name, path) = entry
            .split_once('=')
            .with_context(|| format!("expected name=path, got '{}'", entry))?;
        let name = name.trim();
        let path = path.trim();
        if name.is_empty() || path.is_empty() {
            anyhow::bail!("empty root name or path in '{}'", entry);
        }
        roots.push(WatchedRoot {
            name: name.to_string(),
            local_path: PathBuf::from(path),
            enabled,
        });
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_watch_roots() {
        let roots = parse_watch_roots("movies=/mnt/movies; !music=/mnt/music").unwrap();
        assert_eq!(
            roots,
            vec![
                WatchedRoot {
                    name: "movies".into(),
                    local_path: PathBuf::from("/mnt/movies"),
                    enabled: true,
                },
                WatchedRoot {
                    name: "music".into(),
                    local_path: PathBuf::from("/mnt/music"),
                    enabled: false,
                },
            ]
        );
    }

    #[test]
    fn test_parse_watch_roots_rejects_garbage() {
        assert!(parse_watch_roots("no-separator").is_err());
        assert!(parse_watch_roots("=/path").is_err());
        assert!(parse_watch_roots("").unwrap().is_empty());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let config = Config {
            encryption_key: None,
            ..Config::default()
        };
        assert_matches!(config.validate(), Err(CatalogError::Config(_)));
    }

    #[test]
    fn test_short_key_is_fatal() {
        let config = Config {
            encryption_key: Some("AQ==".into()),
            ..Config::default()
        };
        assert_matches!(config.validate(), Err(CatalogError::Config(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config {
            analysis_workers: 0,
            ..Config::default()
        };
        assert_matches!(config.validate(), Err(CatalogError::Config(_)));
    }

    #[test]
    fn test_duplicate_roots_rejected() {
        let root = WatchedRoot {
            name: "share".into(),
            local_path: PathBuf::from("/a"),
            enabled: true,
        };
        let config = Config {
            watched_roots: vec![root.clone(), root],
            ..Config::default()
        };
        assert_matches!(config.validate(), Err(CatalogError::Config(_)));
    }
}
