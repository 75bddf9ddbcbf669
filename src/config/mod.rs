//! Cache configuration: settings, context allow-list, and where they come from.
//!
//! Precedence, lowest first: built-in defaults, the JSON config file
//! (`<cache dir>/config.json` unless a path is given), then `ZEPTOCACHE_*`
//! environment variables.

pub mod watcher;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CacheError, Result};

pub use watcher::SettingsWatcher;

/// Name of the cache directory created inside a workspace.
pub const CACHE_DIR_NAME: &str = ".zeptocache";
/// Config file name inside the cache directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

const DEFAULT_MAX_CACHE_SIZE_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60 * 60 * 1000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;

/// Runtime-tunable cache settings. Persisted inside the metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Total payload bytes the cache aims to stay under.
    pub max_cache_size_bytes: u64,
    /// TTL applied when `set` is called without an override.
    pub default_ttl_ms: u64,
    /// Expiry sweep period. `0` disables the background sweeper.
    pub cleanup_interval_ms: u64,
    /// Whether context participates in key derivation and the
    /// compatibility check on read.
    pub context_sensitive: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE_BYTES,
            default_ttl_ms: DEFAULT_TTL_MS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            context_sensitive: true,
        }
    }
}

impl CacheSettings {
    /// Reject settings that would make the cache meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size_bytes == 0 {
            return Err(CacheError::Config(
                "max_cache_size_bytes must be greater than zero".into(),
            ));
        }
        if self.default_ttl_ms == 0 {
            return Err(CacheError::Config(
                "default_ttl_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Merge the provided fields of `update` into a copy of these settings.
    pub fn merged(&self, update: &SettingsUpdate) -> Self {
        Self {
            max_cache_size_bytes: update
                .max_cache_size_bytes
                .unwrap_or(self.max_cache_size_bytes),
            default_ttl_ms: update.default_ttl_ms.unwrap_or(self.default_ttl_ms),
            cleanup_interval_ms: update
                .cleanup_interval_ms
                .unwrap_or(self.cleanup_interval_ms),
            context_sensitive: update.context_sensitive.unwrap_or(self.context_sensitive),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Partial settings for `ResponseCache::update_settings`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub max_cache_size_bytes: Option<u64>,
    pub default_ttl_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub context_sensitive: Option<bool>,
}

impl From<&CacheSettings> for SettingsUpdate {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            max_cache_size_bytes: Some(settings.max_cache_size_bytes),
            default_ttl_ms: Some(settings.default_ttl_ms),
            cleanup_interval_ms: Some(settings.cleanup_interval_ms),
            context_sensitive: Some(settings.context_sensitive),
        }
    }
}

/// Context allow-list beyond the built-in fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Extra context keys that participate in key derivation and are kept
    /// on stored entries. Matched case-insensitively.
    pub extra_fields: Vec<String>,
}

/// Full cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory. `None` means [`CacheConfig::default_dir`].
    pub dir: Option<PathBuf>,
    pub settings: CacheSettings,
    /// Upper bound for every individual backing-store call.
    pub io_timeout_ms: u64,
    pub context: ContextConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            settings: CacheSettings::default(),
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            context: ContextConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Config rooted at an explicit directory, everything else default.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// `<workspace>/.zeptocache`, where the workspace is the current
    /// directory (falling back to the home directory).
    pub fn default_dir() -> PathBuf {
        std::env::current_dir()
            .ok()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CACHE_DIR_NAME)
    }

    /// Resolved cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(Self::default_dir)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Load configuration: file at `path` (or `<default dir>/config.json`)
    /// then environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_dir().join(CONFIG_FILE_NAME),
        };
        let mut config = Self::load_from_path(&path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(CacheError::Config(format!(
                    "Failed to read config at {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            CacheError::Config(format!(
                "Failed to parse config at {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply `ZEPTOCACHE_*` overrides. Unparseable values are logged and
    /// ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ZEPTOCACHE_DIR").filter(|v| !v.trim().is_empty()) {
            self.dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(v) = parse_env(&lookup, "ZEPTOCACHE_MAX_SIZE_BYTES") {
            self.settings.max_cache_size_bytes = v;
        }
        if let Some(v) = parse_env(&lookup, "ZEPTOCACHE_DEFAULT_TTL_MS") {
            self.settings.default_ttl_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "ZEPTOCACHE_CLEANUP_INTERVAL_MS") {
            self.settings.cleanup_interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "ZEPTOCACHE_CONTEXT_SENSITIVE") {
            self.settings.context_sensitive = v;
        }
        if let Some(v) = parse_env(&lookup, "ZEPTOCACHE_IO_TIMEOUT_MS") {
            self.io_timeout_ms = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        if self.io_timeout_ms == 0 {
            return Err(CacheError::Config(
                "io_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
