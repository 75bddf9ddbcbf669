//! Hot reload of cache settings from the config file.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{CacheConfig, CacheSettings};

/// What a file looked like at the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }
}

/// Polls a config file and emits its settings when they change.
///
/// A rewrite that leaves the settings as they were emits nothing. Files that
/// fail to parse or validate are logged and skipped; the last good settings
/// stay in force.
pub struct SettingsWatcher {
    path: PathBuf,
    poll_interval: Duration,
    stamp: Option<FileStamp>,
    current: Option<CacheSettings>,
}

impl SettingsWatcher {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            stamp: None,
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file once. Returns settings that differ from the last ones
    /// seen.
    pub fn poll(&mut self) -> Option<CacheSettings> {
        let stamp = FileStamp::of(&self.path);
        if stamp.is_none() || stamp == self.stamp {
            return None;
        }
        self.stamp = stamp;

        let settings = match CacheConfig::load_from_path(&self.path)
            .and_then(|config| config.settings.validate().map(|()| config.settings))
        {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring invalid cache settings");
                return None;
            }
        };
        if self.current.as_ref() == Some(&settings) {
            return None;
        }
        self.current = Some(settings.clone());
        Some(settings)
    }

    /// Poll until `shutdown` flips to `true` or the receiver goes away.
    /// Whatever the file holds at start is the baseline and is not emitted.
    pub async fn watch(
        mut self,
        tx: mpsc::UnboundedSender<CacheSettings>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let _ = self.poll();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(path = %self.path.display(), "Settings watcher stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let Some(settings) = self.poll() else { continue };
                    debug!(path = %self.path.display(), "Cache settings changed on disk");
                    if tx.send(settings).is_err() {
                        debug!("Settings receiver closed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, body: &str) {
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_poll_missing_file() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = SettingsWatcher::new(tmp.path().join("config.json"), Duration::ZERO);
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn test_poll_emits_only_real_changes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        write(&path, r#"{"settings":{"default_ttl_ms":1000}}"#);
        let mut watcher = SettingsWatcher::new(path.clone(), Duration::ZERO);

        assert_eq!(watcher.poll().unwrap().default_ttl_ms, 1000);
        assert!(watcher.poll().is_none(), "file untouched");

        // Same settings, different bytes.
        write(&path, r#"{ "settings": { "default_ttl_ms": 1000 } }"#);
        assert!(watcher.poll().is_none());

        write(&path, r#"{"settings":{"default_ttl_ms":2000}}"#);
        assert_eq!(watcher.poll().unwrap().default_ttl_ms, 2000);
    }

    #[test]
    fn test_poll_skips_invalid_settings() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        write(&path, r#"{"settings":{"max_cache_size_bytes":0}}"#);
        let mut watcher = SettingsWatcher::new(path.clone(), Duration::ZERO);
        assert!(watcher.poll().is_none());

        write(&path, "{not json");
        assert!(watcher.poll().is_none());
    }

    #[tokio::test]
    async fn test_watch_sends_changes_and_stops() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        write(&path, "{}");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = SettingsWatcher::new(path.clone(), Duration::from_millis(20));
        let handle = tokio::spawn(watcher.watch(tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        write(
            &path,
            r#"{"settings":{"max_cache_size_bytes":4096,"cleanup_interval_ms":10}}"#,
        );
        let settings = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings.max_cache_size_bytes, 4096);
        assert_eq!(settings.cleanup_interval_ms, 10);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
