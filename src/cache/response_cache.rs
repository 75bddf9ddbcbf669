//! Response cache façade with TTL expiry, LRU eviction, and disk persistence.
//!
//! Entries live under `<dir>/entries`, one file each, addressed by a
//! SHA-256 fingerprint of the request key and its relevant context. Counters
//! live in `<dir>/metadata.json` and `<dir>/stats.json`. Nothing about the
//! entries is kept in memory between calls, so every `get` reads from disk.
//!
//! The cache is best-effort. `get` and `set` never fail: storage errors,
//! timeouts and corrupt records are logged and turned into a miss or a
//! no-op. Only invalid settings are reported, at open or update time.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::codec::{JsonCodec, PayloadCodec, StoredEntry};
use super::eviction::{select_expired, select_lru_victims, EntrySummary, SweepReport, SweeperHandle};
use super::key::{is_fingerprint, CacheContext, KeyDeriver};
use super::lock::KeyLocks;
use super::short;
use super::stats::{CacheReport, StatsTracker};
use super::store::{EntryStore, ReadOutcome};
use crate::config::{CacheConfig, CacheSettings, SettingsUpdate};
use crate::error::Result;

/// Sub-directory holding entry files.
const ENTRIES_DIR: &str = "entries";

struct Inner<T, C> {
    dir: PathBuf,
    store: EntryStore,
    deriver: KeyDeriver,
    tracker: StatsTracker,
    codec: C,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
    sweeper: Mutex<Option<SweeperHandle>>,
    _payload: PhantomData<fn() -> T>,
}

/// Persistent, size-bounded, context-aware cache of `T` values.
///
/// Cheap to clone; clones share the same instance. Call
/// [`destroy`](Self::destroy) on shutdown to stop the sweeper and flush
/// counters.
pub struct ResponseCache<T, C = JsonCodec<T>> {
    inner: Arc<Inner<T, C>>,
}

impl<T, C> Clone for ResponseCache<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, C> ResponseCache<T, C>
where
    T: Send + 'static,
    C: PayloadCodec<T>,
{
    /// Open (or create) the cache described by `config` with the default
    /// codec and the system clock.
    pub async fn open(config: CacheConfig) -> Result<Self>
    where
        C: Default,
    {
        Self::open_with(config, C::default(), Arc::new(SystemClock)).await
    }

    /// Open with an explicit codec and clock.
    ///
    /// Fails only when the configuration is invalid. An unusable directory
    /// is logged and every later operation degrades to a miss or a no-op.
    pub async fn open_with(config: CacheConfig, codec: C, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let dir = config.cache_dir();
        let entries_dir = dir.join(ENTRIES_DIR);
        if let Err(e) = tokio::fs::create_dir_all(&entries_dir).await {
            warn!(path = %entries_dir.display(), error = %e, "Cache directory unavailable; caching disabled until it is");
        }

        let store = EntryStore::new(entries_dir, config.io_timeout());
        if let Err(e) = store.remove_temp_files().await {
            warn!(error = %e, "Failed to remove stale cache temp files");
        }
        let tracker = StatsTracker::load(&dir, config.io_timeout(), config.settings.clone()).await;

        let cache = Self {
            inner: Arc::new(Inner {
                dir,
                store,
                deriver: KeyDeriver::new(&config.context.extra_fields),
                tracker,
                codec,
                clock,
                locks: KeyLocks::default(),
                sweeper: Mutex::new(None),
                _payload: PhantomData,
            }),
        };
        cache.reconcile().await;
        cache.restart_sweeper().await;
        info!(
            dir = %cache.inner.dir.display(),
            entries = cache.inner.tracker.snapshot().metadata.total_entries,
            "Response cache opened"
        );
        Ok(cache)
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Fingerprint `key` and `context` map to under the current settings.
    pub fn fingerprint(&self, key: &str, context: Option<&CacheContext>) -> String {
        let sensitive = self.inner.tracker.settings().context_sensitive;
        self.inner.deriver.derive(key, context, sensitive)
    }

    /// File backing `fingerprint`.
    pub fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.inner.store.entry_path(fingerprint)
    }

    /// Look up a cached value. `None` on miss, expiry, context mismatch,
    /// corruption, or storage failure.
    pub async fn get(&self, key: &str, context: Option<&CacheContext>) -> Option<T> {
        let started = Instant::now();
        let result = self.lookup(key, context).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(Some(value)) => {
                self.inner.tracker.record_hit(latency_ms);
                Some(value)
            }
            Ok(None) => {
                self.inner.tracker.record_miss(latency_ms);
                None
            }
            Err(e) => {
                warn!(error = %e, "Cache lookup failed; treating as a miss");
                self.inner.tracker.record_miss(latency_ms);
                None
            }
        }
    }

    async fn lookup(&self, key: &str, context: Option<&CacheContext>) -> Result<Option<T>> {
        if key.is_empty() {
            return Ok(None);
        }
        let inner = &self.inner;
        let settings = inner.tracker.settings();
        let fingerprint = inner.deriver.derive(key, context, settings.context_sensitive);
        let _guard = inner.locks.lock(&fingerprint).await;

        let mut entry = match inner.store.read(&fingerprint).await? {
            ReadOutcome::Found(entry) => entry,
            ReadOutcome::NotFound => {
                debug!(fingerprint = %short(&fingerprint), "Cache miss");
                return Ok(None);
            }
            ReadOutcome::Corrupt(corruption) => {
                warn!(fingerprint = %short(&fingerprint), reason = %corruption, "Removing corrupt cache entry");
                // Without a readable header the byte total stays high until
                // the next sweep recounts it.
                self.remove_locked(&fingerprint, corruption.size_hint).await?;
                return Ok(None);
            }
        };

        let now = inner.clock.now_ms();
        if entry.is_expired(now) {
            debug!(fingerprint = %short(&fingerprint), "Cache entry expired, removing");
            self.remove_locked(&fingerprint, Some(entry.size_bytes())).await?;
            return Ok(None);
        }

        if settings.context_sensitive {
            let requested = inner.deriver.sanitize(context);
            if !entry.header.context.is_compatible_with(&requested) {
                debug!(fingerprint = %short(&fingerprint), "Cached entry has incompatible context");
                return Ok(None);
            }
        }

        let value = match inner.codec.decode(&entry.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(fingerprint = %short(&fingerprint), error = %e, "Cached payload does not decode, removing");
                self.remove_locked(&fingerprint, Some(entry.size_bytes())).await?;
                return Ok(None);
            }
        };

        entry.touch(now);
        if let Err(e) = inner.store.write(&entry).await {
            warn!(fingerprint = %short(&fingerprint), error = %e, "Failed to record cache hit");
        }
        debug!(fingerprint = %short(&fingerprint), hits = entry.header.access_count, "Cache hit");
        Ok(Some(value))
    }

    /// Store `payload`. `ttl` overrides the default TTL for this entry.
    ///
    /// Failures are logged; caching is never the reason a caller fails.
    pub async fn set(
        &self,
        key: &str,
        payload: &T,
        context: Option<&CacheContext>,
        ttl: Option<Duration>,
    ) {
        if key.is_empty() {
            debug!("Ignoring cache write with empty key");
            return;
        }
        if let Err(e) = self.store_entry(key, payload, context, ttl).await {
            warn!(error = %e, "Cache write failed; continuing without caching");
        }
    }

    async fn store_entry(
        &self,
        key: &str,
        payload: &T,
        context: Option<&CacheContext>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let inner = &self.inner;
        let bytes = inner.codec.encode(payload)?;
        let size = bytes.len() as u64;
        let settings = inner.tracker.settings();

        let total = inner.tracker.total_size_bytes();
        let budget = settings.max_cache_size_bytes;
        if total.saturating_add(size) > budget {
            // Make room for the whole new entry, not just the overage.
            let freed = self.evict_lru(size).await;
            if freed < size {
                debug!(size, budget, "Cache over budget after eviction; admitting entry anyway");
            }
        }

        let fingerprint = inner.deriver.derive(key, context, settings.context_sensitive);
        let ttl_ms = ttl
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(settings.default_ttl_ms);
        let entry = StoredEntry::new(
            fingerprint.clone(),
            bytes,
            inner.deriver.sanitize(context),
            ttl_ms,
            inner.clock.now_ms(),
        );

        {
            let _guard = inner.locks.lock(&fingerprint).await;
            let previous = match inner.store.read(&fingerprint).await? {
                ReadOutcome::Found(old) => Some(old.size_bytes()),
                ReadOutcome::Corrupt(c) => Some(c.size_hint.unwrap_or(0)),
                ReadOutcome::NotFound => None,
            };
            inner.store.write(&entry).await?;
            inner.tracker.entry_stored(previous, size);
        }
        inner.tracker.persist_metadata().await;
        debug!(fingerprint = %short(&fingerprint), size, ttl_ms, "Cached response");
        Ok(())
    }

    /// Remove an entry by fingerprint, or by key (without context) when the
    /// argument is not a stored fingerprint. Returns whether anything was
    /// removed.
    pub async fn delete(&self, fingerprint_or_key: &str) -> bool {
        if is_fingerprint(fingerprint_or_key) && self.delete_fingerprint(fingerprint_or_key).await {
            return true;
        }
        let fingerprint = self.inner.deriver.derive(fingerprint_or_key, None, false);
        self.delete_fingerprint(&fingerprint).await
    }

    /// Remove the entry `key` and `context` map to.
    pub async fn delete_with_context(&self, key: &str, context: Option<&CacheContext>) -> bool {
        let fingerprint = self.fingerprint(key, context);
        self.delete_fingerprint(&fingerprint).await
    }

    async fn delete_fingerprint(&self, fingerprint: &str) -> bool {
        let removed = {
            let _guard = self.inner.locks.lock(fingerprint).await;
            let size = match self.inner.store.read(fingerprint).await {
                Ok(ReadOutcome::Found(entry)) => Some(entry.size_bytes()),
                Ok(ReadOutcome::Corrupt(c)) => c.size_hint,
                Ok(ReadOutcome::NotFound) => return false,
                Err(e) => {
                    warn!(fingerprint = %short(fingerprint), error = %e, "Cache delete failed");
                    return false;
                }
            };
            match self.remove_locked(fingerprint, size).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(fingerprint = %short(fingerprint), error = %e, "Cache delete failed");
                    false
                }
            }
        };
        if removed {
            self.inner.tracker.persist_metadata().await;
        }
        removed
    }

    /// Remove every entry.
    pub async fn clear(&self) {
        let inner = &self.inner;
        match inner.store.clear().await {
            Ok(()) => {
                inner.tracker.set_totals(0, 0);
                info!("Response cache cleared");
            }
            Err(e) => warn!(error = %e, "Failed to clear response cache"),
        }
        inner.locks.prune();
        inner.tracker.persist_metadata().await;
    }

    /// Delete expired and corrupt entries. Runs on the background timer and
    /// may also be called directly.
    pub async fn cleanup(&self) -> SweepReport {
        let inner = &self.inner;
        let generation = inner.tracker.generation();
        let now = inner.clock.now_ms();
        let mut report = SweepReport::default();

        let mut summaries = Vec::new();
        let mut corrupt = Vec::new();
        let mut scan = inner.store.scan();
        while let Some(item) = scan.next().await {
            report.inspected += 1;
            match item.entry {
                Ok(entry) => summaries.push(EntrySummary::from(&entry.header)),
                Err(corruption) => corrupt.push((item.fingerprint, corruption)),
            }
        }

        let expired = select_expired(&summaries, now);
        let mut live_entries = summaries.len() as u64;
        let mut live_bytes: u64 = summaries.iter().map(|s| s.size_bytes).sum();
        let mut own_changes = 0u64;

        for victim in &expired {
            let _guard = inner.locks.lock(&victim.fingerprint).await;
            // Re-check under the lock; a concurrent set may have replaced it.
            let current = match inner.store.read(&victim.fingerprint).await {
                Ok(ReadOutcome::Found(entry)) => entry,
                _ => continue,
            };
            if !current.is_expired(now) {
                continue;
            }
            match self.remove_locked(&victim.fingerprint, Some(current.size_bytes())).await {
                Ok(true) => {
                    own_changes += 1;
                    report.expired += 1;
                    report.bytes_reclaimed += current.size_bytes();
                    live_entries -= 1;
                    live_bytes = live_bytes.saturating_sub(victim.size_bytes);
                }
                Ok(false) => {}
                Err(e) => warn!(fingerprint = %short(&victim.fingerprint), error = %e, "Failed to remove expired entry"),
            }
        }

        for (fingerprint, corruption) in corrupt {
            let _guard = inner.locks.lock(&fingerprint).await;
            match inner.store.read(&fingerprint).await {
                Ok(ReadOutcome::Corrupt(_)) => {}
                Ok(ReadOutcome::Found(entry)) => {
                    live_entries += 1;
                    live_bytes += entry.size_bytes();
                    continue;
                }
                Ok(ReadOutcome::NotFound) => continue,
                Err(e) => {
                    live_entries += 1;
                    live_bytes += corruption.size_hint.unwrap_or(0);
                    warn!(fingerprint = %short(&fingerprint), error = %e, "Failed to re-read corrupt entry");
                    continue;
                }
            }
            match self.remove_locked(&fingerprint, corruption.size_hint).await {
                Ok(true) => {
                    own_changes += 1;
                    report.corrupt += 1;
                    report.bytes_reclaimed += corruption.size_hint.unwrap_or(0);
                    warn!(fingerprint = %short(&fingerprint), reason = %corruption, "Removed corrupt cache entry");
                }
                Ok(false) => {}
                Err(e) => {
                    live_entries += 1;
                    live_bytes += corruption.size_hint.unwrap_or(0);
                    warn!(fingerprint = %short(&fingerprint), error = %e, "Failed to remove corrupt entry");
                }
            }
        }

        // Re-derive totals from what the scan saw, unless another operation
        // changed them while the sweep ran.
        inner
            .tracker
            .set_totals_if_generation(generation + own_changes, live_entries, live_bytes);
        inner.tracker.mark_cleanup(now);
        inner.locks.prune();
        inner.tracker.persist_metadata().await;

        if report.removed() > 0 {
            info!(
                inspected = report.inspected,
                expired = report.expired,
                corrupt = report.corrupt,
                bytes_reclaimed = report.bytes_reclaimed,
                "Cache sweep finished"
            );
        } else {
            debug!(inspected = report.inspected, "Cache sweep finished");
        }
        report
    }

    /// Read-only snapshot of counters and metadata.
    pub fn stats(&self) -> CacheReport {
        self.inner.tracker.snapshot()
    }

    /// Current settings.
    pub fn settings(&self) -> CacheSettings {
        self.inner.tracker.settings()
    }

    /// Merge `update` into the running settings.
    ///
    /// A budget below the current total evicts immediately; a new cleanup
    /// interval restarts the sweeper. Invalid settings are rejected and
    /// leave the running settings untouched.
    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<()> {
        let inner = &self.inner;
        let (current, next) = inner.tracker.merge_settings(&update)?;
        if next == current {
            return Ok(());
        }

        let total = inner.tracker.total_size_bytes();
        if total > next.max_cache_size_bytes {
            let freed = self.evict_lru(total - next.max_cache_size_bytes).await;
            debug!(freed, budget = next.max_cache_size_bytes, "Evicted after budget shrink");
        }
        if next.cleanup_interval_ms != current.cleanup_interval_ms {
            self.restart_sweeper().await;
        }
        inner.tracker.persist_metadata().await;
        info!(
            max_cache_size_bytes = next.max_cache_size_bytes,
            default_ttl_ms = next.default_ttl_ms,
            cleanup_interval_ms = next.cleanup_interval_ms,
            context_sensitive = next.context_sensitive,
            "Cache settings updated"
        );
        Ok(())
    }

    /// Zero hit/miss/eviction counters.
    pub async fn reset_stats(&self) {
        self.inner.tracker.reset_counters();
        self.inner.tracker.persist_stats().await;
    }

    /// Flush metadata and stats.
    pub async fn save(&self) {
        self.inner.tracker.persist().await;
    }

    /// Stop the background sweeper and flush metadata and stats.
    pub async fn destroy(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().await.take() {
            sweeper.stop().await;
        }
        self.inner.tracker.persist().await;
        info!("Response cache shut down");
    }

    // -- private helpers ---------------------------------------------------

    /// Delete `fingerprint` and update the totals. Caller holds its lock.
    async fn remove_locked(&self, fingerprint: &str, size_bytes: Option<u64>) -> Result<bool> {
        let removed = self.inner.store.delete(fingerprint).await?;
        if removed {
            self.inner.tracker.entry_removed(size_bytes);
        }
        Ok(removed)
    }

    /// Evict least recently used entries until `bytes_needed` are freed or
    /// nothing is left. Returns the bytes actually freed.
    async fn evict_lru(&self, bytes_needed: u64) -> u64 {
        let inner = &self.inner;
        let mut summaries = Vec::new();
        let mut scan = inner.store.scan();
        while let Some(item) = scan.next().await {
            if let Ok(entry) = item.entry {
                summaries.push(EntrySummary::from(&entry.header));
            }
        }

        let mut freed = 0u64;
        for victim in select_lru_victims(&summaries, bytes_needed) {
            let _guard = inner.locks.lock(&victim.fingerprint).await;
            // Skip entries refreshed or replaced since the scan.
            let current = match inner.store.read(&victim.fingerprint).await {
                Ok(ReadOutcome::Found(entry))
                    if entry.header.last_accessed_at == victim.last_accessed_at
                        && entry.header.created_at == victim.created_at =>
                {
                    entry
                }
                _ => continue,
            };
            match self.remove_locked(&victim.fingerprint, Some(current.size_bytes())).await {
                Ok(true) => {
                    freed += current.size_bytes();
                    inner.tracker.record_eviction();
                    debug!(fingerprint = %short(&victim.fingerprint), size = current.size_bytes(), "Evicted LRU cache entry");
                }
                Ok(false) => {}
                Err(e) => warn!(fingerprint = %short(&victim.fingerprint), error = %e, "Failed to evict cache entry"),
            }
        }
        freed
    }

    /// Recount totals from disk. Heals a crash between an entry write and
    /// the metadata write.
    async fn reconcile(&self) {
        let mut entries = 0u64;
        let mut bytes = 0u64;
        let mut scan = self.inner.store.scan();
        while let Some(item) = scan.next().await {
            entries += 1;
            bytes += match &item.entry {
                Ok(entry) => entry.size_bytes(),
                Err(corruption) => corruption.size_hint.unwrap_or(0),
            };
        }
        let before = self.inner.tracker.snapshot().metadata;
        if before.total_entries != entries || before.total_size_bytes != bytes {
            debug!(
                recorded_entries = before.total_entries,
                recorded_bytes = before.total_size_bytes,
                entries,
                bytes,
                "Reconciled cache totals with disk"
            );
        }
        self.inner.tracker.set_totals(entries, bytes);
    }

    async fn restart_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock().await;
        let interval = self.inner.tracker.settings().cleanup_interval();
        if slot.as_ref().map(SweeperHandle::interval) == Some(interval) {
            return;
        }
        if let Some(old) = slot.take() {
            old.stop().await;
        }
        let weak: Weak<Inner<T, C>> = Arc::downgrade(&self.inner);
        *slot = SweeperHandle::spawn(interval, move || {
            let inner = weak.upgrade()?;
            Some(async move {
                ResponseCache { inner }.cleanup().await;
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    async fn open(tmp: &TempDir, settings: CacheSettings) -> (ResponseCache<Value>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = CacheConfig {
            settings,
            ..CacheConfig::in_dir(tmp.path())
        };
        let cache = ResponseCache::open_with(config, JsonCodec::new(), clock.clone())
            .await
            .unwrap();
        (cache, clock)
    }

    fn no_sweeper() -> CacheSettings {
        CacheSettings {
            cleanup_interval_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        assert!(cache.get("q", None).await.is_none());
        cache.set("q", &json!("response"), None, None).await;
        assert_eq!(cache.get("q", None).await, Some(json!("response")));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_cache_hit_increments_count() {
        let tmp = TempDir::new().unwrap();
        let (cache, clock) = open(&tmp, no_sweeper()).await;
        cache.set("k", &json!(1), None, None).await;
        clock.advance(5);
        let _ = cache.get("k", None).await;
        let _ = cache.get("k", None).await;
        let fp = cache.fingerprint("k", None);
        let bytes = std::fs::read(cache.entry_path(&fp)).unwrap();
        let entry = crate::cache::codec::decode_entry(&bytes).unwrap();
        assert_eq!(entry.header.access_count, 3);
        assert_eq!(entry.header.last_accessed_at, 1_000_005);
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let tmp = TempDir::new().unwrap();
        let (cache, clock) = open(&tmp, no_sweeper()).await;
        cache
            .set("key", &json!("resp"), None, Some(Duration::from_millis(10)))
            .await;
        clock.advance(10);
        assert!(cache.get("key", None).await.is_some(), "not yet past ttl");
        clock.advance(1);
        assert!(cache.get("key", None).await.is_none());
        let fp = cache.fingerprint("key", None);
        assert!(!cache.entry_path(&fp).exists());
        let meta = cache.stats().metadata;
        assert_eq!((meta.total_entries, meta.total_size_bytes), (0, 0));
    }

    #[tokio::test]
    async fn test_overwrite_does_not_double_count() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        cache.set("k", &json!("aaaa"), None, None).await;
        cache.set("k", &json!("bb"), None, None).await;
        let meta = cache.stats().metadata;
        assert_eq!(meta.total_entries, 1);
        assert_eq!(meta.total_size_bytes, 4); // "bb" with quotes
    }

    #[tokio::test]
    async fn test_incompatible_context_is_kept() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        let web = CacheContext::new().with_project_type("web");
        cache.set("q", &json!("v1"), Some(&web), None).await;

        // Rewrite the stored context so it disagrees with the request on
        // skill level while the fingerprint stays the same.
        let fp = cache.fingerprint("q", Some(&web));
        let bytes = std::fs::read(cache.entry_path(&fp)).unwrap();
        let mut entry = crate::cache::codec::decode_entry(&bytes).unwrap();
        entry.header.context = KeyDeriver::default()
            .sanitize(Some(&web.clone().with_skill_level("expert")));
        std::fs::write(
            cache.entry_path(&fp),
            crate::cache::codec::encode_entry(&entry).unwrap(),
        )
        .unwrap();

        assert!(cache.get("q", Some(&web)).await.is_none());
        assert!(cache.entry_path(&fp).exists(), "incompatible entry must survive");
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_delete_by_key_and_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        cache.set("a", &json!(1), None, None).await;
        cache.set("b", &json!(2), None, None).await;
        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);
        let fp = cache.fingerprint("b", None);
        assert!(cache.delete(&fp).await);
        assert!(!cache.delete(&"0".repeat(64)).await);
        assert_eq!(cache.stats().metadata.total_entries, 0);
    }

    #[tokio::test]
    async fn test_delete_with_context() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        let web = CacheContext::new().with_project_type("web");
        cache.set("q", &json!(1), Some(&web), None).await;
        assert!(!cache.delete("q").await, "plain key maps to another fingerprint");
        assert!(cache.delete_with_context("q", Some(&web)).await);
    }

    #[tokio::test]
    async fn test_empty_key_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        cache.set("", &json!(1), None, None).await;
        assert!(cache.get("", None).await.is_none());
        assert_eq!(cache.stats().metadata.total_entries, 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_removed() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        let fp = cache.fingerprint("k", None);
        // Valid entry framing around a payload the JSON codec rejects.
        let entry = StoredEntry::new(
            fp.clone(),
            b"{not json".to_vec(),
            Default::default(),
            60_000,
            1_000_000,
        );
        cache.inner.store.write(&entry).await.unwrap();
        cache.inner.tracker.entry_stored(None, entry.size_bytes());

        assert!(cache.get("k", None).await.is_none());
        assert!(!cache.entry_path(&fp).exists());
        assert_eq!(cache.stats().metadata.total_size_bytes, 0);
    }

    #[tokio::test]
    async fn test_reopen_reconciles_totals() {
        let tmp = TempDir::new().unwrap();
        {
            let (cache, _) = open(&tmp, no_sweeper()).await;
            cache.set("a", &json!("x"), None, None).await;
            cache.set("b", &json!("yy"), None, None).await;
            cache.destroy().await;
        }
        // Metadata claims nothing; disk has two entries.
        std::fs::write(tmp.path().join("metadata.json"), b"{}").unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        let meta = cache.stats().metadata;
        assert_eq!(meta.total_entries, 2);
        assert_eq!(meta.total_size_bytes, 3 + 4);
        assert_eq!(cache.get("b", None).await, Some(json!("yy")));
    }

    #[tokio::test]
    async fn test_unusable_directory_degrades() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file-not-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let config = CacheConfig {
            settings: no_sweeper(),
            ..CacheConfig::in_dir(&blocker)
        };
        let cache: ResponseCache<Value> = ResponseCache::open(config).await.unwrap();
        cache.set("k", &json!(1), None, None).await;
        assert!(cache.get("k", None).await.is_none());
        assert!(!cache.delete("k").await);
        cache.clear().await;
        let _ = cache.cleanup().await;
        cache.destroy().await;
    }

    #[tokio::test]
    async fn test_update_settings_rejects_invalid() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        let err = cache
            .update_settings(SettingsUpdate {
                max_cache_size_bytes: Some(0),
                ..Default::default()
            })
            .await;
        assert!(err.is_err());
        assert_eq!(
            cache.settings().max_cache_size_bytes,
            CacheSettings::default().max_cache_size_bytes
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settings_updates_both_apply() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        for round in 1..=20u64 {
            let (a, b) = (cache.clone(), cache.clone());
            let ttl = tokio::spawn(async move {
                a.update_settings(SettingsUpdate {
                    default_ttl_ms: Some(1_000 + round),
                    ..Default::default()
                })
                .await
            });
            let budget = tokio::spawn(async move {
                b.update_settings(SettingsUpdate {
                    max_cache_size_bytes: Some(1_000_000 + round),
                    ..Default::default()
                })
                .await
            });
            ttl.await.unwrap().unwrap();
            budget.await.unwrap().unwrap();
            let s = cache.settings();
            assert_eq!(s.default_ttl_ms, 1_000 + round);
            assert_eq!(s.max_cache_size_bytes, 1_000_000 + round);
        }
    }

    #[tokio::test]
    async fn test_unchanged_interval_keeps_sweeper() {
        let tmp = TempDir::new().unwrap();
        let settings = CacheSettings {
            cleanup_interval_ms: 50,
            ..Default::default()
        };
        let (cache, _) = open(&tmp, settings).await;
        cache
            .update_settings(SettingsUpdate {
                default_ttl_ms: Some(5_000),
                ..Default::default()
            })
            .await
            .unwrap();
        cache.restart_sweeper().await;
        {
            let slot = cache.inner.sweeper.lock().await;
            assert_eq!(slot.as_ref().map(|s| s.interval()), Some(Duration::from_millis(50)));
        }
        cache
            .update_settings(SettingsUpdate {
                cleanup_interval_ms: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(cache.inner.sweeper.lock().await.is_none());
        cache.destroy().await;
    }

    #[tokio::test]
    async fn test_headerless_corruption_is_recounted_by_sweep() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        cache.set("keep", &json!("ok"), None, None).await;
        cache.set("lost", &json!("broken"), None, None).await;
        let fp = cache.fingerprint("lost", None);
        std::fs::write(cache.entry_path(&fp), b"no header here").unwrap();

        assert!(cache.get("lost", None).await.is_none());
        let meta = cache.stats().metadata;
        assert_eq!(meta.total_entries, 1);
        // `"ok"` plus the unknown size of the removed record.
        assert_eq!(meta.total_size_bytes, 4 + 8);

        cache.cleanup().await;
        assert_eq!(cache.stats().metadata.total_size_bytes, 4);
    }

    #[tokio::test]
    async fn test_update_settings_restarts_sweeper() {
        let tmp = TempDir::new().unwrap();
        let (cache, clock) = open(&tmp, no_sweeper()).await;
        assert!(cache.inner.sweeper.lock().await.is_none());

        cache
            .set("old", &json!(1), None, Some(Duration::from_millis(5)))
            .await;
        clock.advance(10);
        cache
            .update_settings(SettingsUpdate {
                cleanup_interval_ms: Some(20),
                ..Default::default()
            })
            .await
            .unwrap();
        {
            let slot = cache.inner.sweeper.lock().await;
            assert_eq!(slot.as_ref().map(|s| s.interval()), Some(Duration::from_millis(20)));
        }

        let fp = cache.fingerprint("old", None);
        let path = cache.entry_path(&fp);
        let deadline = Instant::now() + Duration::from_secs(2);
        while path.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists(), "background sweep should remove the expired entry");
        assert!(cache.stats().metadata.last_cleanup_at.is_some());
        cache.destroy().await;
        assert!(cache.inner.sweeper.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_flushes_stats() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        let _ = cache.get("missing", None).await;
        cache.destroy().await;
        let data = std::fs::read_to_string(tmp.path().join("stats.json")).unwrap();
        let stats: crate::cache::CacheStats = serde_json::from_str(&data).unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let tmp = TempDir::new().unwrap();
        let (cache, _) = open(&tmp, no_sweeper()).await;
        let _ = cache.get("missing", None).await;
        cache.reset_stats().await;
        assert_eq!(cache.stats().total_requests, 0);
    }
}
