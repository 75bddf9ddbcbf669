//! Aggregate counters and metadata for one cache instance.
//!
//! Every mutation goes through [`StatsTracker`]'s single mutex. Persistence
//! is best-effort: a failed write is logged and the in-memory counters stay
//! authoritative for the rest of the process lifetime.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::persist::{timed, write_atomic};
use crate::config::{CacheSettings, SettingsUpdate};
use crate::error::{CacheError, Result};

pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const STATS_FILE_NAME: &str = "stats.json";

/// Request counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
    /// Running mean over `total_requests`.
    pub average_response_time_ms: f64,
}

/// Totals and settings describing the stored entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheMetadata {
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    /// Milliseconds since the Unix epoch of the last completed sweep.
    pub last_cleanup_at: Option<u64>,
    pub settings: CacheSettings,
}

/// Read-only snapshot returned by `ResponseCache::stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReport {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
    pub average_response_time_ms: f64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Default)]
struct TrackerState {
    stats: CacheStats,
    metadata: CacheMetadata,
    /// Bumped on every change to the entry totals.
    generation: u64,
}

impl TrackerState {
    fn record_request(&mut self, latency_ms: f64) {
        let stats = &mut self.stats;
        stats.total_requests += 1;
        let n = stats.total_requests as f64;
        stats.average_response_time_ms += (latency_ms - stats.average_response_time_ms) / n;
        self.recompute_rates();
    }

    fn recompute_rates(&mut self) {
        let total = self.stats.total_requests;
        if total == 0 {
            self.metadata.hit_rate = 0.0;
            self.metadata.miss_rate = 0.0;
        } else {
            self.metadata.hit_rate = self.stats.hits as f64 / total as f64;
            self.metadata.miss_rate = self.stats.misses as f64 / total as f64;
        }
    }
}

/// Owner of a cache instance's counters.
#[derive(Debug)]
pub struct StatsTracker {
    state: Mutex<TrackerState>,
    dir: PathBuf,
    io_timeout: Duration,
}

impl StatsTracker {
    /// Load persisted records from `dir`, falling back to defaults for any
    /// that are missing or unreadable.
    ///
    /// `settings` replaces whatever settings were persisted. The copy in
    /// `metadata.json` is a record of what was in force, not a source:
    /// changes made through `update_settings` last until the process exits
    /// unless the caller also writes them to the config file.
    pub async fn load(dir: &Path, io_timeout: Duration, settings: CacheSettings) -> Self {
        let stats: CacheStats = load_record(&dir.join(STATS_FILE_NAME), io_timeout).await;
        let mut metadata: CacheMetadata =
            load_record(&dir.join(METADATA_FILE_NAME), io_timeout).await;
        metadata.settings = settings;
        let mut state = TrackerState {
            stats,
            metadata,
            generation: 0,
        };
        state.recompute_rates();
        Self {
            state: Mutex::new(state),
            dir: dir.to_path_buf(),
            io_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_hit(&self, latency_ms: f64) {
        let mut state = self.state();
        state.stats.hits += 1;
        state.record_request(latency_ms);
    }

    pub fn record_miss(&self, latency_ms: f64) {
        let mut state = self.state();
        state.stats.misses += 1;
        state.record_request(latency_ms);
    }

    pub fn record_eviction(&self) {
        self.state().stats.evictions += 1;
    }

    /// Account for a write. `previous` is the size of the entry it replaced.
    pub fn entry_stored(&self, previous: Option<u64>, size_bytes: u64) {
        let mut state = self.state();
        state.generation += 1;
        let meta = &mut state.metadata;
        match previous {
            Some(old) => {
                meta.total_size_bytes = meta.total_size_bytes.saturating_sub(old);
            }
            None => meta.total_entries += 1,
        }
        meta.total_size_bytes = meta.total_size_bytes.saturating_add(size_bytes);
    }

    /// Account for a removal. `None` when the size is unknown (corrupt
    /// header); the next full sweep re-derives the byte total.
    pub fn entry_removed(&self, size_bytes: Option<u64>) {
        let mut state = self.state();
        state.generation += 1;
        let meta = &mut state.metadata;
        meta.total_entries = meta.total_entries.saturating_sub(1);
        if let Some(size) = size_bytes {
            meta.total_size_bytes = meta.total_size_bytes.saturating_sub(size);
        }
    }

    /// Overwrite the totals with values counted from disk.
    pub fn set_totals(&self, total_entries: u64, total_size_bytes: u64) {
        let mut state = self.state();
        state.generation += 1;
        state.metadata.total_entries = total_entries;
        state.metadata.total_size_bytes = total_size_bytes;
    }

    /// Current totals generation.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Like [`set_totals`](Self::set_totals), but only if the totals are
    /// still at generation `expected`. Returns whether they were replaced.
    pub fn set_totals_if_generation(
        &self,
        expected: u64,
        total_entries: u64,
        total_size_bytes: u64,
    ) -> bool {
        let mut state = self.state();
        if state.generation != expected {
            return false;
        }
        state.generation += 1;
        state.metadata.total_entries = total_entries;
        state.metadata.total_size_bytes = total_size_bytes;
        true
    }

    pub fn mark_cleanup(&self, now_ms: u64) {
        self.state().metadata.last_cleanup_at = Some(now_ms);
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.state().metadata.total_size_bytes
    }

    pub fn settings(&self) -> CacheSettings {
        self.state().metadata.settings.clone()
    }

    /// Merge `update` into the current settings under the tracker lock.
    /// Returns `(previous, merged)`; invalid results leave the settings
    /// untouched.
    pub fn merge_settings(&self, update: &SettingsUpdate) -> Result<(CacheSettings, CacheSettings)> {
        let mut state = self.state();
        let previous = state.metadata.settings.clone();
        let merged = previous.merged(update);
        merged.validate()?;
        state.metadata.settings = merged.clone();
        Ok((previous, merged))
    }

    pub fn snapshot(&self) -> CacheReport {
        let state = self.state();
        CacheReport {
            hits: state.stats.hits,
            misses: state.stats.misses,
            evictions: state.stats.evictions,
            total_requests: state.stats.total_requests,
            average_response_time_ms: state.stats.average_response_time_ms,
            hit_rate: state.metadata.hit_rate,
            miss_rate: state.metadata.miss_rate,
            metadata: state.metadata.clone(),
        }
    }

    /// Zero the request counters. Totals and settings are untouched.
    pub fn reset_counters(&self) {
        let mut state = self.state();
        state.stats = CacheStats::default();
        state.recompute_rates();
    }

    pub async fn persist_metadata(&self) {
        let metadata = self.state().metadata.clone();
        self.write_record(METADATA_FILE_NAME, &metadata).await;
    }

    pub async fn persist_stats(&self) {
        let stats = self.state().stats.clone();
        self.write_record(STATS_FILE_NAME, &stats).await;
    }

    /// Flush both records.
    pub async fn persist(&self) {
        self.persist_metadata().await;
        self.persist_stats().await;
    }

    async fn write_record<T: Serialize>(&self, name: &str, record: &T) {
        let path = self.dir.join(name);
        let bytes = match serde_json::to_vec_pretty(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(record = name, error = %e, "Failed to serialize cache record");
                return;
            }
        };
        if let Err(e) = write_atomic(path.clone(), bytes, self.io_timeout).await {
            warn!(path = %path.display(), error = %e, "Failed to persist cache record");
        }
    }
}

async fn load_record<T: DeserializeOwned + Default>(path: &Path, limit: Duration) -> T {
    let data = match timed(limit, tokio::fs::read(path)).await {
        Ok(data) => data,
        Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read cache record, using defaults");
            return T::default();
        }
    };
    match serde_json::from_slice(&data) {
        Ok(record) => record,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cache record is corrupt, using defaults");
            T::default()
        }
    }
}
