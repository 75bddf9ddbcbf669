//! Victim selection and the background expiry sweeper.
//!
//! Selection is pure: given entry summaries and a budget it returns what to
//! delete. The façade performs the deletions through its per-fingerprint
//! locks, both from `set` (LRU) and from the sweeper (expiry).

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::codec::EntryHeader;

/// The parts of an entry eviction decisions need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub fingerprint: String,
    pub size_bytes: u64,
    pub created_at: u64,
    pub ttl_ms: u64,
    pub last_accessed_at: u64,
}

impl From<&EntryHeader> for EntrySummary {
    fn from(header: &EntryHeader) -> Self {
        Self {
            fingerprint: header.fingerprint.clone(),
            size_bytes: header.size_bytes,
            created_at: header.created_at,
            ttl_ms: header.ttl_ms,
            last_accessed_at: header.last_accessed_at,
        }
    }
}

/// Least recently used entries whose sizes add up to at least
/// `bytes_needed`, oldest first. Ties on `last_accessed_at` fall back to
/// fingerprint order. Returns everything when the whole store is not enough.
pub fn select_lru_victims(entries: &[EntrySummary], bytes_needed: u64) -> Vec<EntrySummary> {
    if bytes_needed == 0 {
        return Vec::new();
    }
    let mut ordered: Vec<&EntrySummary> = entries.iter().collect();
    ordered.sort_by(|a, b| {
        a.last_accessed_at
            .cmp(&b.last_accessed_at)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for entry in ordered {
        if freed >= bytes_needed {
            break;
        }
        freed = freed.saturating_add(entry.size_bytes);
        victims.push(entry.clone());
    }
    victims
}

/// Entries strictly older than their TTL at `now_ms`.
pub fn select_expired(entries: &[EntrySummary], now_ms: u64) -> Vec<EntrySummary> {
    entries
        .iter()
        .filter(|e| now_ms.saturating_sub(e.created_at) > e.ttl_ms)
        .cloned()
        .collect()
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub inspected: u64,
    pub expired: u64,
    pub corrupt: u64,
    pub bytes_reclaimed: u64,
}

impl SweepReport {
    pub fn removed(&self) -> u64 {
        self.expired + self.corrupt
    }
}

/// Handle to the periodic sweep task.
#[derive(Debug)]
pub(crate) struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    interval: Duration,
}

impl SweeperHandle {
    /// Run `tick` every `interval` until stopped or until `tick` returns
    /// `None`. A zero interval spawns nothing.
    pub(crate) fn spawn<F, Fut>(interval: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() -> Option<Fut> + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            return None;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                match tick() {
                    Some(sweep) => sweep.await,
                    None => return,
                }
            }
        });
        debug!(interval_ms = interval.as_millis() as u64, "Cache sweeper started");
        Some(Self {
            cancel,
            task,
            interval,
        })
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Cancel and wait for an in-flight sweep to finish.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn summary(fp: &str, size: u64, last_accessed_at: u64) -> EntrySummary {
        EntrySummary {
            fingerprint: fp.to_string(),
            size_bytes: size,
            created_at: 0,
            ttl_ms: 1_000,
            last_accessed_at,
        }
    }

    fn fps(victims: &[EntrySummary]) -> Vec<&str> {
        victims.iter().map(|v| v.fingerprint.as_str()).collect()
    }

    #[test]
    fn test_lru_picks_oldest_until_enough() {
        let entries = vec![
            summary("b", 10, 200),
            summary("a", 10, 100),
            summary("c", 10, 300),
        ];
        assert_eq!(fps(&select_lru_victims(&entries, 10)), vec!["a"]);
        assert_eq!(fps(&select_lru_victims(&entries, 11)), vec!["a", "b"]);
    }

    #[test]
    fn test_lru_nothing_needed() {
        let entries = vec![summary("a", 10, 1)];
        assert!(select_lru_victims(&entries, 0).is_empty());
    }

    #[test]
    fn test_lru_exhausts_when_budget_unreachable() {
        let entries = vec![summary("a", 1, 1), summary("b", 1, 2)];
        assert_eq!(fps(&select_lru_victims(&entries, 1_000)), vec!["a", "b"]);
        assert!(select_lru_victims(&[], 5).is_empty());
    }

    #[test]
    fn test_lru_ties_break_on_fingerprint() {
        let entries = vec![summary("z", 5, 7), summary("m", 5, 7), summary("a", 5, 9)];
        assert_eq!(fps(&select_lru_victims(&entries, 5)), vec!["m"]);
    }

    #[test]
    fn test_select_expired() {
        let mut fresh = summary("fresh", 1, 0);
        fresh.created_at = 5_000;
        let mut edge = summary("edge", 1, 0);
        edge.created_at = 4_000; // exactly ttl old: not yet expired
        let old = summary("old", 1, 0);
        let expired = select_expired(&[fresh, edge, old], 5_000);
        assert_eq!(fps(&expired), vec!["old"]);
    }

    #[tokio::test]
    async fn test_sweeper_ticks_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = SweeperHandle::spawn(Duration::from_millis(10), move || {
            let c = c.clone();
            Some(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
        assert_eq!(handle.interval(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.stop().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several sweeps, saw {seen}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen, "no sweeps after stop");
    }

    #[tokio::test]
    async fn test_sweeper_zero_interval_disabled() {
        let handle = SweeperHandle::spawn(Duration::ZERO, || Some(async {}));
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_sweeper_exits_when_tick_declines() {
        let handle = SweeperHandle::spawn(Duration::from_millis(5), || None::<std::future::Ready<()>>)
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap();
    }
}
