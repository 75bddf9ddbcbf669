//! Per-fingerprint async locks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes operations that touch the same fingerprint.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    map: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub(crate) async fn lock(&self, fingerprint: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .map
            .entry(fingerprint.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }

    /// Drop locks nobody holds or waits on.
    pub(crate) fn prune(&self) {
        self.map.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
