//! One-file-per-entry persistent store.
//!
//! Layout: `<entries dir>/<fp[0..2]>/<fp>.entry`. Two-character shards keep
//! directory sizes flat. The store knows nothing about budgets or stats;
//! callers update the tracker after each mutation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use tracing::{debug, warn};

use super::codec::{decode_entry, encode_entry, Corruption, StoredEntry};
use super::persist::{timed, write_atomic, TEMP_PREFIX};
use super::short;
use crate::error::{CacheError, Result};

const ENTRY_EXTENSION: &str = "entry";

/// Result of reading one fingerprint.
#[derive(Debug)]
pub enum ReadOutcome {
    Found(StoredEntry),
    NotFound,
    /// The file exists but does not decode.
    Corrupt(Corruption),
}

/// Persistent entry directory.
#[derive(Debug, Clone)]
pub struct EntryStore {
    root: PathBuf,
    io_timeout: Duration,
}

impl EntryStore {
    pub fn new(root: PathBuf, io_timeout: Duration) -> Self {
        Self { root, io_timeout }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `fingerprint`.
    pub fn entry_path(&self, fingerprint: &str) -> PathBuf {
        let shard = fingerprint.get(..2).unwrap_or("__");
        self.root
            .join(shard)
            .join(format!("{fingerprint}.{ENTRY_EXTENSION}"))
    }

    /// Persist `entry`, replacing whatever is stored at its fingerprint.
    pub async fn write(&self, entry: &StoredEntry) -> Result<()> {
        let bytes = encode_entry(entry)?;
        write_atomic(self.entry_path(entry.fingerprint()), bytes, self.io_timeout).await
    }

    pub async fn read(&self, fingerprint: &str) -> Result<ReadOutcome> {
        let path = self.entry_path(fingerprint);
        let bytes = match timed(self.io_timeout, tokio::fs::read(&path)).await {
            Ok(bytes) => bytes,
            Err(CacheError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Ok(ReadOutcome::NotFound)
            }
            Err(e) => return Err(e),
        };
        match decode_entry(&bytes) {
            Ok(entry) if entry.fingerprint() == fingerprint => Ok(ReadOutcome::Found(entry)),
            Ok(entry) => Ok(ReadOutcome::Corrupt(Corruption {
                reason: format!(
                    "header fingerprint {} does not match file name",
                    short(entry.fingerprint())
                ),
                size_hint: Some(entry.size_bytes()),
            })),
            Err(corruption) => Ok(ReadOutcome::Corrupt(corruption)),
        }
    }

    /// Remove the entry. Returns whether a file was actually removed.
    pub async fn delete(&self, fingerprint: &str) -> Result<bool> {
        let path = self.entry_path(fingerprint);
        match timed(self.io_timeout, tokio::fs::remove_file(&path)).await {
            Ok(()) => Ok(true),
            Err(CacheError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop every entry file.
    pub async fn clear(&self) -> Result<()> {
        match timed(self.io_timeout, tokio::fs::remove_dir_all(&self.root)).await {
            Ok(()) => {}
            Err(CacheError::Io(e)) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        timed(self.io_timeout, tokio::fs::create_dir_all(&self.root)).await
    }

    /// Delete temp files left behind by writes interrupted mid-flight.
    pub async fn remove_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for shard in list_dir(&self.root, self.io_timeout, true).await? {
            for file in list_dir(&shard, self.io_timeout, false).await? {
                let is_temp = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TEMP_PREFIX));
                if is_temp && timed(self.io_timeout, tokio::fs::remove_file(&file)).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "Removed stale cache temp files");
        }
        Ok(removed)
    }

    /// Start a fresh pass over all stored entries.
    pub fn scan(&self) -> EntryScan {
        EntryScan {
            store: self.clone(),
            shards: None,
            files: Vec::new(),
        }
    }
}

/// One item yielded by [`EntryScan`].
#[derive(Debug)]
pub struct ScannedEntry {
    pub fingerprint: String,
    pub entry: std::result::Result<StoredEntry, Corruption>,
}

/// Lazy pass over the store, one shard directory at a time.
///
/// Files deleted between listing and reading are skipped; so are files that
/// fail to read for other reasons (logged). Each call to
/// [`EntryStore::scan`] starts over.
pub struct EntryScan {
    store: EntryStore,
    shards: Option<Vec<PathBuf>>,
    files: Vec<PathBuf>,
}

impl EntryScan {
    pub async fn next(&mut self) -> Option<ScannedEntry> {
        loop {
            while let Some(path) = self.files.pop() {
                let Some(fingerprint) = fingerprint_of(&path) else {
                    continue;
                };
                match self.store.read(&fingerprint).await {
                    Ok(ReadOutcome::Found(entry)) => {
                        return Some(ScannedEntry {
                            fingerprint,
                            entry: Ok(entry),
                        })
                    }
                    Ok(ReadOutcome::Corrupt(corruption)) => {
                        return Some(ScannedEntry {
                            fingerprint,
                            entry: Err(corruption),
                        })
                    }
                    Ok(ReadOutcome::NotFound) => {}
                    Err(e) => {
                        warn!(fingerprint = %short(&fingerprint), error = %e, "Skipping unreadable cache entry");
                    }
                }
            }

            if self.shards.is_none() {
                let shards = list_dir(&self.store.root, self.store.io_timeout, true)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Failed to list cache directory");
                        Vec::new()
                    });
                self.shards = Some(shards);
            }
            let shard = self.shards.as_mut()?.pop()?;
            self.files = list_dir(&shard, self.store.io_timeout, false)
                .await
                .unwrap_or_default();
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = ScannedEntry> {
        futures::stream::unfold(self, |mut scan| async move {
            scan.next().await.map(|item| (item, scan))
        })
    }
}

/// Fingerprint from `<fp>.entry`; anything else is not an entry file.
fn fingerprint_of(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.starts_with(TEMP_PREFIX))
        .map(str::to_string)
}

/// Children of `dir`: sub-directories when `dirs` is set, files otherwise.
/// A missing directory lists as empty.
async fn list_dir(dir: &Path, limit: Duration, dirs: bool) -> Result<Vec<PathBuf>> {
    let mut reader = match timed(limit, tokio::fs::read_dir(dir)).await {
        Ok(reader) => reader,
        Err(CacheError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    while let Some(entry) = timed(limit, reader.next_entry()).await? {
        let Ok(file_type) = timed(limit, entry.file_type()).await else {
            continue;
        };
        if file_type.is_dir() == dirs {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}
