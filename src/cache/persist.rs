//! Bounded, crash-safe filesystem helpers.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Prefix of in-flight temp files. Anything carrying it after a crash is
/// garbage and is removed when the cache opens.
pub(crate) const TEMP_PREFIX: &str = ".tmp-";

/// Run an I/O future with an upper bound on its duration.
pub(crate) async fn timed<F, T>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(CacheError::from),
        Err(_) => Err(CacheError::Timeout(limit)),
    }
}

/// Write `bytes` to `path` via a same-directory temp file and rename, so
/// readers see either the old contents or the new, never a partial file.
pub(crate) async fn write_atomic(path: PathBuf, bytes: Vec<u8>, limit: Duration) -> Result<()> {
    let task = tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes));
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(res)) => res,
        Ok(Err(join)) => Err(CacheError::Io(std::io::Error::other(join))),
        Err(_) => Err(CacheError::Timeout(limit)),
    }
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        CacheError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        ))
    })?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
    Ok(())
}
