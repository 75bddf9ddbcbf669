//! Persisted entry format and the pluggable payload codec.
//!
//! An entry file is one line of compact JSON ([`EntryHeader`]) followed by
//! the raw payload bytes. The header carries the payload length and its
//! SHA-256, so truncated or bit-flipped files are detected on read. When the
//! header itself is intact, its `size_bytes` is still reported for a corrupt
//! payload so budget accounting can be corrected.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::key::SanitizedContext;
use crate::error::{CacheError, Result};

/// On-disk format version. Bump when the header layout changes.
pub const ENTRY_FORMAT_VERSION: u32 = 1;

/// Turns caller payloads into bytes and back.
pub trait PayloadCodec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Default codec: `serde_json`.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> PayloadCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

/// Everything about an entry except the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub version: u32,
    pub fingerprint: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub ttl_ms: u64,
    pub context: SanitizedContext,
    pub access_count: u64,
    pub last_accessed_at: u64,
    pub size_bytes: u64,
    /// Hex SHA-256 of the payload bytes.
    pub checksum: String,
}

/// A cache entry as held between reading and writing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub header: EntryHeader,
    pub payload: Vec<u8>,
}

impl StoredEntry {
    /// Fresh entry: created and last accessed at `now_ms`, one access.
    pub fn new(
        fingerprint: String,
        payload: Vec<u8>,
        context: SanitizedContext,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Self {
        let header = EntryHeader {
            version: ENTRY_FORMAT_VERSION,
            fingerprint,
            created_at: now_ms,
            ttl_ms,
            context,
            access_count: 1,
            last_accessed_at: now_ms,
            size_bytes: payload.len() as u64,
            checksum: checksum(&payload),
        };
        Self { header, payload }
    }

    pub fn fingerprint(&self) -> &str {
        &self.header.fingerprint
    }

    pub fn size_bytes(&self) -> u64 {
        self.header.size_bytes
    }

    /// Strictly older than its TTL.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.header.is_expired(now_ms)
    }

    /// Record a hit.
    pub fn touch(&mut self, now_ms: u64) {
        self.header.access_count = self.header.access_count.saturating_add(1);
        self.header.last_accessed_at = now_ms;
    }
}

impl EntryHeader {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) > self.ttl_ms
    }
}

/// Why a persisted record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    pub reason: String,
    /// Payload size from an intact header, if there was one.
    pub size_hint: Option<u64>,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl From<Corruption> for CacheError {
    fn from(c: Corruption) -> Self {
        CacheError::Corrupt(c.reason)
    }
}

/// Header line, newline, payload.
pub fn encode_entry(entry: &StoredEntry) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(&entry.header)?;
    out.push(b'\n');
    out.extend_from_slice(&entry.payload);
    Ok(out)
}

/// Parse and verify an entry file.
pub fn decode_entry(bytes: &[u8]) -> std::result::Result<StoredEntry, Corruption> {
    let Some(split) = bytes.iter().position(|b| *b == b'\n') else {
        return Err(corrupt("missing header terminator", None));
    };
    let header: EntryHeader = serde_json::from_slice(&bytes[..split])
        .map_err(|e| corrupt(format!("unreadable header: {e}"), None))?;
    let hint = Some(header.size_bytes);
    if header.version != ENTRY_FORMAT_VERSION {
        return Err(corrupt(
            format!("unsupported entry version {}", header.version),
            hint,
        ));
    }
    let payload = &bytes[split + 1..];
    if payload.len() as u64 != header.size_bytes {
        return Err(corrupt(
            format!(
                "payload length {} does not match header size {}",
                payload.len(),
                header.size_bytes
            ),
            hint,
        ));
    }
    if checksum(payload) != header.checksum {
        return Err(corrupt("payload checksum mismatch", hint));
    }
    Ok(StoredEntry {
        header,
        payload: payload.to_vec(),
    })
}

fn checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

fn corrupt(reason: impl Into<String>, size_hint: Option<u64>) -> Corruption {
    Corruption {
        reason: reason.into(),
        size_hint,
    }
}
