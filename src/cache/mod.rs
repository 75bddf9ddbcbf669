//! Context-aware response caching with TTL expiry, LRU eviction, and
//! one-file-per-entry persistence.

pub mod clock;
pub mod codec;
pub mod eviction;
pub mod key;
mod lock;
mod persist;
pub mod response_cache;
pub mod stats;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{JsonCodec, PayloadCodec};
pub use eviction::SweepReport;
pub use key::{prompt_key, CacheContext, KeyDeriver, SanitizedContext};
pub use response_cache::ResponseCache;
pub use stats::{CacheMetadata, CacheReport, CacheStats};

/// First 8 chars of a fingerprint, for log lines.
pub(crate) fn short(fingerprint: &str) -> &str {
    fingerprint.get(..8).unwrap_or(fingerprint)
}
