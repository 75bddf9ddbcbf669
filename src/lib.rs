//! ZeptoCache: a persistent, context-aware response cache.
//!
//! Responses are stored on disk under a fingerprint of the request key and
//! the parts of the caller's context that change the answer (project type,
//! skill level, file extension, language). Entries expire after a TTL, the
//! store stays under a byte budget by evicting least recently used entries,
//! and a background sweeper removes expired and corrupt files.
//!
//! ```no_run
//! use zeptocache::{CacheConfig, CacheContext, ResponseCache};
//!
//! # async fn demo() -> zeptocache::Result<()> {
//! let cache: ResponseCache<String> = ResponseCache::open(CacheConfig::in_dir("/tmp/cache")).await?;
//! let ctx = CacheContext::new().with_project_type("web");
//! cache.set("explain closures", &"...".to_string(), Some(&ctx), None).await;
//! let hit = cache.get("explain closures", Some(&ctx)).await;
//! # let _ = hit;
//! cache.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{
    prompt_key, CacheContext, CacheMetadata, CacheReport, CacheStats, Clock, JsonCodec,
    KeyDeriver, ManualClock, PayloadCodec, ResponseCache, SanitizedContext, SweepReport,
    SystemClock,
};
pub use config::{CacheConfig, CacheSettings, ContextConfig, SettingsUpdate, SettingsWatcher};
pub use error::{CacheError, Result};
