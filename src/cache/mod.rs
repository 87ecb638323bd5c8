//! Fingerprint-keyed deduplication cache.
//!
//! Repeated queries are answered from here at zero upstream cost. Expired
//! entries are removed lazily when looked up; [`DeduplicationCache::purge_expired`]
//! exists only to bound memory and is driven by the runtime's sweep task.

mod dedup;

pub use dedup::{CacheStats, DEFAULT_MAX_ENTRIES, DeduplicationCache, DeduplicationEntry};
