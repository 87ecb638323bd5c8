use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::budget::{from_micros, to_micros};
use crate::query::Fingerprint;

/// Default bound on live entries.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// A cached upstream result.
#[derive(Clone, Debug)]
pub struct DeduplicationEntry<R> {
    pub fingerprint: Fingerprint,
    pub result: R,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
    /// What the upstream call that produced `result` cost.
    pub source_cost: Decimal,
}

impl<R> DeduplicationEntry<R> {
    fn new(fingerprint: Fingerprint, result: R, ttl: Duration, source_cost: Decimal) -> Self {
        let created_at = Instant::now();
        Self {
            fingerprint,
            result,
            created_at,
            expires_at: created_at + ttl,
            hit_count: 0,
            source_cost,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub entries: usize,
    /// Upstream spend avoided by serving hits.
    pub cost_saved: Decimal,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    /// Every hit is a response served without an upstream call.
    pub fn zero_cost_responses(&self) -> u64 {
        self.hits
    }
}

/// Concurrent fingerprint → result map with per-entry TTL.
///
/// Operations on one fingerprint are linearizable: DashMap holds the shard
/// lock for the duration of each lookup or store.
pub struct DeduplicationCache<R> {
    entries: DashMap<Fingerprint, DeduplicationEntry<R>>,
    max_entries: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    cost_saved_micros: AtomicU64,
}

impl<R: Clone> DeduplicationCache<R> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: AtomicUsize::new(max_entries.max(1)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            cost_saved_micros: AtomicU64::new(0),
        }
    }

    /// Return a live result, counting a hit. Expired entries are removed and
    /// reported as a miss.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<R> {
        let now = Instant::now();

        if let Some(mut entry) = self.entries.get_mut(fingerprint) {
            if !entry.is_expired(now) {
                entry.hit_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.cost_saved_micros
                    .fetch_add(to_micros(entry.source_cost), Ordering::Relaxed);
                return Some(entry.result.clone());
            }
            drop(entry);
            if self
                .entries
                .remove_if(fingerprint, |_, e| e.is_expired(now))
                .is_some()
            {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(fingerprint = fingerprint.short(), "Expired cache entry removed");
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether a live entry exists. Does not touch statistics.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        self.entries
            .get(fingerprint)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Snapshot of a live entry. Does not touch statistics.
    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<DeduplicationEntry<R>> {
        let now = Instant::now();
        self.entries
            .get(fingerprint)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value().clone())
    }

    /// Store a result. Overwrites any previous entry (last writer wins).
    pub fn store(&self, fingerprint: Fingerprint, result: R, ttl: Duration) {
        self.store_with_cost(fingerprint, result, ttl, Decimal::ZERO);
    }

    /// Store a result together with what it cost to produce.
    pub fn store_with_cost(
        &self,
        fingerprint: Fingerprint,
        result: R,
        ttl: Duration,
        source_cost: Decimal,
    ) {
        if !self.entries.contains_key(&fingerprint) {
            self.make_room();
        }
        let entry = DeduplicationEntry::new(fingerprint.clone(), result, ttl, source_cost);
        self.entries.insert(fingerprint, entry);
    }

    /// Count a hit served outside [`lookup`](Self::lookup), e.g. a duplicate
    /// that joined an in-flight query and shares its result.
    pub fn record_shared_hit(&self, fingerprint: &Fingerprint, source_cost: Decimal) {
        if let Some(mut entry) = self.entries.get_mut(fingerprint) {
            entry.hit_count += 1;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.cost_saved_micros
            .fetch_add(to_micros(source_cost), Ordering::Relaxed);
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<DeduplicationEntry<R>> {
        self.entries.remove(fingerprint).map(|(_, e)| e)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    fn make_room(&self) {
        let max = self.max_entries.load(Ordering::Relaxed);
        if self.entries.len() < max {
            return;
        }

        self.purge_expired();

        while self.entries.len() >= max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.created_at)
                .map(|e| e.key().clone());
            let Some(key) = oldest else { break };
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn set_max_entries(&self, max_entries: usize) {
        self.max_entries.store(max_entries.max(1), Ordering::Relaxed);
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
            cost_saved: from_micros(self.cost_saved_micros.load(Ordering::Relaxed)),
        }
    }
}

impl<R: Clone> Default for DeduplicationCache<R> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl<R> std::fmt::Debug for DeduplicationCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationCache")
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries.load(Ordering::Relaxed))
            .finish()
    }
}
