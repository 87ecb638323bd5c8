//! Per-context batch assembly with a sealed-batch queue.

use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Batch, BatchConfig, BatchHandle};
use crate::query::{NormalizedQuery, QueryId};

/// Groups admitted queries into batches keyed by context.
///
/// `add` only takes the DashMap shard lock for the query's context. Sealed
/// batches wait in a FIFO ready queue until the dispatcher drains them.
pub struct BatchAssembler {
    open: DashMap<String, Batch>,
    ready: Mutex<VecDeque<Batch>>,
    config: RwLock<BatchConfig>,
    notify: Notify,
}

impl BatchAssembler {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            open: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            config: RwLock::new(config),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> BatchConfig {
        *self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies to batches opened from now on.
    pub fn set_config(&self, config: BatchConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        tracing::info!(
            max_size = config.max_size,
            max_wait = ?config.max_wait,
            "Batch config updated"
        );
    }

    pub fn add(&self, query: NormalizedQuery) -> BatchHandle {
        let key = query.context_key().to_string();
        let handle = match self.open.entry(key) {
            Entry::Occupied(mut slot) => {
                let batch = slot.get_mut();
                let batch_id = batch.id();
                let position = batch.insert(query);
                let sealed = batch.is_full();
                if sealed {
                    self.push_ready(slot.remove());
                }
                BatchHandle {
                    batch_id,
                    position,
                    sealed,
                }
            }
            Entry::Vacant(slot) => {
                let mut batch = Batch::new(slot.key().clone(), self.config());
                let batch_id = batch.id();
                let position = batch.insert(query);
                let sealed = batch.is_full();
                if sealed {
                    self.push_ready(batch);
                } else {
                    slot.insert(batch);
                    // A new deadline exists; let the dispatcher re-arm its timer.
                    self.notify.notify_one();
                }
                BatchHandle {
                    batch_id,
                    position,
                    sealed,
                }
            }
        };

        tracing::debug!(
            batch_id = %handle.batch_id,
            position = handle.position,
            sealed = handle.sealed,
            "Query batched"
        );
        handle
    }

    fn push_ready(&self, batch: Batch) {
        tracing::debug!(
            batch_id = %batch.id(),
            context_key = batch.context_key(),
            size = batch.len(),
            "Batch sealed"
        );
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(batch);
        self.notify.notify_one();
    }

    /// Seal every open batch whose deadline has passed.
    pub fn seal_due(&self, now: Instant) -> usize {
        let due: Vec<String> = self
            .open
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut sealed = 0;
        for key in due {
            if let Some((_, batch)) = self.open.remove_if(&key, |_, b| b.is_due(now)) {
                self.push_ready(batch);
                sealed += 1;
            }
        }
        sealed
    }

    /// Sealed batches ready for dispatch, oldest first. Due batches are sealed first.
    pub fn drain_ready(&self) -> Vec<Batch> {
        self.seal_due(Instant::now());
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// Seal and return everything, due or not.
    pub fn drain_all(&self) -> Vec<Batch> {
        let keys: Vec<String> = self.open.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, batch)) = self.open.remove(&key) {
                self.push_ready(batch);
            }
        }
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// Earliest deadline among open batches.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open.iter().map(|e| e.value().deadline()).min()
    }

    pub fn has_ready(&self) -> bool {
        !self
            .ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Resolves when a batch is sealed or a new deadline appears.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Remove a not-yet-dispatched query. Emptied batches are dropped.
    pub fn cancel(&self, context_key: &str, query_id: QueryId) -> Option<NormalizedQuery> {
        if let Some(mut batch) = self.open.get_mut(context_key)
            && let Some(query) = batch.remove(query_id)
        {
            drop(batch);
            self.open.remove_if(context_key, |_, b| b.is_empty());
            return Some(query);
        }

        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        let removed = ready
            .iter_mut()
            .filter(|b| b.context_key() == context_key)
            .find_map(|b| b.remove(query_id));
        ready.retain(|b| !b.is_empty());
        removed
    }

    /// Queries waiting in open or sealed batches.
    pub fn pending(&self) -> usize {
        let open: usize = self.open.iter().map(|e| e.value().len()).sum();
        let ready: usize = self
            .ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(Batch::len)
            .sum();
        open + ready
    }

    pub fn open_batches(&self) -> usize {
        self.open.len()
    }
}

impl Default for BatchAssembler {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}

impl std::fmt::Debug for BatchAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAssembler")
            .field("config", &self.config())
            .field("open_batches", &self.open_batches())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::query::Priority;

    fn query(text: &str, context: &str) -> NormalizedQuery {
        NormalizedQuery::new(text, context, "caller").unwrap()
    }

    fn assembler(max_size: usize, max_wait_ms: u64) -> BatchAssembler {
        BatchAssembler::new(BatchConfig {
            max_size,
            max_wait: Duration::from_millis(max_wait_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_seals_immediately() {
        let asm = assembler(3, 10_000);
        let first = asm.add(query("one", "support"));
        asm.add(query("two", "support"));
        let third = asm.add(query("three", "support"));

        assert!(!first.sealed);
        assert!(third.sealed);
        assert_eq!(first.batch_id, third.batch_id);

        let ready = asm.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].len(), 3);
        assert_eq!(asm.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contexts_are_separate() {
        let asm = assembler(2, 10_000);
        let a = asm.add(query("one", "support"));
        let b = asm.add(query("one", "billing"));
        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(asm.open_batches(), 2);
        assert!(asm.drain_ready().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_seals() {
        let asm = assembler(10, 200);
        asm.add(query("one", "support"));
        let deadline = asm.next_deadline().unwrap();
        assert_eq!(deadline, Instant::now() + Duration::from_millis(200));

        tokio::time::advance(Duration::from_millis(199)).await;
        assert!(asm.drain_ready().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        let ready = asm.drain_ready();
        assert_eq!(ready.len(), 1);
        assert!(asm.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_keeps_open_batch_sizing() {
        let asm = assembler(3, 10_000);
        asm.add(query("one", "support"));
        asm.set_config(BatchConfig {
            max_size: 1,
            max_wait: Duration::from_secs(10),
        });
        let second = asm.add(query("two", "support"));
        assert!(!second.sealed);

        let other = asm.add(query("three", "billing"));
        assert!(other.sealed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let asm = assembler(3, 10_000);
        let q = query("one", "support");
        let id = q.id();
        asm.add(q);
        assert!(asm.cancel("support", id).is_some());
        assert_eq!(asm.open_batches(), 0);
        assert!(asm.cancel("support", id).is_none());

        let asm = assembler(2, 10_000);
        let q = query("one", "support").with_priority(Priority::High);
        let id = q.id();
        asm.add(q);
        asm.add(query("two", "support"));
        assert!(asm.cancel("support", id).is_some());
        let ready = asm.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].items()[0].raw_text(), "two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_all() {
        let asm = assembler(5, 10_000);
        asm.add(query("one", "support"));
        asm.add(query("two", "billing"));
        assert_eq!(asm.drain_all().len(), 2);
        assert_eq!(asm.pending(), 0);
    }
}
