//! Batch assembly.
//!
//! Pending queries are grouped per context key into bounded batches so that
//! one upstream call can share a system-level instruction. A batch is sealed
//! when it reaches `max_size` or when its oldest item has waited `max_wait`.

mod assembler;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::query::{NormalizedQuery, QueryId};

pub use assembler::BatchAssembler;

pub const DEFAULT_MAX_SIZE: usize = 8;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_size: usize,
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Where an admitted query landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchHandle {
    pub batch_id: BatchId,
    /// Index within the batch at insertion time.
    pub position: usize,
    /// The batch filled up and was sealed by this insertion.
    pub sealed: bool,
}

/// Queries sharing one context key, ordered by priority then arrival.
///
/// Sizing is fixed at creation; later config changes do not resize it.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    context_key: String,
    items: Vec<NormalizedQuery>,
    created_at: Instant,
    max_wait: Duration,
    max_size: usize,
}

impl Batch {
    pub fn new(context_key: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            id: BatchId::new(),
            context_key: context_key.into(),
            items: Vec::with_capacity(config.max_size),
            created_at: Instant::now(),
            max_wait: config.max_wait,
            max_size: config.max_size.max(1),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn context_key(&self) -> &str {
        &self.context_key
    }

    pub fn items(&self) -> &[NormalizedQuery] {
        &self.items
    }

    pub fn into_items(self) -> Vec<NormalizedQuery> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn deadline(&self) -> Instant {
        self.created_at + self.max_wait
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Insert before the first item of strictly lower priority, keeping
    /// arrival order among equals. Returns the insertion index.
    pub(crate) fn insert(&mut self, query: NormalizedQuery) -> usize {
        let position = self
            .items
            .iter()
            .position(|q| q.priority() < query.priority())
            .unwrap_or(self.items.len());
        self.items.insert(position, query);
        position
    }

    pub(crate) fn remove(&mut self, query_id: QueryId) -> Option<NormalizedQuery> {
        let idx = self.items.iter().position(|q| q.id() == query_id)?;
        Some(self.items.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Priority;

    fn query(text: &str, priority: Priority) -> NormalizedQuery {
        NormalizedQuery::new(text, "ctx", "caller")
            .unwrap()
            .with_priority(priority)
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_arrival() {
        let mut batch = Batch::new("ctx", BatchConfig::default());
        assert_eq!(batch.insert(query("low one", Priority::Low)), 0);
        assert_eq!(batch.insert(query("medium one", Priority::Medium)), 0);
        assert_eq!(batch.insert(query("high one", Priority::High)), 0);
        assert_eq!(batch.insert(query("medium two", Priority::Medium)), 2);
        assert_eq!(batch.insert(query("low two", Priority::Low)), 4);

        let order: Vec<&str> = batch.items().iter().map(|q| q.raw_text()).collect();
        assert_eq!(
            order,
            vec!["high one", "medium one", "medium two", "low one", "low two"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_and_due() {
        let config = BatchConfig {
            max_size: 2,
            max_wait: Duration::from_millis(100),
        };
        let mut batch = Batch::new("ctx", config);
        batch.insert(query("a", Priority::Medium));
        assert!(!batch.is_full());
        assert!(!batch.is_due(Instant::now()));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(batch.is_due(Instant::now()));

        let second = query("b", Priority::Medium);
        let id = second.id();
        batch.insert(second);
        assert!(batch.is_full());
        assert!(batch.remove(id).is_some());
        assert!(batch.remove(id).is_none());
        assert_eq!(batch.len(), 1);
    }
}
