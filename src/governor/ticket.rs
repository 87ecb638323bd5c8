//! Submission outcomes and the awaitable ticket for batched queries.

use std::sync::Weak;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::oneshot;

use super::GovernorInner;
use crate::batch::BatchId;
use crate::query::{Fingerprint, QueryId};
use crate::{Error, Result};

/// A resolved response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Completion {
    pub query_id: QueryId,
    pub content: String,
    pub model: String,
    /// Zero for cache hits and coalesced duplicates.
    pub cost: Decimal,
    pub cached: bool,
}

impl Completion {
    /// The same response re-served to another query at zero cost.
    pub(crate) fn shared(&self, query_id: QueryId) -> Self {
        Self {
            query_id,
            content: self.content.clone(),
            model: self.model.clone(),
            cost: Decimal::ZERO,
            cached: true,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// Served from the deduplication cache.
    Cached(Completion),
    /// Queued (or joined an identical queued query); await the ticket.
    Batched {
        batch_id: BatchId,
        position: usize,
        ticket: Ticket,
    },
}

impl Outcome {
    pub fn is_cached(&self) -> bool {
        matches!(self, Outcome::Cached(_))
    }

    /// Resolve either variant to its completion.
    pub async fn resolve(self) -> Result<Completion> {
        match self {
            Outcome::Cached(completion) => Ok(completion),
            Outcome::Batched { ticket, .. } => ticket.wait().await,
        }
    }
}

pub(crate) type Reply = oneshot::Sender<Result<Completion>>;

/// Handle to a batched query's eventual result.
///
/// Dropping a ticket does not cancel the query; use [`Ticket::cancel`] or
/// [`Ticket::wait_timeout`].
#[derive(Debug)]
pub struct Ticket {
    query_id: QueryId,
    fingerprint: Fingerprint,
    rx: oneshot::Receiver<Result<Completion>>,
    governor: Weak<GovernorInner>,
}

impl Ticket {
    pub(crate) fn new(
        query_id: QueryId,
        fingerprint: Fingerprint,
        governor: Weak<GovernorInner>,
    ) -> (Self, Reply) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                query_id,
                fingerprint,
                rx,
                governor,
            },
            tx,
        )
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub async fn wait(self) -> Result<Completion> {
        self.rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Wait up to `timeout`. On expiry the waiter is removed, and the queued
    /// item too when nobody else waits on it. An item already drained for
    /// dispatch stays in flight; its result still lands in the cache.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Completion> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(reply) => reply.map_err(|_| Error::Shutdown)?,
            Err(_) => {
                self.detach();
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Withdraw this waiter. Returns `true` if it was still pending.
    pub fn cancel(self) -> bool {
        self.detach()
    }

    fn detach(&self) -> bool {
        match self.governor.upgrade() {
            Some(inner) => inner.remove_waiter(&self.fingerprint, self.query_id),
            None => false,
        }
    }
}
