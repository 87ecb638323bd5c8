//! Batch dispatch and result fan-out.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Completion, DispatchRequest, GovernorInner, ItemOutcome, RequestGovernor};
use crate::Error;
use crate::batch::Batch;
use crate::budget::UsageEvent;
use crate::observability::DispatchSpan;
use crate::query::{NormalizedQuery, QueryId};

impl RequestGovernor {
    /// Start the dispatcher. On cancellation it flushes every open batch
    /// before returning.
    pub fn spawn_dispatcher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let governor = self.clone();
        tokio::spawn(async move { governor.run_dispatcher(shutdown).await })
    }

    #[tracing::instrument(name = "dispatcher", skip_all)]
    async fn run_dispatcher(self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        tracing::info!("Dispatcher started");

        loop {
            for batch in self.inner.assembler.drain_ready() {
                let governor = self.clone();
                tasks.spawn(async move { governor.dispatch_batch(batch).await });
            }
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let deadline = self.inner.assembler.next_deadline();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.assembler.notified() => {}
                _ = sleep_until(deadline) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        let flushed = self.flush().await;
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        tracing::info!(flushed, "Dispatcher stopped");
    }

    /// Dispatch every sealed or due batch and wait for all of them.
    pub async fn dispatch_ready(&self) -> usize {
        self.dispatch_all(self.inner.assembler.drain_ready()).await
    }

    /// Dispatch everything queued, due or not.
    pub async fn flush(&self) -> usize {
        self.dispatch_all(self.inner.assembler.drain_all()).await
    }

    async fn dispatch_all(&self, batches: Vec<Batch>) -> usize {
        let count = batches.len();
        join_all(batches.into_iter().map(|b| self.dispatch_batch(b))).await;
        count
    }

    async fn dispatch_batch(&self, batch: Batch) {
        let inner = &self.inner;
        let batch_id = batch.id();
        let context_key = batch.context_key().to_string();
        let max_wait = batch.max_wait();
        let items = batch.into_items();
        if items.is_empty() {
            return;
        }

        // Drained items are committed; waiters leaving now must not withdraw them.
        for query in &items {
            if let Some(mut flight) = inner.in_flight.get_mut(query.fingerprint()) {
                flight.dispatched = true;
            }
        }

        let _permit = inner.permits.acquire().await.ok();
        let now = Instant::now();
        let oldest = items
            .iter()
            .map(|q| q.waited(now))
            .max()
            .unwrap_or_default();
        if oldest > max_wait {
            tracing::debug!(
                batch_id = %batch_id,
                waited = ?oldest,
                max_wait = ?max_wait,
                "Dispatch delayed by saturated permits"
            );
        }
        for query in &items {
            tracing::trace!(query_id = %query.id(), waited = ?query.waited(now), "Item dispatched");
        }

        let (model, max_output_tokens) = inner.generation_params();
        let request = DispatchRequest {
            batch_id,
            context_key,
            items,
            model,
            quality: inner.mode.quality(),
            max_output_tokens,
        };

        let span = DispatchSpan::new(
            &batch_id.to_string(),
            &request.context_key,
            request.len(),
            &request.model,
        );
        inner.metrics.record_dispatch_start();
        tracing::info!(parent: span.span(), "Dispatching batch");

        let call = AssertUnwindSafe(inner.executor.invoke(&request))
            .catch_unwind()
            .instrument(span.span().clone())
            .await;

        let (succeeded, failed, cost, upstream_ok) = match call {
            Ok(Ok(outcomes)) => {
                let (succeeded, failed, cost) = inner.resolve_batch(&request, outcomes);
                (succeeded, failed, cost, true)
            }
            Ok(Err(e)) => {
                tracing::warn!(parent: span.span(), error = %e, "Upstream call failed");
                inner.fail_all(&request, &e.to_string());
                (0, request.len(), Decimal::ZERO, false)
            }
            Err(_) => {
                tracing::error!(parent: span.span(), "Upstream executor panicked");
                inner.fail_all(&request, "upstream executor panicked");
                (0, request.len(), Decimal::ZERO, false)
            }
        };

        span.record_outcome(succeeded, failed, &cost);
        let latency_ms = span.finish();
        inner
            .metrics
            .record_dispatch_end(request.len(), latency_ms, upstream_ok);
        inner.update_gauges();
    }
}

impl GovernorInner {
    /// Returns `(succeeded, failed, billed cost)`.
    fn resolve_batch(
        &self,
        request: &DispatchRequest,
        outcomes: Vec<ItemOutcome>,
    ) -> (usize, usize, Decimal) {
        let mut by_id: HashMap<QueryId, ItemOutcome> =
            outcomes.into_iter().map(|o| (o.query_id, o)).collect();
        let (mut succeeded, mut failed, mut cost) = (0, 0, Decimal::ZERO);

        for query in &request.items {
            match by_id.remove(&query.id()) {
                Some(outcome) if outcome.is_success() => {
                    cost += outcome.cost;
                    succeeded += 1;
                    self.succeed(query, outcome);
                }
                Some(outcome) => {
                    cost += outcome.cost;
                    failed += 1;
                    let message = outcome
                        .error
                        .unwrap_or_else(|| "upstream returned no content".to_string());
                    self.fail(query, &outcome.model, &message, outcome.cost);
                }
                None => {
                    failed += 1;
                    self.fail(query, &request.model, "no result returned for item", Decimal::ZERO);
                }
            }
        }

        if !by_id.is_empty() {
            tracing::warn!(
                batch_id = %request.batch_id,
                unknown = by_id.len(),
                "Upstream returned results for unknown items"
            );
        }
        (succeeded, failed, cost)
    }

    fn succeed(&self, query: &NormalizedQuery, outcome: ItemOutcome) {
        let cost = outcome.cost;
        self.metrics.record_cost(cost);
        self.history
            .record(UsageEvent::upstream(query.caller_id(), &outcome.model, cost));

        let completion = Completion {
            query_id: query.id(),
            content: outcome.content.unwrap_or_default(),
            model: outcome.model,
            cost,
            cached: false,
        };
        let ttl = self
            .policy()
            .dedup
            .effective_ttl(self.mode.aggressive_caching());
        let fingerprint = query.fingerprint();
        self.cache
            .store_with_cost(fingerprint.clone(), completion.clone(), ttl, cost);

        let Some((_, flight)) = self.in_flight.remove(fingerprint) else {
            return;
        };
        self.history.release_pending(flight.estimate);
        for waiter in flight.waiters {
            let reply = if waiter.query_id == query.id() {
                completion.clone()
            } else {
                self.cache.record_shared_hit(fingerprint, cost);
                self.history.record(UsageEvent::cache_hit(&waiter.caller_id));
                completion.shared(waiter.query_id)
            };
            // The caller may have stopped waiting.
            let _ = waiter.reply.send(Ok(reply));
        }
    }

    fn fail(&self, query: &NormalizedQuery, model: &str, message: &str, cost: Decimal) {
        if !cost.is_zero() {
            self.metrics.record_cost(cost);
        }
        self.history.record(UsageEvent::failure(
            query.caller_id(),
            Some(model.to_string()),
            cost,
        ));
        tracing::debug!(query_id = %query.id(), error = message, "Item failed");

        let Some((_, flight)) = self.in_flight.remove(query.fingerprint()) else {
            return;
        };
        self.history.release_pending(flight.estimate);
        for waiter in flight.waiters {
            let _ = waiter
                .reply
                .send(Err(Error::upstream(message, Some(model.to_string()))));
        }
    }

    fn fail_all(&self, request: &DispatchRequest, message: &str) {
        for query in &request.items {
            self.fail(query, &request.model, message, Decimal::ZERO);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Dispatch task failed");
    }
}
