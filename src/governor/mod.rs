//! Request admission, deduplication and batching.
//!
//! [`RequestGovernor::submit`] decides, in order:
//!
//! 1. `Rejecting` mode refuses everything, cache hits included.
//! 2. A duplicate of a query already queued or dispatching joins it.
//! 3. A live cache entry is served at zero cost.
//! 4. Blocked operations and throttled admissions are refused.
//! 5. Everything else is added to a per-context batch.
//!
//! Only step 5 can cost money, so only it is subject to blocking and
//! throttling. Batches are dispatched by the task started with
//! [`RequestGovernor::spawn_dispatcher`].

mod dispatch;
mod mode;
mod ticket;
mod upstream;

pub use mode::{AdmissionState, GovernorMode, ModeSnapshot, QualityLevel};
pub use ticket::{Completion, Outcome, Ticket};
pub use upstream::{DispatchRequest, ItemOutcome, UpstreamError, UpstreamExecutor};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;

use crate::batch::{BatchAssembler, BatchId};
use crate::budget::{CostHistory, PricingTable, UsageEvent};
use crate::cache::DeduplicationCache;
use crate::config::{DedupSettings, GovernorSettings, UpstreamSettings};
use crate::observability::{MetricsRegistry, RejectReason, submit_span};
use crate::query::{Fingerprint, NormalizedQuery, QueryId};
use crate::{Error, Result};

use ticket::Reply;

struct Waiter {
    query_id: QueryId,
    caller_id: String,
    reply: Reply,
}

/// A fingerprint queued or being dispatched, with everyone waiting on it.
struct InFlight {
    leader: QueryId,
    context_key: String,
    batch_id: BatchId,
    position: usize,
    estimate: Decimal,
    dispatched: bool,
    waiters: Vec<Waiter>,
}

#[derive(Clone, Debug)]
struct Policy {
    dedup: DedupSettings,
    upstream: UpstreamSettings,
}

pub(crate) struct GovernorInner {
    cache: DeduplicationCache<Completion>,
    assembler: BatchAssembler,
    in_flight: DashMap<Fingerprint, InFlight>,
    mode: Arc<GovernorMode>,
    history: Arc<CostHistory>,
    executor: Arc<dyn UpstreamExecutor>,
    pricing: RwLock<PricingTable>,
    policy: RwLock<Policy>,
    permits: Semaphore,
    permit_target: AtomicUsize,
    metrics: Arc<MetricsRegistry>,
    closed: AtomicBool,
}

impl GovernorInner {
    fn policy(&self) -> Policy {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Model and output cap for a dispatch made now.
    fn generation_params(&self) -> (String, u64) {
        let policy = self.policy.read().unwrap_or_else(|e| e.into_inner());
        let model = self
            .mode
            .model_override()
            .unwrap_or_else(|| policy.upstream.default_model.clone());
        let max_tokens = match self.mode.quality() {
            QualityLevel::Standard => policy.upstream.standard_max_tokens,
            QualityLevel::Degraded => policy.upstream.degraded_max_tokens,
        };
        (model, max_tokens)
    }

    fn estimate(&self, query: &NormalizedQuery) -> Decimal {
        let (model, max_tokens) = self.generation_params();
        self.pricing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .estimate(&model, query.normalized_text(), max_tokens)
    }

    fn update_gauges(&self) {
        self.metrics
            .record_pending(self.assembler.pending(), self.history.pending_cost());
    }

    /// Drop one waiter. A query nobody waits on any more is pulled from its
    /// batch unless it has already been dispatched.
    pub(crate) fn remove_waiter(&self, fingerprint: &Fingerprint, query_id: QueryId) -> bool {
        let Entry::Occupied(mut slot) = self.in_flight.entry(fingerprint.clone()) else {
            return false;
        };
        let flight = slot.get_mut();
        let Some(idx) = flight.waiters.iter().position(|w| w.query_id == query_id) else {
            return false;
        };
        flight.waiters.remove(idx);

        if flight.waiters.is_empty() && !flight.dispatched {
            if self.assembler.cancel(&flight.context_key, flight.leader).is_none() {
                // Already drained; the dispatcher owns it and will resolve the entry.
                flight.dispatched = true;
                return true;
            }
            let flight = slot.remove();
            self.history.release_pending(flight.estimate);
            self.update_gauges();
            tracing::debug!(
                query_id = %query_id,
                fingerprint = fingerprint.short(),
                "Queued query withdrawn"
            );
        }
        true
    }

    fn set_dispatch_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let previous = self.permit_target.swap(limit, Ordering::AcqRel);
        if limit > previous {
            self.permits.add_permits(limit - previous);
        } else if limit < previous {
            self.permits.forget_permits(previous - limit);
        }
    }
}

/// Cheap to clone; clones share one governor.
#[derive(Clone)]
pub struct RequestGovernor {
    inner: Arc<GovernorInner>,
}

impl RequestGovernor {
    /// A governor with its own mode, cost history and metrics.
    pub fn new(executor: Arc<dyn UpstreamExecutor>, settings: &GovernorSettings) -> Self {
        let history = Arc::new(CostHistory::new(
            settings.monitor.history_capacity,
            settings.monitor.rate_window,
        ));
        Self::with_parts(
            executor,
            settings,
            Arc::new(GovernorMode::new()),
            history,
            Arc::new(MetricsRegistry::new()),
        )
    }

    /// A governor sharing mode and history with a budget monitor.
    pub fn with_parts(
        executor: Arc<dyn UpstreamExecutor>,
        settings: &GovernorSettings,
        mode: Arc<GovernorMode>,
        history: Arc<CostHistory>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let limit = settings.batch.max_concurrent_dispatches.max(1);
        Self {
            inner: Arc::new(GovernorInner {
                cache: DeduplicationCache::new(settings.dedup.max_entries),
                assembler: BatchAssembler::new(settings.batch.to_config()),
                in_flight: DashMap::new(),
                mode,
                history,
                executor,
                pricing: RwLock::new(settings.pricing_table()),
                policy: RwLock::new(Policy {
                    dedup: settings.dedup,
                    upstream: settings.upstream.clone(),
                }),
                permits: Semaphore::new(limit),
                permit_target: AtomicUsize::new(limit),
                metrics,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Admit a query.
    ///
    /// Fails with [`Error::CapacityExceeded`] while rejecting or throttled,
    /// [`Error::OperationBlocked`] for blocked operations and
    /// [`Error::Shutdown`] once closed.
    pub fn submit(&self, query: NormalizedQuery) -> Result<Outcome> {
        let span = submit_span(&query);
        let _entered = span.enter();
        let inner = &self.inner;
        inner.metrics.record_submission();

        if inner.closed.load(Ordering::Acquire) {
            span.record("outcome", "shutdown");
            return Err(Error::Shutdown);
        }

        if inner.mode.is_rejecting() {
            inner.metrics.record_rejection(RejectReason::Halted);
            span.record("outcome", "rejected");
            let reason = inner
                .mode
                .reject_reason()
                .unwrap_or_else(|| "governor is rejecting new queries".to_string());
            tracing::debug!(reason = %reason, "Query rejected");
            return Err(Error::capacity(reason));
        }

        let fingerprint = query.fingerprint().clone();
        let query_id = query.id();
        let (ticket, reply) = Ticket::new(query_id, fingerprint.clone(), Arc::downgrade(inner));
        let waiter = Waiter {
            query_id,
            caller_id: query.caller_id().to_string(),
            reply,
        };

        match inner.in_flight.entry(fingerprint) {
            Entry::Occupied(mut slot) => {
                let flight = slot.get_mut();
                flight.waiters.push(waiter);
                inner.metrics.record_coalesced();
                span.record("outcome", "coalesced");
                tracing::debug!(leader = %flight.leader, "Joined in-flight duplicate");
                Ok(Outcome::Batched {
                    batch_id: flight.batch_id,
                    position: flight.position,
                    ticket,
                })
            }
            Entry::Vacant(slot) => {
                if let Some(cached) = inner.cache.lookup(slot.key()) {
                    inner.metrics.record_cache_lookup(true);
                    inner.history.record(UsageEvent::cache_hit(query.caller_id()));
                    span.record("outcome", "cached");
                    tracing::debug!("Served from cache");
                    return Ok(Outcome::Cached(cached.shared(query_id)));
                }
                inner.metrics.record_cache_lookup(false);

                if inner.mode.is_blocked(query.operation()) {
                    inner.metrics.record_rejection(RejectReason::Blocked);
                    span.record("outcome", "blocked");
                    tracing::debug!(operation = query.operation(), "Operation blocked");
                    return Err(Error::OperationBlocked {
                        operation: query.operation().to_string(),
                    });
                }

                if inner.mode.should_throttle() {
                    inner.metrics.record_rejection(RejectReason::Throttled);
                    span.record("outcome", "throttled");
                    tracing::debug!(
                        fraction = inner.mode.throttle_fraction(),
                        "Query throttled"
                    );
                    return Err(Error::capacity("throttled by budget policy"));
                }

                let estimate = inner.estimate(&query);
                let context_key = query.context_key().to_string();
                let handle = inner.assembler.add(query);
                inner.history.add_pending(estimate);
                slot.insert(InFlight {
                    leader: query_id,
                    context_key,
                    batch_id: handle.batch_id,
                    position: handle.position,
                    estimate,
                    dispatched: false,
                    waiters: vec![waiter],
                });
                inner.update_gauges();
                span.record("outcome", "batched");

                Ok(Outcome::Batched {
                    batch_id: handle.batch_id,
                    position: handle.position,
                    ticket,
                })
            }
        }
    }

    /// Apply reloaded settings. Open batches keep the sizing they were
    /// created with.
    pub fn apply_settings(&self, settings: &GovernorSettings) {
        let inner = &self.inner;
        inner.assembler.set_config(settings.batch.to_config());
        inner.cache.set_max_entries(settings.dedup.max_entries);
        inner.set_dispatch_limit(settings.batch.max_concurrent_dispatches);
        *inner.pricing.write().unwrap_or_else(|e| e.into_inner()) = settings.pricing_table();
        *inner.policy.write().unwrap_or_else(|e| e.into_inner()) = Policy {
            dedup: settings.dedup,
            upstream: settings.upstream.clone(),
        };
        inner.history.set_rate_window(settings.monitor.rate_window);
    }

    /// Refuse new submissions. Queued work can still be flushed.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Governor closed to new submissions");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> &Arc<GovernorMode> {
        &self.inner.mode
    }

    pub fn history(&self) -> &Arc<CostHistory> {
        &self.inner.history
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn cache(&self) -> &DeduplicationCache<Completion> {
        &self.inner.cache
    }

    pub fn assembler(&self) -> &BatchAssembler {
        &self.inner.assembler
    }

    /// Distinct fingerprints queued or dispatching.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl std::fmt::Debug for RequestGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGovernor")
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .field("mode", &self.inner.mode.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::query::Priority;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<DispatchRequest>>,
    }

    impl Recorder {
        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl UpstreamExecutor for Recorder {
        async fn invoke(
            &self,
            request: &DispatchRequest,
        ) -> std::result::Result<Vec<ItemOutcome>, UpstreamError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(request
                .items
                .iter()
                .map(|q| {
                    ItemOutcome::success(q.id(), q.raw_text().to_uppercase(), &request.model, dec!(0.01))
                })
                .collect())
        }
    }

    fn governor(max_size: usize) -> (RequestGovernor, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let settings =
            GovernorSettings::default().with_batch(max_size, Duration::from_millis(200));
        (RequestGovernor::new(recorder.clone(), &settings), recorder)
    }

    fn query(text: &str) -> NormalizedQuery {
        NormalizedQuery::new(text, "support", "alice").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_then_cache_hit() {
        let (gov, recorder) = governor(1);
        let Outcome::Batched { ticket, .. } = gov.submit(query("reset my password")).unwrap() else {
            panic!("expected a batched outcome");
        };
        assert_eq!(gov.dispatch_ready().await, 1);
        let completion = ticket.wait().await.unwrap();
        assert_eq!(completion.content, "RESET MY PASSWORD");
        assert_eq!(completion.cost, dec!(0.01));
        assert!(!completion.cached);

        let Outcome::Cached(hit) = gov.submit(query("Reset my password!")).unwrap() else {
            panic!("expected a cache hit");
        };
        assert!(hit.cached);
        assert_eq!(hit.cost, Decimal::ZERO);
        assert_eq!(hit.content, "RESET MY PASSWORD");
        assert_eq!(recorder.calls(), 1);
        assert_eq!(gov.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_coalesce() {
        let (gov, recorder) = governor(8);
        let outcomes: Vec<Outcome> = (0..3)
            .map(|_| gov.submit(query("where is my order")).unwrap())
            .collect();
        assert_eq!(gov.in_flight(), 1);
        assert_eq!(gov.assembler().pending(), 1);
        assert_eq!(gov.metrics().coalesced.get(), 2);

        gov.flush().await;
        let mut costs = Vec::new();
        for outcome in outcomes {
            costs.push(outcome.resolve().await.unwrap().cost);
        }
        assert_eq!(costs, vec![dec!(0.01), dec!(0), dec!(0)]);
        assert_eq!(recorder.calls(), 1);
        assert_eq!(gov.cache().stats().hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejecting_refuses_cache_hits() {
        let (gov, _) = governor(1);
        let outcome = gov.submit(query("hello")).unwrap();
        gov.dispatch_ready().await;
        outcome.resolve().await.unwrap();

        gov.mode().set_rejecting("budget exhausted");
        let err = gov.submit(query("hello")).unwrap_err();
        assert!(err.is_capacity());
        assert!(err.to_string().contains("budget exhausted"));

        gov.mode().clear();
        assert!(gov.submit(query("hello")).unwrap().is_cached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_operation() {
        let (gov, _) = governor(4);
        gov.mode().block_operations(["summarize"]);
        let err = gov
            .submit(query("long document").with_operation("summarize"))
            .unwrap_err();
        assert!(matches!(err, Error::OperationBlocked { .. }));
        assert!(gov.submit(query("short question")).is_ok());
        assert_eq!(gov.metrics().rejected_blocked.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_throttle_rejects_new_work() {
        let (gov, _) = governor(4);
        gov.mode().set_throttle(1.0);
        let err = gov.submit(query("anything")).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(gov.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_cost_tracks_queue() {
        let (gov, _) = governor(8);
        let outcome = gov.submit(query("estimate me")).unwrap();
        assert!(gov.history().pending_cost() > Decimal::ZERO);

        let Outcome::Batched { ticket, .. } = outcome else {
            panic!("expected a batched outcome");
        };
        assert!(ticket.cancel());
        assert_eq!(gov.history().pending_cost(), Decimal::ZERO);
        assert_eq!(gov.assembler().pending(), 0);
        assert_eq!(gov.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_drain_keeps_item_in_flight() {
        let (gov, recorder) = governor(1);
        let Outcome::Batched { ticket, .. } = gov.submit(query("sealed early")).unwrap() else {
            panic!("expected a batched outcome");
        };
        let estimate = gov.history().pending_cost();
        let drained = gov.assembler().drain_ready();
        assert_eq!(drained.len(), 1);

        assert!(ticket.cancel());
        assert_eq!(gov.in_flight(), 1);
        assert_eq!(gov.history().pending_cost(), estimate);

        // A resubmission joins the drained item instead of queueing a second copy.
        let again = gov.submit(query("sealed early")).unwrap();
        assert!(!again.is_cached());
        assert_eq!(gov.assembler().pending(), 0);
        assert_eq!(gov.in_flight(), 1);
        assert_eq!(gov.metrics().coalesced.get(), 1);
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_mode_changes_dispatch() {
        let (gov, recorder) = governor(1);
        gov.mode().set_degraded();
        gov.mode().set_model_override("small");
        let outcome = gov.submit(query("cheap please")).unwrap();
        gov.dispatch_ready().await;
        assert_eq!(outcome.resolve().await.unwrap().model, "small");

        let requests = recorder.requests.lock().unwrap();
        assert_eq!(requests[0].quality, QualityLevel::Degraded);
        assert_eq!(requests[0].max_output_tokens, 256);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_within_batch() {
        let (gov, recorder) = governor(3);
        gov.submit(query("low").with_priority(Priority::Low)).unwrap();
        gov.submit(query("medium")).unwrap();
        gov.submit(query("high").with_priority(Priority::High)).unwrap();
        gov.dispatch_ready().await;

        let requests = recorder.requests.lock().unwrap();
        let order: Vec<&str> = requests[0].items.iter().map(|q| q.raw_text()).collect();
        assert_eq!(order, vec!["high", "medium", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_governor() {
        let (gov, _) = governor(4);
        gov.close();
        assert!(matches!(gov.submit(query("late")), Err(Error::Shutdown)));
    }
}
