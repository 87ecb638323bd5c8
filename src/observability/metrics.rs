//! Metrics collection and export.
//!
//! Provides built-in atomic metrics for local tracking, with optional
//! OpenTelemetry export when the `otel` feature is enabled.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::budget::{from_micros, to_micros};

#[cfg(feature = "otel")]
use super::otel::{OtelConfig, OtelMetricsBridge};
#[cfg(feature = "otel")]
use opentelemetry::global;

/// Thread-safe atomic counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Simple histogram using fixed buckets.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn default_latency() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        ])
    }

    pub fn batch_sizes() -> Self {
        Self::new(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Count of observations that fell in bucket `idx`; the last bucket is overflow.
    pub fn bucket(&self, idx: usize) -> u64 {
        self.buckets
            .get(idx)
            .map(|b| b.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of observed values. Stored internally scaled by 1000.
    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() / n as f64,
        }
    }
}

/// Why an admission was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Governor is in `Rejecting` mode.
    Halted,
    Throttled,
    Blocked,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Halted => "halted",
            RejectReason::Throttled => "throttled",
            RejectReason::Blocked => "blocked",
        }
    }
}

/// Governor metrics registry.
///
/// Tracks metrics locally with atomic counters, and optionally exports
/// to OpenTelemetry when the `otel` feature is enabled.
pub struct MetricsRegistry {
    pub submissions: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub coalesced: Counter,
    pub rejected_halted: Counter,
    pub rejected_throttled: Counter,
    pub rejected_blocked: Counter,
    pub batches_dispatched: Counter,
    pub batch_size: Histogram,
    pub dispatch_latency_ms: Histogram,
    pub active_dispatches: Gauge,
    pub queued_items: Gauge,
    pub pending_cost_micros: Gauge,
    pub upstream_errors: Counter,
    pub cost_total_micros: Counter,
    pub alerts_fired: Counter,
    pub alerts_suppressed: Counter,
    pub action_failures: Counter,
    pub telemetry_failures: Counter,
    pub monitor_cycles: Counter,
    pub monitor_failures: Counter,
    pub monitor_restarts: Counter,
    #[cfg(feature = "otel")]
    otel_bridge: Option<OtelMetricsBridge>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            submissions: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            coalesced: Counter::new(),
            rejected_halted: Counter::new(),
            rejected_throttled: Counter::new(),
            rejected_blocked: Counter::new(),
            batches_dispatched: Counter::new(),
            batch_size: Histogram::batch_sizes(),
            dispatch_latency_ms: Histogram::default_latency(),
            active_dispatches: Gauge::new(),
            queued_items: Gauge::new(),
            pending_cost_micros: Gauge::new(),
            upstream_errors: Counter::new(),
            cost_total_micros: Counter::new(),
            alerts_fired: Counter::new(),
            alerts_suppressed: Counter::new(),
            action_failures: Counter::new(),
            telemetry_failures: Counter::new(),
            monitor_cycles: Counter::new(),
            monitor_failures: Counter::new(),
            monitor_restarts: Counter::new(),
            #[cfg(feature = "otel")]
            otel_bridge: None,
        }
    }

    #[cfg(feature = "otel")]
    pub fn otel(otel_config: &OtelConfig) -> Self {
        let meter = global::meter_with_scope(otel_config.scope());
        Self {
            otel_bridge: Some(OtelMetricsBridge::new(&meter)),
            ..Self::new()
        }
    }

    pub fn record_submission(&self) {
        self.submissions.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_submission();
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_cache_lookup(hit);
        }
    }

    /// A duplicate joined an in-flight query. Also counts as a cache hit.
    pub fn record_coalesced(&self) {
        self.coalesced.inc();
        self.record_cache_lookup(true);
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        match reason {
            RejectReason::Halted => self.rejected_halted.inc(),
            RejectReason::Throttled => self.rejected_throttled.inc(),
            RejectReason::Blocked => self.rejected_blocked.inc(),
        }

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_rejection(reason);
        }
    }

    pub fn record_dispatch_start(&self) {
        self.active_dispatches.inc();
    }

    pub fn record_dispatch_end(&self, size: usize, latency_ms: f64, success: bool) {
        self.active_dispatches.dec();
        self.batches_dispatched.inc();
        self.batch_size.observe(size as f64);
        self.dispatch_latency_ms.observe(latency_ms);
        if !success {
            self.upstream_errors.inc();
        }

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_dispatch(size as u64, latency_ms, success);
        }
    }

    /// Queries waiting in batches and their estimated cost.
    pub fn record_pending(&self, queued: usize, pending_cost: Decimal) {
        self.queued_items.set(queued as i64);
        self.pending_cost_micros
            .set(i64::try_from(to_micros(pending_cost)).unwrap_or(i64::MAX));
    }

    pub fn record_cost(&self, cost: Decimal) {
        self.cost_total_micros.add(to_micros(cost));

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_cost(cost);
        }
    }

    pub fn record_alert(&self, suppressed: bool) {
        if suppressed {
            self.alerts_suppressed.inc();
        } else {
            self.alerts_fired.inc();
        }

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_alert(suppressed);
        }
    }

    pub fn record_action_failure(&self) {
        self.action_failures.inc();
    }

    pub fn record_telemetry_failure(&self) {
        self.telemetry_failures.inc();
    }

    pub fn record_monitor_cycle(&self, success: bool) {
        self.monitor_cycles.inc();
        if !success {
            self.monitor_failures.inc();
        }
    }

    pub fn record_monitor_restart(&self) {
        self.monitor_restarts.inc();
    }

    pub fn total_cost(&self) -> Decimal {
        from_micros(self.cost_total_micros.get())
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the registry for export/display purposes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub submissions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub rejections: u64,
    pub batches_dispatched: u64,
    pub avg_batch_size: f64,
    pub avg_dispatch_latency_ms: f64,
    pub upstream_errors: u64,
    pub total_cost: Decimal,
    pub queued_items: i64,
    pub pending_cost: Decimal,
    pub alerts_fired: u64,
    pub alerts_suppressed: u64,
    pub action_failures: u64,
    pub monitor_restarts: u64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        Self {
            submissions: registry.submissions.get(),
            cache_hits: registry.cache_hits.get(),
            cache_misses: registry.cache_misses.get(),
            coalesced: registry.coalesced.get(),
            rejections: registry.rejected_halted.get()
                + registry.rejected_throttled.get()
                + registry.rejected_blocked.get(),
            batches_dispatched: registry.batches_dispatched.get(),
            avg_batch_size: registry.batch_size.mean(),
            avg_dispatch_latency_ms: registry.dispatch_latency_ms.mean(),
            upstream_errors: registry.upstream_errors.get(),
            total_cost: registry.total_cost(),
            queued_items: registry.queued_items.get(),
            pending_cost: from_micros(registry.pending_cost_micros.get().max(0) as u64),
            alerts_fired: registry.alerts_fired.get(),
            alerts_suppressed: registry.alerts_suppressed.get(),
            action_failures: registry.action_failures.get(),
            monitor_restarts: registry.monitor_restarts.get(),
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}
