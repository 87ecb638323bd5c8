//! Rolling cost history shared by the governor and the budget monitor.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{from_micros, to_micros};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1_024;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(3600);

const SECONDS_PER_HOUR: u64 = 3600;

/// One completed unit of work as seen by the cost history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub caller_id: String,
    pub model: Option<String>,
    pub cost: Decimal,
    pub cached: bool,
    pub error: bool,
}

impl UsageEvent {
    pub fn upstream(caller_id: impl Into<String>, model: impl Into<String>, cost: Decimal) -> Self {
        Self {
            timestamp: Utc::now(),
            caller_id: caller_id.into(),
            model: Some(model.into()),
            cost,
            cached: false,
            error: false,
        }
    }

    /// A response served without an upstream call.
    pub fn cache_hit(caller_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            caller_id: caller_id.into(),
            model: None,
            cost: Decimal::ZERO,
            cached: true,
            error: false,
        }
    }

    /// Failed upstream item. Failed calls may still be billed.
    pub fn failure(caller_id: impl Into<String>, model: Option<String>, cost: Decimal) -> Self {
        Self {
            timestamp: Utc::now(),
            caller_id: caller_id.into(),
            model,
            cost,
            cached: false,
            error: true,
        }
    }
}

/// Point-in-time cost and usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSample {
    pub timestamp: DateTime<Utc>,
    pub total_cost: Decimal,
    /// Spend over the trailing rate window, scaled to one hour.
    pub hourly_rate: Decimal,
    pub per_caller_cost: HashMap<String, Decimal>,
    pub per_model_cost: HashMap<String, Decimal>,
    pub request_count: u64,
    pub error_count: u64,
    pub cache_hit_count: u64,
    /// Estimated cost of admitted queries not yet resolved.
    pub pending_cost: Decimal,
}

impl CostSample {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            total_cost: Decimal::ZERO,
            hourly_rate: Decimal::ZERO,
            per_caller_cost: HashMap::new(),
            per_model_cost: HashMap::new(),
            request_count: 0,
            error_count: 0,
            cache_hit_count: 0,
            pending_cost: Decimal::ZERO,
        }
    }

    /// Errors per upstream-resolved request, in `[0, 1]`. Cache hits never
    /// reach upstream and are left out of the denominator.
    pub fn error_rate(&self) -> Decimal {
        let resolved = self.request_count.saturating_sub(self.cache_hit_count);
        if resolved == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.error_count) / Decimal::from(resolved)
    }

    pub fn top_caller(&self) -> Option<(&str, Decimal)> {
        top_entry(&self.per_caller_cost)
    }

    pub fn top_model(&self) -> Option<(&str, Decimal)> {
        top_entry(&self.per_model_cost)
    }
}

impl Default for CostSample {
    fn default() -> Self {
        Self::empty()
    }
}

fn top_entry(map: &HashMap<String, Decimal>) -> Option<(&str, Decimal)> {
    map.iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(k, v)| (k.as_str(), *v))
}

/// Errors raised by a [`CostSource`].
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Cost source unavailable: {0}")]
    Unavailable(String),
}

/// Anything that can produce the current [`CostSample`].
pub trait CostSource: Send + Sync {
    fn sample(&self) -> Result<CostSample, SampleError>;
}

#[derive(Default)]
struct HistoryState {
    total_cost: Decimal,
    per_caller: HashMap<String, Decimal>,
    per_model: HashMap<String, Decimal>,
    request_count: u64,
    error_count: u64,
    cache_hit_count: u64,
    recent: VecDeque<(Instant, Decimal)>,
    samples: VecDeque<CostSample>,
}

impl HistoryState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.recent.front() {
            if now.saturating_duration_since(*at) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn hourly_rate(&self, window: Duration) -> Decimal {
        let spent: Decimal = self.recent.iter().map(|(_, cost)| *cost).sum();
        let window_secs = window.as_secs().max(1);
        spent * Decimal::from(SECONDS_PER_HOUR) / Decimal::from(window_secs)
    }

    fn snapshot(&self, window: Duration, pending_cost: Decimal) -> CostSample {
        CostSample {
            timestamp: Utc::now(),
            total_cost: self.total_cost,
            hourly_rate: self.hourly_rate(window),
            per_caller_cost: self.per_caller.clone(),
            per_model_cost: self.per_model.clone(),
            request_count: self.request_count,
            error_count: self.error_count,
            cache_hit_count: self.cache_hit_count,
            pending_cost,
        }
    }
}

/// Running cost aggregates plus a bounded window of recent samples.
///
/// Every recorded event appends a [`CostSample`]; once `capacity` samples are
/// held the oldest is evicted.
pub struct CostHistory {
    state: RwLock<HistoryState>,
    capacity: usize,
    rate_window: RwLock<Duration>,
    pending_micros: AtomicU64,
}

impl CostHistory {
    pub fn new(capacity: usize, rate_window: Duration) -> Self {
        Self {
            state: RwLock::new(HistoryState::default()),
            capacity: capacity.max(1),
            rate_window: RwLock::new(rate_window),
            pending_micros: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: UsageEvent) {
        let now = Instant::now();
        let window = self.rate_window();
        let pending = self.pending_cost();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        state.request_count += 1;
        if event.cached {
            state.cache_hit_count += 1;
        }
        if event.error {
            state.error_count += 1;
        }
        if !event.cost.is_zero() {
            state.total_cost += event.cost;
            *state
                .per_caller
                .entry(event.caller_id.clone())
                .or_insert(Decimal::ZERO) += event.cost;
            if let Some(model) = &event.model {
                *state
                    .per_model
                    .entry(model.clone())
                    .or_insert(Decimal::ZERO) += event.cost;
            }
            state.recent.push_back((now, event.cost));
        }

        state.prune(now, window);
        let sample = state.snapshot(window, pending);
        state.samples.push_back(sample);
        while state.samples.len() > self.capacity {
            state.samples.pop_front();
        }
    }

    /// Latest aggregates with the hourly rate and pending cost evaluated now.
    pub fn latest(&self) -> CostSample {
        let now = Instant::now();
        let window = self.rate_window();
        let pending = self.pending_cost();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.prune(now, window);
        state.snapshot(window, pending)
    }

    /// The most recent `n` recorded samples, oldest first.
    pub fn window(&self, n: usize) -> Vec<CostSample> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let skip = state.samples.len().saturating_sub(n);
        state.samples.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .samples
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add_pending(&self, estimate: Decimal) {
        self.pending_micros
            .fetch_add(to_micros(estimate), Ordering::Relaxed);
    }

    pub fn release_pending(&self, estimate: Decimal) {
        let micros = to_micros(estimate);
        let _ = self
            .pending_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(micros))
            });
    }

    pub fn pending_cost(&self) -> Decimal {
        from_micros(self.pending_micros.load(Ordering::Relaxed))
    }

    pub fn rate_window(&self) -> Duration {
        *self.rate_window.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_rate_window(&self, window: Duration) {
        *self.rate_window.write().unwrap_or_else(|e| e.into_inner()) = window;
    }

    /// Start a new accounting period. Pending estimates are kept.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = HistoryState::default();
        tracing::info!("Cost history reset");
    }
}

impl Default for CostHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_RATE_WINDOW)
    }
}

impl CostSource for CostHistory {
    fn sample(&self) -> Result<CostSample, SampleError> {
        Ok(self.latest())
    }
}

impl std::fmt::Debug for CostHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostHistory")
            .field("samples", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
