//! Typed governor settings.
//!
//! Every section has serde defaults, so an empty document is a valid
//! configuration. Durations are written in humantime form (`"250ms"`, `"5m"`).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::{BatchConfig, DEFAULT_MAX_SIZE, DEFAULT_MAX_WAIT};
use crate::budget::{
    BudgetRule, DEFAULT_HISTORY_CAPACITY, DEFAULT_RATE_WINDOW, FiringPolicy, ModelPricing,
    MonitorConfig, PricingTable,
};
use crate::cache::DEFAULT_MAX_ENTRIES;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub batch: BatchSettings,
    pub dedup: DedupSettings,
    pub monitor: MonitorSettings,
    pub upstream: UpstreamSettings,
    /// Per-model prices layered over the built-in table.
    pub pricing: HashMap<String, ModelPricing>,
    pub rules: Vec<BudgetRule>,
}

impl GovernorSettings {
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = BudgetRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn with_batch(mut self, max_size: usize, max_wait: Duration) -> Self {
        self.batch.max_size = max_size;
        self.batch.max_wait = max_wait;
        self
    }

    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::builder()
            .from_env()
            .models(self.pricing.iter().map(|(k, v)| (k.clone(), *v)))
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_size: usize,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// Upper bound on upstream calls running at once. `max_wait` bounds
    /// when a batch is sealed; while every permit is taken, a sealed batch
    /// waits for one and its upstream call can start later than that.
    pub max_concurrent_dispatches: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
            max_concurrent_dispatches: 4,
        }
    }
}

impl BatchSettings {
    pub fn to_config(&self) -> BatchConfig {
        BatchConfig {
            max_size: self.max_size,
            max_wait: self.max_wait,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub max_entries: usize,
    /// TTL multiplier while aggressive caching is on.
    pub aggressive_ttl_multiplier: u32,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: DEFAULT_MAX_ENTRIES,
            aggressive_ttl_multiplier: 4,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl DedupSettings {
    pub fn effective_ttl(&self, aggressive: bool) -> Duration {
        if aggressive {
            self.ttl.saturating_mul(self.aggressive_ttl_multiplier.max(1))
        } else {
            self.ttl
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stall_threshold: Duration,
    pub history_capacity: usize,
    /// Trailing window the hourly rate is computed over.
    #[serde(with = "humantime_serde")]
    pub rate_window: Duration,
    pub firing_policy: FiringPolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let config = MonitorConfig::default();
        Self {
            interval: config.interval,
            stall_threshold: config.stall_threshold,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            rate_window: DEFAULT_RATE_WINDOW,
            firing_policy: FiringPolicy::default(),
        }
    }
}

impl MonitorSettings {
    pub fn to_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.interval,
            stall_threshold: self.stall_threshold,
            ..MonitorConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub default_model: String,
    pub standard_max_tokens: u64,
    /// Output cap while quality is degraded.
    pub degraded_max_tokens: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            default_model: "medium".to_string(),
            standard_max_tokens: 1024,
            degraded_max_tokens: 256,
        }
    }
}
