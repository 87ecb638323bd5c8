//! Budget rules, alert levels and the metrics they watch.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::actions::Action;
use super::history::CostSample;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Severity of a budget rule. Ordering is `Info < Warning < Critical < Emergency`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Emergency => "emergency",
        }
    }

    pub fn all() -> &'static [AlertLevel] {
        &[
            AlertLevel::Info,
            AlertLevel::Warning,
            AlertLevel::Critical,
            AlertLevel::Emergency,
        ]
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field of a [`CostSample`] a rule watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalCost,
    HourlyRate,
    /// Highest spend of any single caller.
    CallerCost,
    /// Highest spend on any single model.
    ModelCost,
    RequestCount,
    ErrorCount,
    /// Errors per resolved request, `0..=1`.
    ErrorRate,
    PendingCost,
}

/// A metric value read from one sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricReading {
    pub value: Decimal,
    /// Caller or model responsible, for per-caller and per-model metrics.
    pub subject: Option<String>,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::TotalCost => "total_cost",
            Metric::HourlyRate => "hourly_rate",
            Metric::CallerCost => "caller_cost",
            Metric::ModelCost => "model_cost",
            Metric::RequestCount => "request_count",
            Metric::ErrorCount => "error_count",
            Metric::ErrorRate => "error_rate",
            Metric::PendingCost => "pending_cost",
        }
    }

    pub fn read(&self, sample: &CostSample) -> MetricReading {
        let plain = |value: Decimal| MetricReading {
            value,
            subject: None,
        };
        let top = |entry: Option<(&str, Decimal)>| match entry {
            Some((name, value)) => MetricReading {
                value,
                subject: Some(name.to_string()),
            },
            None => plain(Decimal::ZERO),
        };

        match self {
            Metric::TotalCost => plain(sample.total_cost),
            Metric::HourlyRate => plain(sample.hourly_rate),
            Metric::CallerCost => top(sample.top_caller()),
            Metric::ModelCost => top(sample.top_model()),
            Metric::RequestCount => plain(Decimal::from(sample.request_count)),
            Metric::ErrorCount => plain(Decimal::from(sample.error_count)),
            Metric::ErrorRate => plain(sample.error_rate()),
            Metric::PendingCost => plain(sample.pending_cost),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a rule. Validation guarantees one rule per metric and level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RuleId {
    pub metric: Metric,
    pub level: AlertLevel,
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.metric, self.level)
    }
}

fn default_cooldown() -> Duration {
    DEFAULT_COOLDOWN
}

/// A `(metric, threshold, level, actions)` tuple governing automated response.
///
/// A rule is exceeded once the watched value reaches its threshold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetRule {
    pub metric: Metric,
    pub level: AlertLevel,
    pub threshold: Decimal,
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Supports `{level}`, `{metric}`, `{value}`, `{threshold}` and `{subject}`.
    #[serde(default)]
    pub message_template: String,
}

impl BudgetRule {
    pub fn new(metric: Metric, level: AlertLevel, threshold: Decimal) -> Self {
        Self {
            metric,
            level,
            threshold,
            cooldown: DEFAULT_COOLDOWN,
            actions: Vec::new(),
            message_template: String::new(),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions.extend(actions);
        self
    }

    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message_template = template.into();
        self
    }

    pub fn id(&self) -> RuleId {
        RuleId {
            metric: self.metric,
            level: self.level,
        }
    }

    pub fn is_exceeded(&self, value: Decimal) -> bool {
        value >= self.threshold
    }

    pub fn render_message(&self, reading: &MetricReading) -> String {
        let template = if self.message_template.is_empty() {
            "{level}: {metric} at {value} reached threshold {threshold}"
        } else {
            self.message_template.as_str()
        };
        template
            .replace("{level}", self.level.as_str())
            .replace("{metric}", self.metric.as_str())
            .replace("{value}", &reading.value.normalize().to_string())
            .replace("{threshold}", &self.threshold.normalize().to_string())
            .replace("{subject}", reading.subject.as_deref().unwrap_or("all"))
    }
}

/// A rule evaluation result. Suppressed alerts run no actions.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub rule: BudgetRule,
    pub level: AlertLevel,
    pub sample: CostSample,
    pub sampled_value: Decimal,
    pub subject: Option<String>,
    pub fired_at: DateTime<Utc>,
    pub suppressed: bool,
}

impl Alert {
    pub fn new(rule: BudgetRule, sample: CostSample, reading: MetricReading, suppressed: bool) -> Self {
        Self {
            level: rule.level,
            rule,
            sample,
            sampled_value: reading.value,
            subject: reading.subject,
            fired_at: Utc::now(),
            suppressed,
        }
    }

    pub fn rule_id(&self) -> RuleId {
        self.rule.id()
    }

    pub fn metric(&self) -> Metric {
        self.rule.metric
    }

    pub fn message(&self) -> String {
        self.rule.render_message(&MetricReading {
            value: self.sampled_value,
            subject: self.subject.clone(),
        })
    }
}
