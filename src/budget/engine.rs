//! Threshold evaluation with per-rule firing state.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::history::CostSample;
use super::rules::{Alert, BudgetRule, Metric, RuleId};

/// Which exceeded rules of one metric produce alerts in a cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringPolicy {
    /// Only the highest exceeded level fires; lower levels stay quiet.
    #[default]
    HighestOnly,
    AllExceeded,
}

/// `Normal -> Firing -> Cooldown -> Normal`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuleState {
    #[default]
    Normal,
    /// Fired; actions not yet executed.
    Firing,
    Cooldown {
        until: Instant,
    },
}

pub struct ThresholdEngine {
    rules: RwLock<Vec<BudgetRule>>,
    policy: RwLock<FiringPolicy>,
    states: Mutex<HashMap<RuleId, RuleState>>,
}

impl ThresholdEngine {
    pub fn new(rules: Vec<BudgetRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            policy: RwLock::new(FiringPolicy::default()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(self, policy: FiringPolicy) -> Self {
        self.set_policy(policy);
        self
    }

    pub fn policy(&self) -> FiringPolicy {
        *self.policy.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_policy(&self, policy: FiringPolicy) {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn rules(&self) -> Vec<BudgetRule> {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap the rule set. Rules that survive keep their firing state.
    pub fn replace_rules(&self, rules: Vec<BudgetRule>) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.retain(|id, _| rules.iter().any(|r| r.id() == *id));
        tracing::info!(rules = rules.len(), "Budget rules replaced");
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = rules;
    }

    pub fn state(&self, id: RuleId) -> RuleState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    /// Evaluate every rule against `sample`.
    ///
    /// Metrics are independent. A rule already firing or in cooldown yields
    /// a suppressed alert. Alerts come back in rule-list order.
    pub fn evaluate(&self, sample: &CostSample) -> Vec<Alert> {
        let now = Instant::now();
        let rules = self.rules();
        let policy = self.policy();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());

        let mut metrics: Vec<Metric> = Vec::new();
        for rule in &rules {
            if !metrics.contains(&rule.metric) {
                metrics.push(rule.metric);
            }
        }

        let mut alerts = Vec::new();
        for metric in metrics {
            let reading = metric.read(sample);
            let same_metric: Vec<&BudgetRule> =
                rules.iter().filter(|r| r.metric == metric).collect();

            for rule in &same_metric {
                let id = rule.id();
                let elapsed = matches!(
                    states.get(&id),
                    Some(RuleState::Cooldown { until }) if now >= *until
                );
                if elapsed {
                    states.insert(id, RuleState::Normal);
                    tracing::debug!(rule = %id, "Budget rule cooldown elapsed");
                }
            }

            let mut exceeded: Vec<&BudgetRule> = same_metric
                .into_iter()
                .filter(|r| r.is_exceeded(reading.value))
                .collect();
            if policy == FiringPolicy::HighestOnly
                && let Some(highest) = exceeded.iter().copied().max_by_key(|r| r.level)
            {
                exceeded = vec![highest];
            }

            for rule in exceeded {
                let id = rule.id();
                let state = states.entry(id).or_default();
                let suppressed = *state != RuleState::Normal;
                if suppressed {
                    tracing::debug!(rule = %id, value = %reading.value, "Budget alert suppressed");
                } else {
                    *state = RuleState::Firing;
                    tracing::info!(
                        rule = %id,
                        value = %reading.value,
                        threshold = %rule.threshold,
                        "Budget rule firing"
                    );
                }
                alerts.push(Alert::new(
                    rule.clone(),
                    sample.clone(),
                    reading.clone(),
                    suppressed,
                ));
            }
        }
        alerts
    }

    /// Actions for `id` have run; start its cooldown.
    pub fn mark_executed(&self, id: RuleId) {
        let cooldown = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id() == id)
            .map(|r| r.cooldown);
        let Some(cooldown) = cooldown else {
            return;
        };
        let until = Instant::now() + cooldown;
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, RuleState::Cooldown { until });
    }

    /// Return rules stuck in `Firing` to `Normal`, so the next cycle fires
    /// them again. Cooldowns are kept. Returns how many were released.
    pub fn release_firing(&self) -> usize {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        for (id, state) in states.iter_mut() {
            if *state == RuleState::Firing {
                *state = RuleState::Normal;
                released += 1;
                tracing::warn!(rule = %id, "Stale firing state released");
            }
        }
        released
    }

    /// Every rule back to `Normal`.
    pub fn reset(&self) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for ThresholdEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for ThresholdEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdEngine")
            .field("rules", &self.rules().len())
            .field("policy", &self.policy())
            .finish()
    }
}
