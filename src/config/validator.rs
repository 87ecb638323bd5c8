//! Settings validation.
//!
//! All problems are collected before reporting so one pass surfaces every
//! mistake in a settings file.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use rust_decimal::Decimal;

use super::settings::GovernorSettings;
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::budget::{Action, AlertLevel, BudgetRule, Metric};

pub fn validate(settings: &GovernorSettings) -> ConfigResult<()> {
    let errors = collect_errors(settings);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
    }
}

pub fn collect_errors(settings: &GovernorSettings) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let mut check = |ok: bool, key: &str, message: &str| {
        if !ok {
            errors.push(invalid(key, message));
        }
    };

    let batch = &settings.batch;
    check(batch.max_size >= 1, "batch.max_size", "must be at least 1");
    check(!batch.max_wait.is_zero(), "batch.max_wait", "must be positive");
    check(
        batch.max_concurrent_dispatches >= 1,
        "batch.max_concurrent_dispatches",
        "must be at least 1",
    );

    let dedup = &settings.dedup;
    check(!dedup.ttl.is_zero(), "dedup.ttl", "must be positive");
    check(dedup.max_entries >= 1, "dedup.max_entries", "must be at least 1");
    check(
        dedup.aggressive_ttl_multiplier >= 1,
        "dedup.aggressive_ttl_multiplier",
        "must be at least 1",
    );
    check(
        !dedup.sweep_interval.is_zero(),
        "dedup.sweep_interval",
        "must be positive",
    );

    let monitor = &settings.monitor;
    check(!monitor.interval.is_zero(), "monitor.interval", "must be positive");
    check(
        monitor.stall_threshold > monitor.interval,
        "monitor.stall_threshold",
        "must exceed monitor.interval",
    );
    check(
        monitor.history_capacity >= 1,
        "monitor.history_capacity",
        "must be at least 1",
    );
    check(
        monitor.rate_window >= Duration::from_secs(1),
        "monitor.rate_window",
        "must be at least 1s",
    );

    let upstream = &settings.upstream;
    check(
        !upstream.default_model.trim().is_empty(),
        "upstream.default_model",
        "must not be empty",
    );
    check(
        upstream.standard_max_tokens >= 1,
        "upstream.standard_max_tokens",
        "must be at least 1",
    );
    check(
        (1..=upstream.standard_max_tokens).contains(&upstream.degraded_max_tokens),
        "upstream.degraded_max_tokens",
        "must be between 1 and upstream.standard_max_tokens",
    );

    for (model, pricing) in &settings.pricing {
        if pricing.input_per_mtok.is_sign_negative() || pricing.output_per_mtok.is_sign_negative() {
            errors.push(invalid(&format!("pricing.{model}"), "prices must not be negative"));
        }
    }

    errors.extend(rule_errors(&settings.rules));
    errors
}

fn rule_errors(rules: &[BudgetRule]) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut ladders: BTreeMap<Metric, Vec<(AlertLevel, Decimal)>> = BTreeMap::new();

    for (idx, rule) in rules.iter().enumerate() {
        let key = format!("rules[{idx}]");

        if rule.threshold.is_sign_negative() {
            errors.push(invalid(&format!("{key}.threshold"), "must not be negative"));
        }
        if !seen.insert(rule.id()) {
            errors.push(invalid(
                &key,
                &format!("duplicate rule for {} at level {}", rule.metric, rule.level),
            ));
        }
        ladders
            .entry(rule.metric)
            .or_default()
            .push((rule.level, rule.threshold));

        for (action_idx, action) in rule.actions.iter().enumerate() {
            if let Err(message) = check_action(action) {
                errors.push(invalid(&format!("{key}.actions[{action_idx}]"), &message));
            }
        }
    }

    for (metric, mut ladder) in ladders {
        ladder.sort_by_key(|(level, _)| *level);
        for pair in ladder.windows(2) {
            let ((low_level, low), (high_level, high)) = (pair[0], pair[1]);
            if low_level != high_level && high <= low {
                errors.push(invalid(
                    &format!("rules.{metric}"),
                    &format!(
                        "{high_level} threshold {high} must be above {low_level} threshold {low}"
                    ),
                ));
            }
        }
    }

    errors
}

fn check_action(action: &Action) -> Result<(), String> {
    match action {
        Action::Throttle { fraction } if !(0.0..=1.0).contains(fraction) => {
            Err(format!("throttle fraction {fraction} is outside [0, 1]"))
        }
        Action::DowngradeModel { model } if model.trim().is_empty() => {
            Err("downgrade model must not be empty".to_string())
        }
        Action::BlockOperations { operations } if operations.is_empty() => {
            Err("block_operations needs at least one operation".to_string())
        }
        _ => Ok(()),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
