//! Remediation actions attached to budget rules.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::{Alert, AlertLevel};
use crate::governor::GovernorMode;

/// One remediation step. Every action sets a mode flag; none toggles one,
/// so applying the same action twice leaves the governor where one
/// application did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Write the alert message to the log.
    Log,
    /// Forward the alert to the configured operator notifier.
    Notify {
        #[serde(default)]
        channel: Option<String>,
    },
    DegradeQuality,
    /// Extend cache TTLs for new entries.
    AggressiveCaching,
    DowngradeModel {
        model: String,
    },
    /// Reject this fraction of new admissions.
    Throttle {
        fraction: f64,
    },
    BlockOperations {
        operations: Vec<String>,
    },
    /// Enter `Rejecting` until an operator clears it.
    EmergencyShutdown,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Log => "log",
            Action::Notify { .. } => "notify",
            Action::DegradeQuality => "degrade_quality",
            Action::AggressiveCaching => "aggressive_caching",
            Action::DowngradeModel { .. } => "downgrade_model",
            Action::Throttle { .. } => "throttle",
            Action::BlockOperations { .. } => "block_operations",
            Action::EmergencyShutdown => "emergency_shutdown",
        }
    }

    pub fn apply(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let changed = match self {
            Action::Log => {
                let message = ctx.alert.message();
                match ctx.alert.level {
                    AlertLevel::Info => tracing::info!(rule = %ctx.alert.rule_id(), "{}", message),
                    AlertLevel::Warning => {
                        tracing::warn!(rule = %ctx.alert.rule_id(), "{}", message)
                    }
                    AlertLevel::Critical | AlertLevel::Emergency => {
                        tracing::error!(rule = %ctx.alert.rule_id(), "{}", message)
                    }
                }
                true
            }
            Action::Notify { channel } => {
                let notifier = ctx.notifier.ok_or(ActionError::NotifierMissing)?;
                let notice = OperatorNotice::from_alert(ctx.alert, channel.clone());
                notifier
                    .notify(&notice)
                    .map_err(|e| ActionError::NotifyFailed(e.to_string()))?;
                true
            }
            Action::DegradeQuality => ctx.mode.set_degraded(),
            Action::AggressiveCaching => ctx.mode.set_aggressive_caching(),
            Action::DowngradeModel { model } => {
                if model.trim().is_empty() {
                    return Err(ActionError::Invalid {
                        action: self.name(),
                        reason: "model name is empty".into(),
                    });
                }
                ctx.mode.set_model_override(model.as_str())
            }
            Action::Throttle { fraction } => {
                if !(0.0..=1.0).contains(fraction) {
                    return Err(ActionError::Invalid {
                        action: self.name(),
                        reason: format!("fraction {} outside [0, 1]", fraction),
                    });
                }
                ctx.mode.set_throttle(*fraction)
            }
            Action::BlockOperations { operations } => {
                ctx.mode.block_operations(operations.iter().map(String::as_str))
            }
            Action::EmergencyShutdown => ctx.mode.set_rejecting(ctx.alert.message()),
        };

        Ok(if changed {
            ActionOutcome::Applied
        } else {
            ActionOutcome::Unchanged
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    /// The mode already reflected this action.
    Unchanged,
}

pub struct ActionContext<'a> {
    pub mode: &'a GovernorMode,
    pub notifier: Option<&'a dyn OperatorNotifier>,
    pub alert: &'a Alert,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ActionError {
    #[error("no operator notifier configured")]
    NotifierMissing,

    #[error("operator notification failed: {0}")]
    NotifyFailed(String),

    #[error("invalid {action} action: {reason}")]
    Invalid { action: &'static str, reason: String },

    #[error("{action} action panicked: {message}")]
    Panicked { action: &'static str, message: String },
}

impl ActionError {
    pub fn action(&self) -> &str {
        match self {
            ActionError::NotifierMissing | ActionError::NotifyFailed(_) => "notify",
            ActionError::Invalid { action, .. } | ActionError::Panicked { action, .. } => action,
        }
    }
}

/// What an operator receives from a `notify` action.
#[derive(Clone, Debug, Serialize)]
pub struct OperatorNotice {
    pub level: AlertLevel,
    pub rule: String,
    pub message: String,
    pub subject: Option<String>,
    pub channel: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OperatorNotice {
    pub fn from_alert(alert: &Alert, channel: Option<String>) -> Self {
        Self {
            level: alert.level,
            rule: alert.rule_id().to_string(),
            message: alert.message(),
            subject: alert.subject.clone(),
            channel,
            timestamp: alert.fired_at,
        }
    }
}

/// Delivery of alerts to a human. Implementations must not block for long;
/// they run inside the monitor cycle.
pub trait OperatorNotifier: Send + Sync {
    fn notify(&self, notice: &OperatorNotice)
    -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
