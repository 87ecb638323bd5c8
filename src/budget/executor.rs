//! Runs the actions bound to a fired alert.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;

use super::actions::{Action, ActionContext, ActionError, ActionOutcome, OperatorNotifier};
use super::rules::Alert;
use crate::governor::GovernorMode;
use crate::observability::MetricsRegistry;

/// What happened to each action of one alert.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ExecutionReport {
    pub executed: Vec<(Action, ActionOutcome)>,
    pub failures: Vec<(Action, String)>,
}

impl ExecutionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn applied(&self) -> usize {
        self.executed
            .iter()
            .filter(|(_, outcome)| *outcome == ActionOutcome::Applied)
            .count()
    }
}

/// Applies alert actions to the shared [`GovernorMode`].
///
/// Every action runs in isolation: an error or panic in one is recorded and
/// the remaining actions still run.
pub struct ActionExecutor {
    mode: Arc<GovernorMode>,
    notifier: Option<Arc<dyn OperatorNotifier>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ActionExecutor {
    pub fn new(mode: Arc<GovernorMode>) -> Self {
        Self {
            mode,
            notifier: None,
            metrics: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn OperatorNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn mode(&self) -> &Arc<GovernorMode> {
        &self.mode
    }

    /// Run each bound action once, in rule order. Suppressed alerts run nothing.
    pub fn execute(&self, alert: &Alert) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        if alert.suppressed {
            return report;
        }

        let ctx = ActionContext {
            mode: &self.mode,
            notifier: self.notifier.as_deref(),
            alert,
        };

        for action in &alert.rule.actions {
            match Self::run_isolated(action, &ctx) {
                Ok(outcome) => {
                    tracing::debug!(
                        rule = %alert.rule_id(),
                        action = action.name(),
                        ?outcome,
                        "Budget action executed"
                    );
                    report.executed.push((action.clone(), outcome));
                }
                Err(e) => {
                    tracing::warn!(
                        rule = %alert.rule_id(),
                        action = action.name(),
                        error = %e,
                        "Budget action failed"
                    );
                    if let Some(ref metrics) = self.metrics {
                        metrics.record_action_failure();
                    }
                    report.failures.push((action.clone(), e.to_string()));
                }
            }
        }
        report
    }

    fn run_isolated(
        action: &Action,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, ActionError> {
        catch_unwind(AssertUnwindSafe(|| action.apply(ctx))).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ActionError::Panicked {
                action: action.name(),
                message,
            })
        })
    }
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("mode", &self.mode.snapshot())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::budget::actions::OperatorNotice;
    use crate::budget::history::CostSample;
    use crate::budget::rules::{AlertLevel, BudgetRule, Metric};

    struct PanickingNotifier;

    impl OperatorNotifier for PanickingNotifier {
        fn notify(
            &self,
            _notice: &OperatorNotice,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            panic!("pager offline");
        }
    }

    fn alert_with(actions: Vec<Action>, suppressed: bool) -> Alert {
        let rule = BudgetRule::new(Metric::TotalCost, AlertLevel::Critical, dec!(50))
            .with_actions(actions);
        let mut sample = CostSample::empty();
        sample.total_cost = dec!(60);
        let reading = Metric::TotalCost.read(&sample);
        Alert::new(rule, sample, reading, suppressed)
    }

    #[test]
    fn test_failures_are_isolated() {
        let mode = Arc::new(GovernorMode::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let executor = ActionExecutor::new(mode.clone())
            .with_notifier(Arc::new(PanickingNotifier))
            .with_metrics(metrics.clone());

        let alert = alert_with(
            vec![
                Action::Notify { channel: None },
                Action::Throttle { fraction: 7.0 },
                Action::DegradeQuality,
                Action::DowngradeModel {
                    model: "small".into(),
                },
            ],
            false,
        );

        let report = executor.execute(&alert);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.executed.len(), 2);
        assert!(report.failures[0].1.contains("pager offline"));
        assert_eq!(metrics.action_failures.get(), 2);
        assert_eq!(mode.model_override().as_deref(), Some("small"));
    }

    #[test]
    fn test_suppressed_alert_runs_nothing() {
        let mode = Arc::new(GovernorMode::new());
        let executor = ActionExecutor::new(mode.clone());
        let report = executor.execute(&alert_with(vec![Action::EmergencyShutdown], true));
        assert!(report.executed.is_empty());
        assert!(!mode.is_rejecting());
    }

    #[test]
    fn test_second_execution_is_noop() {
        let mode = Arc::new(GovernorMode::new());
        let executor = ActionExecutor::new(mode);
        let alert = alert_with(vec![Action::AggressiveCaching, Action::Log], false);

        assert_eq!(executor.execute(&alert).applied(), 2);
        // Log always applies; the caching flag is already set.
        assert_eq!(executor.execute(&alert).applied(), 1);
    }
}
