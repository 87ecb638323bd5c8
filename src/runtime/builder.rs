//! Runtime builder.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::GovernorRuntime;
use crate::budget::{
    ActionExecutor, BudgetMonitor, CostHistory, CostSource, MetricSampler, OperatorNotifier,
    ThresholdEngine,
};
use crate::config::{ConfigError, GovernorSettings, SettingsHandle};
use crate::governor::{GovernorMode, RequestGovernor, UpstreamExecutor};
use crate::observability::{ObservabilityConfig, TelemetrySink};

/// Wires the governor and the budget monitor around one mode, one cost
/// history and one metrics registry.
#[derive(Default)]
pub struct GovernorRuntimeBuilder {
    settings: Option<GovernorSettings>,
    executor: Option<Arc<dyn UpstreamExecutor>>,
    sink: Option<Arc<dyn TelemetrySink>>,
    notifier: Option<Arc<dyn OperatorNotifier>>,
    cost_source: Option<Arc<dyn CostSource>>,
    observability: ObservabilityConfig,
}

impl GovernorRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: GovernorSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Required.
    pub fn executor(mut self, executor: Arc<dyn UpstreamExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Alert destination. Defaults to [`TracingSink`](crate::TracingSink).
    pub fn sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn OperatorNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sample cost from somewhere other than the governor's own history.
    pub fn cost_source(mut self, source: Arc<dyn CostSource>) -> Self {
        self.cost_source = Some(source);
        self
    }

    pub fn observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability = config;
        self
    }

    pub fn build(self) -> crate::Result<GovernorRuntime> {
        let executor = self.executor.ok_or_else(|| ConfigError::InvalidValue {
            key: "executor".to_string(),
            message: "an upstream executor is required".to_string(),
        })?;
        let settings = self.settings.unwrap_or_default();
        let handle = SettingsHandle::new(settings.clone())?;

        let metrics = self.observability.build_registry();
        let mode = Arc::new(GovernorMode::new());
        let history = Arc::new(CostHistory::new(
            settings.monitor.history_capacity,
            settings.monitor.rate_window,
        ));

        let governor = RequestGovernor::with_parts(
            executor,
            &settings,
            mode.clone(),
            history.clone(),
            metrics.clone(),
        );

        let engine = Arc::new(
            ThresholdEngine::new(settings.rules.clone()).with_policy(settings.monitor.firing_policy),
        );
        let mut actions = ActionExecutor::new(mode).with_metrics(metrics.clone());
        if let Some(notifier) = self.notifier {
            actions = actions.with_notifier(notifier);
        }

        let source = self
            .cost_source
            .unwrap_or_else(|| history as Arc<dyn CostSource>);
        let mut monitor = BudgetMonitor::new(MetricSampler::new(source), engine, Arc::new(actions))
            .with_metrics(metrics)
            .with_config(settings.monitor.to_config());
        if let Some(sink) = self.sink {
            monitor = monitor.with_sink(sink);
        }

        tracing::debug!(
            rules = settings.rules.len(),
            max_size = settings.batch.max_size,
            max_wait = ?settings.batch.max_wait,
            service = self.observability.service_name.as_deref().unwrap_or("cost-governor"),
            "Governor runtime built"
        );

        Ok(GovernorRuntime {
            governor,
            monitor: Arc::new(monitor),
            settings: handle,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}
