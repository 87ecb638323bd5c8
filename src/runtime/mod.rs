//! Runtime facade: one handle that starts and stops every background task.
//!
//! [`GovernorRuntime::start`] spawns:
//!
//! - the batch dispatcher
//! - the budget monitor under its watchdog
//! - the cache sweep
//! - the settings listener that applies hot reloads
//!
//! [`GovernorRuntime::shutdown`] stops admissions, flushes open batches and
//! waits for every task.

mod builder;

pub use builder::GovernorRuntimeBuilder;

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::budget::BudgetMonitor;
use crate::config::{GovernorSettings, SettingsHandle};
use crate::governor::{GovernorMode, RequestGovernor};
use crate::observability::MetricsSummary;

pub struct GovernorRuntime {
    governor: RequestGovernor,
    monitor: Arc<BudgetMonitor>,
    settings: SettingsHandle,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GovernorRuntime {
    pub fn builder() -> GovernorRuntimeBuilder {
        GovernorRuntimeBuilder::new()
    }

    /// Spawn background tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() || self.shutdown.is_cancelled() {
            return;
        }

        tasks.push(self.governor.spawn_dispatcher(self.shutdown.clone()));
        tasks.push(self.monitor.clone().spawn_supervised(self.shutdown.clone()));
        tasks.push(self.spawn_sweeper());
        tasks.push(self.spawn_settings_listener());
        tracing::info!("Governor runtime started");
    }

    /// Stop admissions, flush open batches and wait for background tasks.
    pub async fn shutdown(&self) {
        self.governor.close();
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Governor runtime stopped");
    }

    pub fn governor(&self) -> &RequestGovernor {
        &self.governor
    }

    pub fn mode(&self) -> &Arc<GovernorMode> {
        self.governor.mode()
    }

    pub fn monitor(&self) -> &Arc<BudgetMonitor> {
        &self.monitor
    }

    /// Publish through this handle to reconfigure a running governor.
    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.governor.metrics().summary()
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let governor = self.governor.clone();
        let shutdown = self.shutdown.clone();
        let period = self.settings.current().dedup.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = governor.cache().purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Expired cache entries swept");
                        }
                    }
                }
            }
        })
    }

    fn spawn_settings_listener(&self) -> JoinHandle<()> {
        let mut updates = self.settings.subscribe();
        let governor = self.governor.clone();
        let monitor = self.monitor.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let settings = updates.borrow_and_update().clone();
                        apply_settings(&governor, &monitor, &settings);
                    }
                }
            }
        })
    }
}

fn apply_settings(governor: &RequestGovernor, monitor: &BudgetMonitor, settings: &GovernorSettings) {
    governor.apply_settings(settings);
    monitor.engine().replace_rules(settings.rules.clone());
    monitor.engine().set_policy(settings.monitor.firing_policy);
    monitor.set_config(settings.monitor.to_config());
    tracing::info!(rules = settings.rules.len(), "Settings applied");
}

impl std::fmt::Debug for GovernorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernorRuntime")
            .field("governor", &self.governor)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::governor::{DispatchRequest, ItemOutcome, Outcome, UpstreamError, UpstreamExecutor};
    use crate::query::NormalizedQuery;

    struct Echo;

    #[async_trait]
    impl UpstreamExecutor for Echo {
        async fn invoke(
            &self,
            request: &DispatchRequest,
        ) -> std::result::Result<Vec<ItemOutcome>, UpstreamError> {
            Ok(request
                .items
                .iter()
                .map(|q| ItemOutcome::success(q.id(), q.raw_text(), &request.model, dec!(0.002)))
                .collect())
        }
    }

    fn runtime(settings: GovernorSettings) -> GovernorRuntime {
        GovernorRuntime::builder()
            .settings(settings)
            .executor(Arc::new(Echo))
            .build()
            .unwrap()
    }

    #[test]
    fn test_executor_is_required() {
        let err = GovernorRuntime::builder().build().unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_invalid_settings_fail_build() {
        let mut settings = GovernorSettings::default();
        settings.batch.max_size = 0;
        let err = GovernorRuntime::builder()
            .settings(settings)
            .executor(Arc::new(Echo))
            .build()
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_submit_shutdown() {
        let runtime = runtime(GovernorSettings::default().with_batch(4, Duration::from_millis(100)));
        runtime.start();
        runtime.start();

        let query = NormalizedQuery::new("What is Rust?", "tutor", "user-1").unwrap();
        let Outcome::Batched { ticket, .. } = runtime.governor().submit(query).unwrap() else {
            panic!("expected a batched outcome");
        };
        assert_eq!(ticket.wait().await.unwrap().content, "What is Rust?");

        runtime.shutdown().await;
        let late = NormalizedQuery::new("too late", "tutor", "user-1").unwrap();
        assert!(runtime.governor().submit(late).is_err());
        assert_eq!(runtime.metrics().batches_dispatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_reload_applies_batch_size() {
        let runtime = runtime(GovernorSettings::default().with_batch(8, Duration::from_secs(30)));
        runtime.start();

        runtime
            .settings()
            .publish(GovernorSettings::default().with_batch(1, Duration::from_secs(30)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runtime.governor().assembler().config().max_size, 1);

        let query = NormalizedQuery::new("instant", "ctx", "user").unwrap();
        let outcome = runtime.governor().submit(query).unwrap();
        let completion = tokio::time::timeout(Duration::from_secs(1), outcome.resolve())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.content, "instant");

        runtime.shutdown().await;
    }
}
