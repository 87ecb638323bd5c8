//! Periodic budget monitor loop and its watchdog.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::engine::ThresholdEngine;
use super::executor::{ActionExecutor, ExecutionReport};
use super::rules::{Alert, RuleId};
use super::sampler::MetricSampler;
use crate::observability::{
    AlertEvent, MetricsRegistry, TelemetryEvent, TelemetrySink, TracingSink, monitor_cycle_span,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// No heartbeat for this long and the watchdog restarts the loop.
    pub stall_threshold: Duration,
    pub restart_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(120),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of one monitor cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub alerts: Vec<Alert>,
    pub executions: Vec<ExecutionReport>,
    /// Set when sampling failed and the cycle was skipped.
    pub error: Option<String>,
}

impl CycleReport {
    pub fn fired(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| !a.suppressed)
    }

    pub fn suppressed(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.suppressed)
    }
}

/// Samples cost, evaluates rules and runs actions on a fixed interval.
pub struct BudgetMonitor {
    sampler: MetricSampler,
    engine: Arc<ThresholdEngine>,
    executor: Arc<ActionExecutor>,
    sink: Arc<dyn TelemetrySink>,
    metrics: Arc<MetricsRegistry>,
    config: RwLock<MonitorConfig>,
    cycles: AtomicU64,
    heartbeat: Mutex<Instant>,
}

impl BudgetMonitor {
    pub fn new(
        sampler: MetricSampler,
        engine: Arc<ThresholdEngine>,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        Self {
            sampler,
            engine,
            executor,
            sink: Arc::new(TracingSink),
            metrics: Arc::new(MetricsRegistry::new()),
            config: RwLock::new(MonitorConfig::default()),
            cycles: AtomicU64::new(0),
            heartbeat: Mutex::new(Instant::now()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(self, config: MonitorConfig) -> Self {
        self.set_config(config);
        self
    }

    pub fn config(&self) -> MonitorConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Takes effect from the next tick.
    pub fn set_config(&self, config: MonitorConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn engine(&self) -> &Arc<ThresholdEngine> {
        &self.engine
    }

    pub fn sampler(&self) -> &MetricSampler {
        &self.sampler
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Sample, evaluate, execute. Never fails; a sampling error skips the cycle.
    pub fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let span = monitor_cycle_span(cycle);
        let _enter = span.enter();
        self.beat();

        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        let sample = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(e) => {
                tracing::error!(cycle, error = %e, "Budget monitor cycle failed");
                self.metrics.record_monitor_cycle(false);
                self.emit(&TelemetryEvent::CycleFailed {
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                report.error = Some(e.to_string());
                return report;
            }
        };

        report.alerts = self.engine.evaluate(&sample);
        for alert in &report.alerts {
            self.metrics.record_alert(alert.suppressed);
            if alert.suppressed {
                continue;
            }
            // Leaves `Firing` even if this iteration unwinds.
            let _cooldown = CooldownOnDrop {
                engine: &self.engine,
                rule: alert.rule_id(),
            };

            tracing::warn!(
                rule = %alert.rule_id(),
                value = %alert.sampled_value,
                "{}",
                alert.message()
            );
            self.emit(&TelemetryEvent::Alert(AlertEvent::from_alert(alert)));

            let execution = self.executor.execute(alert);
            for (action, error) in &execution.failures {
                self.emit(&TelemetryEvent::ActionFailed {
                    rule: alert.rule_id().to_string(),
                    action: action.name().to_string(),
                    error: error.clone(),
                    timestamp: Utc::now(),
                });
            }
            report.executions.push(execution);
        }

        span.record("alerts", report.fired().count());
        span.record("suppressed", report.suppressed().count());
        self.metrics.record_monitor_cycle(true);
        report
    }

    /// Fire-and-forget. Sink errors and panics are counted and logged.
    fn emit(&self, event: &TelemetryEvent) {
        let error = match catch_unwind(AssertUnwindSafe(|| self.sink.emit(event))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| format!("sink panicked: {s}"))
                .or_else(|| {
                    payload
                        .downcast_ref::<String>()
                        .map(|s| format!("sink panicked: {s}"))
                })
                .unwrap_or_else(|| "sink panicked".to_string()),
        };
        self.metrics.record_telemetry_failure();
        tracing::warn!(kind = event.kind(), error = %error, "Telemetry emit failed");
    }

    fn beat(&self) {
        *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn since_heartbeat(&self) -> Duration {
        self.heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// The monitor loop. Runs one cycle per interval until cancelled.
    #[tracing::instrument(skip_all, name = "budget_monitor")]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut period = self.config().interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?period, "Budget monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Budget monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle();

                    let configured = self.config().interval;
                    if configured != period {
                        period = configured;
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        tracing::info!(interval = ?period, "Budget monitor interval changed");
                    }
                }
            }
            self.beat();
        }
    }

    /// Spawn the loop under a watchdog that re-arms it when it panics, exits
    /// unexpectedly or stops advancing.
    pub fn spawn_supervised(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.beat();
                let worker = tokio::spawn(self.clone().run(shutdown.clone()));
                let Some(reason) = self.supervise(worker, &shutdown).await else {
                    break;
                };

                self.metrics.record_monitor_restart();
                let released = self.engine.release_firing();
                tracing::error!(reason = %reason, released, "Budget monitor restarting");
                self.emit(&TelemetryEvent::MonitorRestarted {
                    reason,
                    timestamp: Utc::now(),
                });

                let backoff = self.config().restart_backoff;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        })
    }

    /// Waits on the worker. `None` means a clean shutdown.
    async fn supervise(
        &self,
        mut worker: JoinHandle<()>,
        shutdown: &CancellationToken,
    ) -> Option<String> {
        loop {
            let check = (self.config().stall_threshold / 2).max(Duration::from_millis(10));
            tokio::select! {
                result = &mut worker => {
                    if shutdown.is_cancelled() {
                        return None;
                    }
                    return Some(match result {
                        Err(e) if e.is_panic() => "monitor task panicked".to_string(),
                        Err(e) => format!("monitor task aborted: {}", e),
                        Ok(()) => "monitor loop exited".to_string(),
                    });
                }
                _ = tokio::time::sleep(check) => {
                    let stalled_for = self.since_heartbeat();
                    if !shutdown.is_cancelled() && stalled_for > self.config().stall_threshold {
                        worker.abort();
                        return Some(format!("monitor stalled for {:?}", stalled_for));
                    }
                }
            }
        }
    }
}

/// Starts the rule's cooldown when dropped.
struct CooldownOnDrop<'a> {
    engine: &'a ThresholdEngine,
    rule: RuleId,
}

impl Drop for CooldownOnDrop<'_> {
    fn drop(&mut self) {
        self.engine.mark_executed(self.rule);
    }
}

impl std::fmt::Debug for BudgetMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetMonitor")
            .field("config", &self.config())
            .field("cycles", &self.cycles())
            .finish()
    }
}
