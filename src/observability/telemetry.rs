//! Structured events pushed to an external telemetry collaborator.
//!
//! Emission is fire-and-forget: a failing sink is logged and counted, never
//! propagated into request processing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::budget::{Alert, AlertLevel, Metric};

/// Payload for a fired, non-suppressed alert.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub metric: Metric,
    pub threshold: Decimal,
    pub sampled_value: Decimal,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            level: alert.level,
            metric: alert.metric(),
            threshold: alert.rule.threshold,
            sampled_value: alert.sampled_value,
            message: alert.message(),
            subject: alert.subject.clone(),
            timestamp: alert.fired_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Alert(AlertEvent),
    ActionFailed {
        rule: String,
        action: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    CycleFailed {
        error: String,
        timestamp: DateTime<Utc>,
    },
    MonitorRestarted {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::Alert(_) => "alert",
            TelemetryEvent::ActionFailed { .. } => "action_failed",
            TelemetryEvent::CycleFailed { .. } => "cycle_failed",
            TelemetryEvent::MonitorRestarted { .. } => "monitor_restarted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry sink closed")]
    Closed,

    #[error("telemetry sink full")]
    Full,

    #[error("telemetry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError>;
}

/// Writes events as JSON through `tracing` under the `governor::telemetry` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let payload = serde_json::to_string(event)?;
        match event {
            TelemetryEvent::Alert(alert) if alert.level >= AlertLevel::Critical => {
                tracing::error!(target: "governor::telemetry", kind = event.kind(), %payload)
            }
            TelemetryEvent::Alert(alert) if alert.level == AlertLevel::Warning => {
                tracing::warn!(target: "governor::telemetry", kind = event.kind(), %payload)
            }
            TelemetryEvent::Alert(_) => {
                tracing::info!(target: "governor::telemetry", kind = event.kind(), %payload)
            }
            _ => tracing::warn!(target: "governor::telemetry", kind = event.kind(), %payload),
        }
        Ok(())
    }
}

/// Bounded channel sink. A full channel drops the event rather than block.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TelemetryError::Full,
            mpsc::error::TrySendError::Closed(_) => TelemetryError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::budget::{BudgetRule, CostSample};

    fn alert() -> Alert {
        let rule = BudgetRule::new(Metric::TotalCost, AlertLevel::Warning, dec!(10));
        let mut sample = CostSample::empty();
        sample.total_cost = dec!(12);
        let reading = Metric::TotalCost.read(&sample);
        Alert::new(rule, sample, reading, false)
    }

    #[test]
    fn test_alert_event_shape() {
        let event = TelemetryEvent::Alert(AlertEvent::from_alert(&alert()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "alert");
        assert_eq!(json["level"], "warning");
        assert_eq!(json["metric"], "total_cost");
        assert_eq!(json["threshold"], "10");
        assert_eq!(json["sampled_value"], "12");
        assert!(json.get("subject").is_none());
        assert!(json["message"].as_str().unwrap().contains("total_cost"));
    }

    #[test]
    fn test_tracing_sink() {
        let event = TelemetryEvent::CycleFailed {
            error: "source down".into(),
            timestamp: Utc::now(),
        };
        assert!(TracingSink.emit(&event).is_ok());
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::new(1);
        let event = TelemetryEvent::Alert(AlertEvent::from_alert(&alert()));

        sink.emit(&event).unwrap();
        assert!(matches!(sink.emit(&event), Err(TelemetryError::Full)));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), "alert");

        drop(rx);
        assert!(matches!(sink.emit(&event), Err(TelemetryError::Closed)));
    }
}
