//! Structured tracing, metrics and telemetry for the governor.
//!
//! ## Features
//!
//! - **Built-in metrics**: Counter, Gauge, Histogram for local tracking
//! - **Structured spans**: submit, dispatch and monitor-cycle spans
//! - **Telemetry sinks**: alert events pushed to an external collaborator
//! - **OpenTelemetry** (optional): Export to OTLP-compatible backends
//!
//! ## OpenTelemetry Integration
//!
//! ```toml
//! cost-governor = { version = "0.1", features = ["otel"] }
//! ```
//!
//! ```rust,ignore
//! use cost_governor::observability::{OtelConfig, OtelRuntime};
//!
//! let config = OtelConfig::new("my-service")
//!     .with_endpoint("http://localhost:4317");
//!
//! let runtime = OtelRuntime::init(&config)?;
//! // ... run the governor ...
//! runtime.shutdown(); // Flush before exit
//! ```

mod metrics;
#[cfg(feature = "otel")]
mod otel;
mod spans;
mod telemetry;

pub use metrics::{Counter, Gauge, Histogram, MetricsRegistry, MetricsSummary, RejectReason};
#[cfg(feature = "otel")]
pub use otel::{
    OtelConfig, OtelError, OtelRuntime, SERVICE_NAME_DEFAULT, init_tracing_subscriber, semantic,
};
pub use spans::{DispatchSpan, monitor_cycle_span, submit_span};
pub use telemetry::{
    AlertEvent, ChannelSink, TelemetryError, TelemetryEvent, TelemetrySink, TracingSink,
};

use std::sync::Arc;

/// Observability configuration for a governor runtime.
#[derive(Clone, Default)]
pub struct ObservabilityConfig {
    pub service_name: Option<String>,
    #[cfg(feature = "otel")]
    pub otel: Option<OtelConfig>,
}

impl ObservabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    #[cfg(feature = "otel")]
    pub fn otel(mut self, config: OtelConfig) -> Self {
        self.otel = Some(config);
        self
    }

    pub fn build_registry(&self) -> Arc<MetricsRegistry> {
        #[cfg(feature = "otel")]
        if let Some(ref otel_config) = self.otel {
            return Arc::new(MetricsRegistry::otel(otel_config));
        }

        Arc::new(MetricsRegistry::new())
    }
}
