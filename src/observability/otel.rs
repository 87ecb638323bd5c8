//! OpenTelemetry integration for tracing and metrics export.

use std::time::Duration;

use opentelemetry::{InstrumentationScope, KeyValue, global};
use opentelemetry_otlp::{MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::metrics::RejectReason;

pub const SERVICE_NAME_DEFAULT: &str = "cost-governor";

#[derive(Debug, Clone)]
pub struct OtelConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub otlp_endpoint: String,
    pub traces_enabled: bool,
    pub metrics_enabled: bool,
    pub metrics_export_interval: Duration,
    pub sample_ratio: f64,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_DEFAULT.to_string(),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: "http://localhost:4317".to_string(),
            traces_enabled: true,
            metrics_enabled: true,
            metrics_export_interval: Duration::from_secs(60),
            sample_ratio: 1.0,
        }
    }
}

impl OtelConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    pub fn with_traces(mut self, enabled: bool) -> Self {
        self.traces_enabled = enabled;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_export_interval = interval;
        self
    }

    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.sample_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = endpoint;
        }

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG")
            && let Ok(r) = ratio.parse::<f64>()
        {
            config.sample_ratio = r.clamp(0.0, 1.0);
        }

        config
    }

    pub(crate) fn scope(&self) -> InstrumentationScope {
        let mut builder = InstrumentationScope::builder(self.service_name.clone());
        if let Some(ref version) = self.service_version {
            builder = builder.with_version(version.clone());
        }
        builder.build()
    }

    fn build_resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new(SERVICE_NAME, self.service_name.clone())];

        if let Some(ref version) = self.service_version {
            attributes.push(KeyValue::new(SERVICE_VERSION, version.clone()));
        }

        Resource::builder().with_attributes(attributes).build()
    }

    fn sampler(&self) -> Sampler {
        if self.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_ratio)
        }
    }

    fn tracer_provider(&self) -> Result<SdkTracerProvider, OtelError> {
        let exporter = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}/v1/traces", self.otlp_endpoint))
            .build()
            .map_err(|e| OtelError::Init(format!("Failed to create span exporter: {}", e)))?;

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(self.sampler())
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.build_resource())
            .build())
    }
}

/// Holds the tracer and meter providers. Call `shutdown()` before exit to flush.
pub struct OtelRuntime {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl OtelRuntime {
    pub fn init(config: &OtelConfig) -> Result<Self, OtelError> {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let tracer_provider = if config.traces_enabled {
            let provider = config.tracer_provider()?;
            global::set_tracer_provider(provider.clone());
            Some(provider)
        } else {
            None
        };

        let meter_provider = if config.metrics_enabled {
            Some(Self::init_metrics(config)?)
        } else {
            None
        };

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }

    fn init_metrics(config: &OtelConfig) -> Result<SdkMeterProvider, OtelError> {
        let exporter = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}/v1/metrics", config.otlp_endpoint))
            .build()
            .map_err(|e| OtelError::Init(format!("Failed to create metric exporter: {}", e)))?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(config.metrics_export_interval)
            .build();

        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(config.build_resource())
            .build();

        global::set_meter_provider(provider.clone());

        Ok(provider)
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!("Failed to shutdown tracer provider: {:?}", e);
        }

        if let Some(provider) = self.meter_provider
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}

/// Install a global subscriber exporting spans over OTLP, optionally with
/// console output. Filter comes from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing_subscriber(config: &OtelConfig, with_console: bool) -> Result<(), OtelError> {
    let provider = config.tracer_provider()?;
    global::set_tracer_provider(provider);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let otel_layer = OpenTelemetryLayer::new(global::tracer_with_scope(config.scope()));
    let fmt_layer = with_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| OtelError::Init(format!("Failed to init subscriber: {}", e)))
}

#[derive(Debug, thiserror::Error)]
pub enum OtelError {
    #[error("OpenTelemetry initialization failed: {0}")]
    Init(String),

    #[error("OpenTelemetry export failed: {0}")]
    Export(String),
}

/// Attribute keys for governor spans and metrics.
pub mod semantic {
    pub const GOVERNOR_CALLER_ID: &str = "governor.caller.id";
    pub const GOVERNOR_CONTEXT_KEY: &str = "governor.context.key";
    pub const GOVERNOR_BATCH_ID: &str = "governor.batch.id";
    pub const GOVERNOR_BATCH_SIZE: &str = "governor.batch.size";
    pub const GOVERNOR_MODEL: &str = "governor.model";
    pub const GOVERNOR_REJECT_REASON: &str = "governor.reject.reason";
    pub const GOVERNOR_ALERT_LEVEL: &str = "governor.alert.level";
    pub const GOVERNOR_COST_USD: &str = "governor.cost.usd";
}

/// Mirrors the built-in MetricsRegistry into OpenTelemetry instruments.
pub struct OtelMetricsBridge {
    submissions: opentelemetry::metrics::Counter<u64>,
    cache_lookups: opentelemetry::metrics::Counter<u64>,
    rejections: opentelemetry::metrics::Counter<u64>,
    batches: opentelemetry::metrics::Counter<u64>,
    batch_size: opentelemetry::metrics::Histogram<u64>,
    dispatch_latency: opentelemetry::metrics::Histogram<f64>,
    alerts: opentelemetry::metrics::Counter<u64>,
    cost_total: opentelemetry::metrics::Counter<f64>,
}

impl OtelMetricsBridge {
    pub fn new(meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            submissions: meter
                .u64_counter("governor.submissions")
                .with_description("Queries submitted to the governor")
                .build(),
            cache_lookups: meter
                .u64_counter("governor.cache.lookups")
                .with_description("Deduplication cache lookups by result")
                .build(),
            rejections: meter
                .u64_counter("governor.rejections")
                .with_description("Admissions refused by reason")
                .build(),
            batches: meter
                .u64_counter("governor.batches")
                .with_description("Batches dispatched upstream")
                .build(),
            batch_size: meter
                .u64_histogram("governor.batch.size")
                .with_description("Items per dispatched batch")
                .build(),
            dispatch_latency: meter
                .f64_histogram("governor.dispatch.latency")
                .with_description("Upstream dispatch latency in milliseconds")
                .with_unit("ms")
                .build(),
            alerts: meter
                .u64_counter("governor.alerts")
                .with_description("Budget alerts by suppression")
                .build(),
            cost_total: meter
                .f64_counter("governor.cost.total")
                .with_description("Upstream spend in USD")
                .with_unit("USD")
                .build(),
        }
    }

    pub fn record_submission(&self) {
        self.submissions.add(1, &[]);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        self.cache_lookups
            .add(1, &[KeyValue::new("result", if hit { "hit" } else { "miss" })]);
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        self.rejections.add(
            1,
            &[KeyValue::new(semantic::GOVERNOR_REJECT_REASON, reason.as_str())],
        );
    }

    pub fn record_dispatch(&self, size: u64, latency_ms: f64, success: bool) {
        let attrs = [KeyValue::new("success", success)];
        self.batches.add(1, &attrs);
        self.batch_size.record(size, &[]);
        self.dispatch_latency.record(latency_ms, &attrs);
    }

    pub fn record_alert(&self, suppressed: bool) {
        self.alerts.add(1, &[KeyValue::new("suppressed", suppressed)]);
    }

    pub fn record_cost(&self, cost: Decimal) {
        self.cost_total.add(cost.to_f64().unwrap_or(0.0), &[]);
    }
}
