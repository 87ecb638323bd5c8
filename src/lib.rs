//! # cost-governor
//!
//! Cost-aware admission, batching and budget governance for expensive
//! upstream generation services (LLM providers).
//!
//! The crate is built from two cooperating halves that share one request
//! stream and one notion of cost:
//!
//! - **Admission & batching**: [`RequestGovernor`] fingerprints each
//!   [`NormalizedQuery`], serves repeats from the [`DeduplicationCache`],
//!   coalesces duplicates already in flight, and groups the rest into
//!   per-context batches through the [`BatchAssembler`].
//! - **Budget governance**: [`BudgetMonitor`] samples the shared
//!   [`CostHistory`], evaluates [`BudgetRule`]s in the [`ThresholdEngine`] and
//!   runs remediation [`Action`]s that flip flags on the shared
//!   [`GovernorMode`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use cost_governor::{
//!     DispatchRequest, GovernorRuntime, GovernorSettings, ItemOutcome, NormalizedQuery,
//!     Outcome, UpstreamError, UpstreamExecutor,
//! };
//! use rust_decimal_macros::dec;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl UpstreamExecutor for Echo {
//!     async fn invoke(&self, request: &DispatchRequest) -> Result<Vec<ItemOutcome>, UpstreamError> {
//!         Ok(request
//!             .items
//!             .iter()
//!             .map(|q| ItemOutcome::success(q.id(), q.raw_text(), &request.model, dec!(0.002)))
//!             .collect())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cost_governor::Error> {
//!     let runtime = GovernorRuntime::builder()
//!         .settings(GovernorSettings::default())
//!         .executor(Arc::new(Echo))
//!         .build()?;
//!     runtime.start();
//!
//!     let query = NormalizedQuery::new("What is Rust?", "tutor", "user-1")?;
//!     match runtime.governor().submit(query)? {
//!         Outcome::Cached(completion) => println!("cached: {}", completion.content),
//!         Outcome::Batched { ticket, .. } => println!("fresh: {}", ticket.wait().await?.content),
//!     }
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod batch;
pub mod budget;
pub mod cache;
pub mod config;
pub mod governor;
pub mod observability;
pub mod prelude;
pub mod query;
pub mod runtime;

pub use batch::{Batch, BatchAssembler, BatchConfig, BatchHandle, BatchId};
pub use budget::{
    Action, ActionContext, ActionError, ActionExecutor, ActionOutcome, Alert, AlertLevel,
    BudgetMonitor, BudgetRule, CostHistory, CostSample, CostSource, ExecutionReport,
    FiringPolicy, Metric, MetricSampler, ModelPricing, MonitorConfig, OperatorNotice,
    OperatorNotifier, PricingTable, PricingTableBuilder, RuleState, ThresholdEngine, UsageEvent,
};
pub use cache::{CacheStats, DeduplicationCache, DeduplicationEntry};
pub use config::{
    BatchSettings, ConfigError, DedupSettings, GovernorSettings, MonitorSettings,
    SettingsHandle, SettingsLoader, UpstreamSettings,
};
pub use governor::{
    AdmissionState, Completion, DispatchRequest, GovernorMode, ItemOutcome, ModeSnapshot,
    Outcome, QualityLevel, RequestGovernor, Ticket, UpstreamError, UpstreamExecutor,
};
pub use observability::{
    AlertEvent, ChannelSink, MetricsRegistry, MetricsSummary, TelemetryError, TelemetryEvent,
    TelemetrySink, TracingSink,
};
pub use query::{Fingerprint, NormalizedQuery, Priority, QueryId};
pub use runtime::{GovernorRuntime, GovernorRuntimeBuilder};

/// Error type for governor operations.
///
/// Query-level variants are returned to the submitting caller only. Systemic
/// variants ([`Error::ActionFailure`]) are contained inside the budget monitor
/// and surface through telemetry rather than through a caller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Empty or unfingerprintable input. Never enqueued.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Governor is rejecting admissions or the throttle fraction was hit.
    #[error("Capacity exceeded: {reason}")]
    CapacityExceeded { reason: String },

    /// The query's operation class is currently blocked by a budget action.
    #[error("Operation '{operation}' is blocked by budget policy")]
    OperationBlocked { operation: String },

    /// Upstream executor reported an error for this item.
    #[error("Upstream failure{}: {message}", model.as_deref().map(|m| format!(" ({m})")).unwrap_or_default())]
    UpstreamFailure {
        message: String,
        model: Option<String>,
    },

    /// A remediation action failed.
    #[error("Action '{action}' failed: {reason}")]
    ActionFailure { action: String, reason: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller-side wait exceeded its timeout.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(std::time::Duration),

    /// The waiter was cancelled before its batch resolved.
    #[error("Query was cancelled before dispatch")]
    Cancelled,

    /// The governor shut down before the query resolved.
    #[error("Governor is shutting down")]
    Shutdown,
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed submissions.
    Admission,
    /// Capacity, budget or timeout limits.
    ResourceLimit,
    /// Upstream failures that may succeed on a later attempt.
    Transient,
    /// Configuration and parsing errors.
    Configuration,
    /// Lifecycle errors (cancellation, shutdown).
    Stateful,
    /// Internal errors (IO, action failures).
    Internal,
}

impl Error {
    pub fn capacity(reason: impl Into<String>) -> Self {
        Error::CapacityExceeded {
            reason: reason.into(),
        }
    }

    pub fn upstream(message: impl Into<String>, model: Option<String>) -> Self {
        Error::UpstreamFailure {
            message: message.into(),
            model,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidQuery(_) => ErrorCategory::Admission,

            Error::CapacityExceeded { .. } | Error::OperationBlocked { .. } | Error::Timeout(_) => {
                ErrorCategory::ResourceLimit
            }

            Error::UpstreamFailure { .. } => ErrorCategory::Transient,

            Error::Config(_) | Error::Json(_) => ErrorCategory::Configuration,

            Error::Cancelled | Error::Shutdown => ErrorCategory::Stateful,

            Error::Io(_) | Error::ActionFailure { .. } => ErrorCategory::Internal,
        }
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_resource_limit(&self) -> bool {
        self.category() == ErrorCategory::ResourceLimit
    }

    /// Whether the caller may resubmit later with a chance of success.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::Timeout(_) | Error::UpstreamFailure { .. }
        )
    }
}

impl From<governor::UpstreamError> for Error {
    fn from(err: governor::UpstreamError) -> Self {
        Error::UpstreamFailure {
            message: err.to_string(),
            model: None,
        }
    }
}

impl From<budget::ActionError> for Error {
    fn from(err: budget::ActionError) -> Self {
        Error::ActionFailure {
            action: err.action().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type for governor operations.
pub type Result<T> = std::result::Result<T, Error>;
