//! Prelude module for convenient imports.
//!
//! ```rust
//! use cost_governor::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::Result;

// Runtime
pub use crate::{GovernorRuntime, GovernorRuntimeBuilder};

// Admission
pub use crate::governor::{
    Completion, DispatchRequest, ItemOutcome, Outcome, RequestGovernor, Ticket, UpstreamError,
    UpstreamExecutor,
};
pub use crate::query::{NormalizedQuery, Priority};

// Mode
pub use crate::governor::{GovernorMode, ModeSnapshot, QualityLevel};

// Budget
pub use crate::budget::{Action, AlertLevel, BudgetRule, Metric, OperatorNotifier};

// Configuration
pub use crate::config::{GovernorSettings, SettingsHandle, SettingsLoader};

// Telemetry
pub use crate::observability::{TelemetryEvent, TelemetrySink};
