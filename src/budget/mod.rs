//! Cost tracking, budget rules and the monitor that enforces them.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

mod actions;
mod engine;
mod executor;
mod history;
mod monitor;
pub mod pricing;
mod rules;
mod sampler;

pub use actions::{
    Action, ActionContext, ActionError, ActionOutcome, OperatorNotice, OperatorNotifier,
};
pub use engine::{FiringPolicy, RuleState, ThresholdEngine};
pub use executor::{ActionExecutor, ExecutionReport};
pub use history::{
    CostHistory, CostSample, CostSource, DEFAULT_HISTORY_CAPACITY, DEFAULT_RATE_WINDOW,
    SampleError, UsageEvent,
};
pub use monitor::{BudgetMonitor, CycleReport, MonitorConfig};
pub use pricing::{ModelPricing, PricingTable, PricingTableBuilder, estimate_tokens};
pub use rules::{Alert, AlertLevel, BudgetRule, DEFAULT_COOLDOWN, Metric, MetricReading, RuleId};
pub use sampler::MetricSampler;

/// Scale factor for storing Decimal costs as AtomicU64 (6 decimal places precision).
pub(crate) const COST_SCALE_FACTOR: Decimal = dec!(1_000_000);

/// Dollars to integer micro-dollars. Negative amounts clamp to zero.
pub fn to_micros(cost: Decimal) -> u64 {
    (cost * COST_SCALE_FACTOR).round().to_u64().unwrap_or(0)
}

pub fn from_micros(micros: u64) -> Decimal {
    Decimal::from(micros) / COST_SCALE_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_conversion() {
        assert_eq!(to_micros(dec!(1.5)), 1_500_000);
        assert_eq!(to_micros(dec!(0.0000004)), 0);
        assert_eq!(to_micros(dec!(-3)), 0);
        assert_eq!(from_micros(250_000), dec!(0.25));
    }
}
