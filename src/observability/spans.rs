//! Structured span definitions for tracing.

use std::time::Instant;

use tracing::{Level, Span, field, span};

use crate::query::NormalizedQuery;

/// Span covering one `submit` call. `outcome` is recorded by the governor.
pub fn submit_span(query: &NormalizedQuery) -> Span {
    span!(
        Level::DEBUG,
        "governor.submit",
        query_id = %query.id(),
        fingerprint = query.fingerprint().short(),
        caller_id = query.caller_id(),
        context_key = query.context_key(),
        operation = query.operation(),
        otel.name = "governor.submit",
        outcome = field::Empty,
    )
}

pub fn monitor_cycle_span(cycle: u64) -> Span {
    span!(
        Level::DEBUG,
        "monitor.cycle",
        cycle = cycle,
        otel.name = "monitor.cycle",
        alerts = field::Empty,
        suppressed = field::Empty,
    )
}

/// Helper for tracking one upstream dispatch within a span.
pub struct DispatchSpan {
    span: Span,
    start: Instant,
}

impl DispatchSpan {
    pub fn new(batch_id: &str, context_key: &str, size: usize, model: &str) -> Self {
        let span = span!(
            Level::INFO,
            "governor.dispatch",
            batch_id = batch_id,
            context_key = context_key,
            size = size,
            model = model,
            otel.name = "governor.dispatch",
            succeeded = field::Empty,
            failed = field::Empty,
            cost = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn record_outcome(&self, succeeded: usize, failed: usize, cost: &rust_decimal::Decimal) {
        self.span.record("succeeded", succeeded);
        self.span.record("failed", failed);
        self.span.record("cost", field::display(cost));
    }

    /// Records and returns the elapsed time in milliseconds.
    pub fn finish(self) -> f64 {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("latency_ms", latency_ms);
        latency_ms
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_dispatch_span() {
        let span = DispatchSpan::new("b-1", "default", 3, "medium");
        span.record_outcome(2, 1, &dec!(0.03));
        assert!(span.finish() >= 0.0);
    }

    #[test]
    fn test_submit_span() {
        let query = NormalizedQuery::new("Hello there", "support", "alice").unwrap();
        let span = submit_span(&query);
        span.record("outcome", "batched");
    }
}
