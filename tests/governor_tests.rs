//! Request governor integration tests
//!
//! ## Test Scenarios
//!
//! ### 1. Deduplication
//! - Identical concurrent queries share one upstream call
//! - Normalized repeats are served from cache at zero cost
//! - Contexts never share results
//!
//! ### 2. Batching
//! - Full batches dispatch immediately
//! - No batch exceeds `max_size`; no item waits past `max_wait`
//! - Priority order within a batch
//!
//! ### 3. Admission control
//! - Emergency shutdown rejects until cleared
//! - Caller timeouts withdraw queued work, never work already sealed for dispatch
//!
//! ### 4. Configuration
//! - Settings files and hot reload

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cost_governor::{
    DispatchRequest, Error, GovernorRuntime, GovernorSettings, ItemOutcome, NormalizedQuery,
    Outcome, Priority, UpstreamError, UpstreamExecutor,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::Instant;

/// Answers every item after a fixed latency and records each call.
struct ScriptedExecutor {
    latency: Duration,
    cost: Decimal,
    calls: Mutex<Vec<Call>>,
}

#[derive(Clone, Debug)]
struct Call {
    size: usize,
    texts: Vec<String>,
    oldest_wait: Duration,
}

impl ScriptedExecutor {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            cost: dec!(0.02),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamExecutor for ScriptedExecutor {
    async fn invoke(&self, request: &DispatchRequest) -> Result<Vec<ItemOutcome>, UpstreamError> {
        let now = Instant::now();
        self.calls.lock().unwrap().push(Call {
            size: request.len(),
            texts: request.items.iter().map(|q| q.raw_text().to_string()).collect(),
            oldest_wait: request
                .items
                .iter()
                .map(|q| q.waited(now))
                .max()
                .unwrap_or_default(),
        });
        tokio::time::sleep(self.latency).await;
        Ok(request
            .items
            .iter()
            .map(|q| {
                ItemOutcome::success(
                    q.id(),
                    format!("[{}] {}", q.context_key(), q.raw_text()),
                    &request.model,
                    self.cost,
                )
            })
            .collect())
    }
}

/// `RUST_LOG=cost_governor=debug cargo test` shows the governor's logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime(executor: Arc<ScriptedExecutor>, settings: GovernorSettings) -> GovernorRuntime {
    init_tracing();
    let runtime = GovernorRuntime::builder()
        .settings(settings)
        .executor(executor)
        .build()
        .unwrap();
    runtime.start();
    runtime
}

fn query(text: &str, context: &str) -> NormalizedQuery {
    NormalizedQuery::new(text, context, "tester").unwrap()
}

// ============================================================================
// 1. Deduplication
// ============================================================================

mod dedup_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_identical_concurrent_queries_dispatch_once() {
        let executor = ScriptedExecutor::new(Duration::from_millis(500));
        let mut settings = GovernorSettings::default().with_batch(8, Duration::from_millis(100));
        settings.dedup.ttl = Duration::from_secs(60);
        let runtime = runtime(executor.clone(), settings);

        let outcomes: Vec<Outcome> = (0..5)
            .map(|_| {
                runtime
                    .governor()
                    .submit(query("What are your opening hours?", "store"))
                    .unwrap()
            })
            .collect();

        let mut completions = Vec::new();
        for outcome in outcomes {
            completions.push(outcome.resolve().await.unwrap());
        }

        assert_eq!(executor.calls().len(), 1);
        assert_eq!(executor.calls()[0].size, 1);

        let paid: Vec<_> = completions.iter().filter(|c| !c.cost.is_zero()).collect();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].cost, dec!(0.02));
        assert_eq!(completions.iter().filter(|c| c.cached).count(), 4);
        assert!(completions.iter().all(|c| c.content == completions[0].content));

        let metrics = runtime.metrics();
        assert_eq!(metrics.cache_hits, 4);
        assert_eq!(metrics.coalesced, 4);
        assert_eq!(metrics.total_cost, dec!(0.02));

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_normalized_repeat_is_cached() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(
            executor.clone(),
            GovernorSettings::default().with_batch(1, Duration::from_millis(100)),
        );

        let first = runtime
            .governor()
            .submit(query("How do I reset my password?", "support"))
            .unwrap()
            .resolve()
            .await
            .unwrap();
        assert!(!first.cached);

        let again = runtime
            .governor()
            .submit(query("  how do i RESET my password ", "support"))
            .unwrap();
        let Outcome::Cached(hit) = again else {
            panic!("expected a cache hit");
        };
        assert_eq!(hit.content, first.content);
        assert_eq!(hit.cost, Decimal::ZERO);
        assert_eq!(executor.calls().len(), 1);

        let sample = runtime.governor().history().latest();
        assert_eq!(sample.cache_hit_count, 1);
        assert_eq!(sample.total_cost, dec!(0.02));

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_contexts_do_not_share_results() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(
            executor.clone(),
            GovernorSettings::default().with_batch(1, Duration::from_millis(100)),
        );

        let a = runtime.governor().submit(query("hello", "pirate")).unwrap();
        let b = runtime.governor().submit(query("hello", "butler")).unwrap();
        assert!(!a.is_cached() && !b.is_cached());

        assert_eq!(a.resolve().await.unwrap().content, "[pirate] hello");
        assert_eq!(b.resolve().await.unwrap().content, "[butler] hello");
        assert_eq!(executor.calls().len(), 2);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let mut settings = GovernorSettings::default().with_batch(1, Duration::from_millis(100));
        settings.dedup.ttl = Duration::from_secs(60);
        let runtime = runtime(executor.clone(), settings);

        let submit = || runtime.governor().submit(query("weather today", "ctx")).unwrap();
        submit().resolve().await.unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(submit().is_cached());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!submit().resolve().await.unwrap().cached);
        assert_eq!(executor.calls().len(), 2);

        runtime.shutdown().await;
    }
}

// ============================================================================
// 2. Batching
// ============================================================================

mod batching_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_dispatches_immediately() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(
            executor.clone(),
            GovernorSettings::default().with_batch(3, Duration::from_secs(3600)),
        );

        let outcomes: Vec<Outcome> = ["one", "two", "three"]
            .iter()
            .map(|t| runtime.governor().submit(query(t, "ctx")).unwrap())
            .collect();

        let started = Instant::now();
        for outcome in outcomes {
            outcome.resolve().await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].size, 3);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_and_wait_bounds() {
        let executor = ScriptedExecutor::new(Duration::from_millis(20));
        let max_wait = Duration::from_millis(250);
        let runtime = runtime(
            executor.clone(),
            GovernorSettings::default().with_batch(4, max_wait),
        );

        let mut outcomes = Vec::new();
        for i in 0..23 {
            let context = if i % 3 == 0 { "billing" } else { "support" };
            outcomes.push(
                runtime
                    .governor()
                    .submit(query(&format!("question {i}"), context))
                    .unwrap(),
            );
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        for outcome in outcomes {
            outcome.resolve().await.unwrap();
        }

        let calls = executor.calls();
        assert_eq!(calls.iter().map(|c| c.size).sum::<usize>(), 23);
        for call in &calls {
            assert!(call.size <= 4, "batch of {} exceeds max_size", call.size);
            assert!(
                call.oldest_wait <= max_wait,
                "item waited {:?} before dispatch",
                call.oldest_wait
            );
        }

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(
            executor.clone(),
            GovernorSettings::default().with_batch(4, Duration::from_millis(100)),
        );

        let governor = runtime.governor();
        let outcomes = vec![
            governor.submit(query("low first", "ctx").with_priority(Priority::Low)).unwrap(),
            governor.submit(query("medium first", "ctx")).unwrap(),
            governor.submit(query("high", "ctx").with_priority(Priority::High)).unwrap(),
            governor.submit(query("medium second", "ctx")).unwrap(),
        ];
        for outcome in outcomes {
            outcome.resolve().await.unwrap();
        }

        assert_eq!(
            executor.calls()[0].texts,
            vec!["high", "medium first", "medium second", "low first"]
        );

        runtime.shutdown().await;
    }
}

// ============================================================================
// 3. Admission control
// ============================================================================

mod admission_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_emergency_rejects_until_cleared() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(executor.clone(), GovernorSettings::default());

        runtime.mode().set_rejecting("hourly spend above $500");
        for _ in 0..3 {
            let err = runtime.governor().submit(query("anything", "ctx")).unwrap_err();
            assert!(matches!(err, Error::CapacityExceeded { .. }));
        }
        assert_eq!(runtime.governor().assembler().pending(), 0);
        assert_eq!(runtime.metrics().rejections, 3);

        runtime.mode().clear();
        assert!(runtime.governor().submit(query("anything", "ctx")).is_ok());

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_shared_item_for_other_waiters() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(
            executor.clone(),
            GovernorSettings::default().with_batch(8, Duration::from_secs(10)),
        );

        let impatient = runtime.governor().submit(query("slow answer", "ctx")).unwrap();
        let patient = runtime.governor().submit(query("slow answer", "ctx")).unwrap();

        let Outcome::Batched { ticket, .. } = impatient else {
            panic!("expected a batched outcome");
        };
        let err = ticket.wait_timeout(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(runtime.governor().assembler().pending(), 1);

        let completion = patient.resolve().await.unwrap();
        assert_eq!(completion.content, "[ctx] slow answer");
        assert_eq!(executor.calls().len(), 1);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_seal_does_not_dispatch_twice() {
        let executor = ScriptedExecutor::new(Duration::from_secs(10));
        let mut settings = GovernorSettings::default().with_batch(1, Duration::from_millis(50));
        settings.batch.max_concurrent_dispatches = 1;
        let runtime = runtime(executor.clone(), settings);

        let first = runtime.governor().submit(query("first", "ctx")).unwrap();
        let Outcome::Batched { ticket, .. } = runtime.governor().submit(query("second", "ctx")).unwrap()
        else {
            panic!("expected a batched outcome");
        };

        // "second" is sealed and waiting for the only permit.
        let err = ticket.wait_timeout(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(runtime.governor().in_flight(), 2);

        let retry = runtime.governor().submit(query("second", "ctx")).unwrap();
        assert!(!retry.is_cached());
        assert_eq!(runtime.governor().assembler().pending(), 0);

        first.resolve().await.unwrap();
        let completion = retry.resolve().await.unwrap();
        assert_eq!(completion.content, "[ctx] second");

        let calls = executor.calls();
        // Sealed on time, but started only once the permit came free.
        assert!(calls[1].oldest_wait >= Duration::from_secs(10));
        let texts: Vec<Vec<String>> = calls.into_iter().map(|c| c.texts).collect();
        assert_eq!(texts, vec![vec!["first".to_string()], vec!["second".to_string()]]);
        assert_eq!(runtime.governor().in_flight(), 0);

        runtime.shutdown().await;
    }

    #[test]
    fn test_invalid_query_never_enqueued() {
        let err = NormalizedQuery::new("  ?! ", "ctx", "tester").unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }
}

// ============================================================================
// 4. Configuration
// ============================================================================

mod config_tests {
    use std::io::Write;

    use super::*;
    use cost_governor::SettingsLoader;

    #[tokio::test(start_paused = true)]
    async fn test_runtime_from_settings_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"batch": {{"max_size": 2, "max_wait": "1h"}}, "upstream": {{"default_model": "small"}}}}"#
        )
        .unwrap();

        let settings = SettingsLoader::new().path(file.path()).load().unwrap();
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(executor.clone(), settings);

        let a = runtime.governor().submit(query("first", "ctx")).unwrap();
        let b = runtime.governor().submit(query("second", "ctx")).unwrap();
        assert_eq!(a.resolve().await.unwrap().model, "small");
        b.resolve().await.unwrap();
        assert_eq!(executor.calls()[0].size, 2);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_open_batch_sizing() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(
            executor.clone(),
            GovernorSettings::default().with_batch(3, Duration::from_secs(5)),
        );

        let early = runtime.governor().submit(query("early", "ctx")).unwrap();
        runtime
            .settings()
            .publish(GovernorSettings::default().with_batch(1, Duration::from_secs(5)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let late = runtime.governor().submit(query("late", "ctx")).unwrap();
        early.resolve().await.unwrap();
        late.resolve().await.unwrap();

        // The open batch kept max_size 3 and sealed on its max_wait.
        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].size, 2);

        let other = runtime.governor().submit(query("solo", "ctx")).unwrap();
        other.resolve().await.unwrap();
        assert_eq!(executor.calls()[1].size, 1);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_reload_is_rejected() {
        let executor = ScriptedExecutor::new(Duration::ZERO);
        let runtime = runtime(executor, GovernorSettings::default());

        let mut bad = GovernorSettings::default();
        bad.batch.max_wait = Duration::ZERO;
        assert!(runtime.settings().publish(bad).is_err());
        assert_eq!(runtime.governor().assembler().config().max_size, 8);

        runtime.shutdown().await;
    }
}
