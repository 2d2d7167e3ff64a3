//! Property-Based Tests for Routing Invariants
//!
//! These tests use property-based testing to check invariants that must
//! hold for any input: pipelines stop at the first failure, redelivery
//! invokes a step at most `maximum + 1` times, delays grow monotonically
//! up to their cap, header lookups ignore case, and unit-of-work callbacks
//! fire exactly once.

use courier_core::{
    BoxError, Exchange, FnProcessor, Headers, Pipeline, Processor, RouteContext,
    UnitOfWorkProcessor,
};
use courier_routing::{ErrorHandlerBuilder, Outcome, RedeliveryPolicy};
use courier_testing::{FlakyProcessor, RecordingSynchronization};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// Strategy for header names in a random mix of cases
fn header_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9-]{0,31}").unwrap()
}

fn flip_case(name: &str, mask: &[bool]) -> String {
    name.chars()
        .zip(mask.iter().cycle())
        .map(|(c, upper)| {
            if *upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

fn counting_step(
    index: usize,
    fail_at: Option<usize>,
    calls: &Arc<AtomicUsize>,
) -> Arc<dyn Processor> {
    let calls = Arc::clone(calls);
    Arc::new(FnProcessor::new(
        format!("step-{}", index),
        move |_: &mut Exchange| -> Result<(), BoxError> {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail_at == Some(index) {
                Err(format!("step {} failed", index).into())
            } else {
                Ok(())
            }
        },
    ))
}

proptest! {
    /// Property: a pipeline runs every step up to and including the first failure, and no further
    #[test]
    fn prop_pipeline_stops_at_first_failure(
        steps in 1usize..12,
        fail_at in prop::option::of(0usize..12)
    ) {
        tokio_test::block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let fail_at = fail_at.filter(|index| *index < steps);
            let pipeline = Pipeline::with_steps(
                "prop",
                (0..steps).map(|i| counting_step(i, fail_at, &calls)).collect(),
            );

            let mut exchange = Exchange::new(RouteContext::new("prop"));
            pipeline.process(&mut exchange).await.expect("pipeline records failures");

            let expected = fail_at.map_or(steps, |index| index + 1);
            prop_assert_eq!(calls.load(Ordering::SeqCst), expected);
            prop_assert_eq!(exchange.is_failed(), fail_at.is_some());
            Ok(())
        })?;
    }

    /// Property: a step that always fails is invoked exactly `maximum_redeliveries + 1` times
    #[test]
    fn prop_redelivery_attempts_are_bounded(maximum in 0i32..6) {
        tokio_test::block_on(async {
            let context = RouteContext::new("prop");
            let flaky = FlakyProcessor::always_failing("down");
            let policy = RedeliveryPolicy::builder()
                .maximum_redeliveries(maximum)
                .redelivery_delay(Duration::ZERO)
                .build()
                .expect("valid policy");
            let handler = ErrorHandlerBuilder::default_error_handler()
                .redelivery_policy(policy)
                .build(&context, Arc::new(flaky.clone()))
                .expect("handler builds");

            let mut exchange = Exchange::new(context);
            let outcome = handler.handle(&mut exchange).await;

            let fatal = matches!(outcome, Outcome::Fatal(_));
            prop_assert!(fatal);
            prop_assert_eq!(flaky.invocations(), maximum as usize + 1);
            prop_assert!(exchange.is_failed());
            Ok(())
        })?;
    }

    /// Property: a step that fails `n <= maximum` times succeeds after exactly `n` redeliveries
    #[test]
    fn prop_transient_failures_recover(maximum in 0i32..6, failures in 0u32..6) {
        prop_assume!(failures as i32 <= maximum);
        tokio_test::block_on(async {
            let context = RouteContext::new("prop");
            let flaky = FlakyProcessor::failing_times(failures as usize, "transient");
            let policy = RedeliveryPolicy::builder()
                .maximum_redeliveries(maximum)
                .redelivery_delay(Duration::ZERO)
                .build()
                .expect("valid policy");
            let handler = ErrorHandlerBuilder::default_error_handler()
                .redelivery_policy(policy)
                .build(&context, Arc::new(flaky.clone()))
                .expect("handler builds");

            let mut exchange = Exchange::new(context);
            let outcome = handler.handle(&mut exchange).await;

            let recovered_after = match outcome {
                Outcome::Success { redeliveries } => Some(redeliveries),
                _ => None,
            };
            prop_assert_eq!(recovered_after, Some(failures));
            prop_assert!(!exchange.is_failed());
            Ok(())
        })?;
    }

    /// Property: exponential back-off never shrinks and never exceeds the maximum delay
    #[test]
    fn prop_backoff_is_monotonic_and_capped(
        base_ms in 1u64..500,
        multiplier in 1.0f64..4.0,
        cap_ms in 1u64..20_000,
    ) {
        let policy = RedeliveryPolicy::builder()
            .redelivery_delay(Duration::from_millis(base_ms))
            .maximum_redelivery_delay(Duration::from_millis(cap_ms))
            .back_off_multiplier(multiplier)
            .use_exponential_back_off(true)
            .build()
            .expect("valid policy");

        let delays: Vec<Duration> = (1..=12).map(|attempt| policy.redelivery_delay_for(attempt)).collect();
        for pair in delays.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        for delay in &delays {
            prop_assert!(*delay <= Duration::from_millis(cap_ms));
        }
    }

    /// Property: collision avoidance keeps the delay within half the configured percentage
    #[test]
    fn prop_collision_avoidance_stays_in_band(
        base_ms in 100u64..10_000,
        percent in 1.0f64..100.0,
    ) {
        let policy = RedeliveryPolicy::builder()
            .redelivery_delay(Duration::from_millis(base_ms))
            .maximum_redelivery_delay(Duration::ZERO)
            .use_collision_avoidance(true)
            .collision_avoidance_percent(percent)
            .build()
            .expect("valid policy");

        let spread = base_ms as f64 * percent / 200.0;
        let delay = policy.redelivery_delay_for(1).as_millis() as f64;
        prop_assert!(delay >= base_ms as f64 - spread - 1.0);
        prop_assert!(delay <= base_ms as f64 + spread + 1.0);
    }

    /// Property: a header is found under any casing of its name, and a re-cased write replaces it
    #[test]
    fn prop_header_lookup_ignores_case(
        name in header_name_strategy(),
        mask in prop::collection::vec(any::<bool>(), 1..8),
        first in any::<i64>(),
        second in any::<i64>(),
    ) {
        let mut headers = Headers::new();
        headers.insert(name.clone(), first);

        let recased = flip_case(&name, &mask);
        prop_assert_eq!(headers.get(&recased).and_then(|v| v.as_i64()), Some(first));

        headers.insert(recased.clone(), second);
        prop_assert_eq!(headers.len(), 1);
        prop_assert_eq!(headers.get(&name).and_then(|v| v.as_i64()), Some(second));
        prop_assert_eq!(headers.names().collect::<Vec<_>>(), vec![recased.as_str()]);
    }

    /// Property: every registered synchronization fires exactly once, on the matching side
    #[test]
    fn prop_synchronizations_fire_once(count in 0usize..8, fail in any::<bool>()) {
        tokio_test::block_on(async {
            let recorders: Vec<RecordingSynchronization> =
                (0..count).map(|_| RecordingSynchronization::new()).collect();
            let registered = recorders.clone();
            let step = FnProcessor::new("register", move |exchange: &mut Exchange| -> Result<(), BoxError> {
                for recorder in &registered {
                    exchange.add_on_completion(recorder.boxed());
                }
                if fail { Err("rejected".into()) } else { Ok(()) }
            });

            let processor = UnitOfWorkProcessor::new(Arc::new(step));
            let mut exchange = Exchange::new(RouteContext::new("prop"));
            let _ = processor.process(&mut exchange).await;

            for recorder in &recorders {
                prop_assert_eq!(recorder.calls(), 1);
                prop_assert_eq!(recorder.failures(), usize::from(fail));
            }
            Ok(())
        })?;
    }
}
