//! Property tests for retry counting, backoff, and the pre-filter

use bytes::Bytes;
use chrono::Utc;
use minibus::config::{ErrorHandlingConfig, RetryConfig, RetryStrategy};
use minibus::dispatch::{classify_outcome, pre_filter, Action, ClassifyContext};
use minibus::handler::Outcome;
use minibus::protocol::{EntityKey, MessageMetadata};
use proptest::prelude::*;

fn context<'a>(
    entity: &'a EntityKey,
    retry: &'a RetryConfig,
    error_handling: &'a ErrorHandlingConfig,
) -> ClassifyContext<'a> {
    ClassifyContext {
        entity,
        app_name: "billing",
        retry,
        error_handling,
    }
}

fn strategy() -> impl Strategy<Value = RetryStrategy> {
    prop_oneof![Just(RetryStrategy::Linear), Just(RetryStrategy::Exponential)]
}

proptest! {
    #[test]
    fn retry_always_increments_by_one(count in 0u32..1000, max in 1u32..2000) {
        prop_assume!(count < max);
        let entity = EntityKey::queue("invoices");
        let retry = RetryConfig { max_retries: max, ..Default::default() };
        let eh = ErrorHandlingConfig::default();
        let mut metadata = MessageMetadata::new();
        if count > 0 {
            metadata.set_retry_count(count);
        }

        let action = classify_outcome(
            &context(&entity, &retry, &eh),
            &Bytes::from_static(b"{}"),
            &metadata,
            None,
            &Outcome::retry("transient"),
            Utc::now(),
        );
        let Action::Republish { message } = action else {
            panic!("expected republish");
        };
        prop_assert_eq!(message.metadata.retry_count(), count + 1);
    }

    #[test]
    fn backoff_is_monotonic(delay in 1u64..3600, attempt in 1u32..60, strategy in strategy()) {
        let retry = RetryConfig { max_retries: 100, delay_secs: delay, strategy };
        let current = retry.backoff(attempt).unwrap();
        let next = retry.backoff(attempt + 1).unwrap();
        prop_assert!(next >= current);
    }

    #[test]
    fn zero_delay_never_schedules(attempt in 1u32..100, strategy in strategy()) {
        let retry = RetryConfig { max_retries: 100, delay_secs: 0, strategy };
        prop_assert_eq!(retry.backoff(attempt), None);
    }

    #[test]
    fn exhaustion_boundary_is_exact(count in 0u32..100, max in 1u32..100) {
        let entity = EntityKey::queue("invoices");
        let retry = RetryConfig { max_retries: max, ..Default::default() };
        let eh = ErrorHandlingConfig::default();
        let mut metadata = MessageMetadata::new();
        metadata.set_retry_count(count);

        let filtered = pre_filter(
            &context(&entity, &retry, &eh),
            "invoices",
            &Bytes::from_static(b"{}"),
            &metadata,
            Utc::now(),
        );
        if count >= max {
            prop_assert!(
                matches!(filtered, Some(Action::DeadLetter { .. })),
                "expected Some(Action::DeadLetter {{ .. }}), got {:?}",
                filtered
            );
        } else {
            prop_assert!(filtered.is_none());
        }
    }

    #[test]
    fn foreign_provenance_always_wins(count in 0u32..100, source in "[a-z]{1,12}") {
        prop_assume!(source != "events");
        let entity = EntityKey::topic("events");
        let retry = RetryConfig { max_retries: 1, ..Default::default() };
        let eh = ErrorHandlingConfig::default();
        let mut metadata = MessageMetadata::new();
        metadata.set_retry_count(count);
        metadata.set_retry_source_entity_path(&source);

        let filtered = pre_filter(
            &context(&entity, &retry, &eh),
            "events",
            &Bytes::from_static(b"{}"),
            &metadata,
            Utc::now(),
        );
        // Never acknowledged, dead-lettered, or routed: always ignored
        prop_assert!(
            matches!(filtered, Some(Action::Ignore { .. })),
            "expected Some(Action::Ignore {{ .. }}), got {:?}",
            filtered
        );
    }

    #[test]
    fn linear_backoff_is_exact(delay in 1u64..600, attempt in 1u32..50) {
        let retry = RetryConfig {
            max_retries: 100,
            delay_secs: delay,
            strategy: RetryStrategy::Linear,
        };
        prop_assert_eq!(
            retry.backoff(attempt),
            Some(std::time::Duration::from_secs(delay * attempt as u64))
        );
    }
}
