//! Property-Based Tests for Store Subscriptions
//!
//! - subscribe followed by unsubscribe leaves the subscriber list as it was
//! - unsubscribing twice is the same as unsubscribing once
//! - a write notifies the remaining subscribers in registration order, once each

use chrono::Utc;
use coach_query::{QueryCache, QueryKey, Subscription};
use coach_test_utils::generators::{arb_key_pool, arb_query_key};
use coach_test_utils::CallLog;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum SubOp {
    Subscribe,
    /// Unsubscribe the n-th registration made so far (modulo count).
    Unsubscribe(usize),
}

fn arb_ops() -> impl Strategy<Value = Vec<SubOp>> {
    prop::collection::vec(
        prop_oneof![
            Just(SubOp::Subscribe),
            any::<usize>().prop_map(SubOp::Unsubscribe),
        ],
        0..40,
    )
}

#[test]
fn transient_subscriber_leaves_list_unchanged() {
    let cache = QueryCache::new();
    let key = QueryKey::from(["core", "enums"]);
    let log = CallLog::new();
    let _a = cache.subscribe_listener(&key, log.listener("A")).unwrap();
    let _b = cache.subscribe_listener(&key, log.listener("B")).unwrap();

    for _ in 0..10 {
        let transient = cache.subscribe_listener(&key, log.listener("X")).unwrap();
        transient.unsubscribe();
        transient.unsubscribe();
    }
    assert_eq!(cache.subscriber_count(&key).unwrap(), 2);

    cache.set(&key, 1u8, Utc::now()).unwrap();
    assert_eq!(log.entries(), vec!["A", "B"]);
}

#[test]
fn abc_are_notified_in_order() {
    let cache = QueryCache::new();
    let key = QueryKey::from(["identities"]);
    let log = CallLog::new();
    let _a = cache.subscribe_listener(&key, log.listener("A")).unwrap();
    let _b = cache.subscribe_listener(&key, log.listener("B")).unwrap();
    let _c = cache.subscribe_listener(&key, log.listener("C")).unwrap();

    cache.set(&key, "v".to_string(), Utc::now()).unwrap();
    cache.set(&key, "w".to_string(), Utc::now()).unwrap();
    assert_eq!(log.entries(), vec!["A", "B", "C", "A", "B", "C"]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_write_notifies_live_subscribers_in_order(key in arb_query_key(), ops in arb_ops()) {
        let cache = QueryCache::new();
        let log = CallLog::new();
        let mut subs: Vec<(String, Subscription)> = Vec::new();
        let mut live: Vec<bool> = Vec::new();

        for op in ops {
            match op {
                SubOp::Subscribe => {
                    let name = format!("s{}", subs.len());
                    let sub = cache.subscribe_listener(&key, log.listener(&name)).unwrap();
                    subs.push((name, sub));
                    live.push(true);
                }
                SubOp::Unsubscribe(n) if !subs.is_empty() => {
                    let idx = n % subs.len();
                    subs[idx].1.unsubscribe();
                    live[idx] = false;
                }
                SubOp::Unsubscribe(_) => {}
            }
        }

        let expected: Vec<String> = subs
            .iter()
            .zip(&live)
            .filter(|(_, alive)| **alive)
            .map(|((name, _), _)| name.clone())
            .collect();
        prop_assert_eq!(cache.subscriber_count(&key).unwrap(), expected.len());

        cache.set(&key, (), Utc::now()).unwrap();
        prop_assert_eq!(log.entries(), expected);
    }

    #[test]
    fn prop_writes_never_cross_keys(keys in arb_key_pool(3), target in 0usize..3) {
        let cache = QueryCache::new();
        let logs: Vec<CallLog> = keys.iter().map(|_| CallLog::new()).collect();
        let _subs: Vec<Subscription> = keys
            .iter()
            .zip(&logs)
            .map(|(key, log)| cache.subscribe_listener(key, log.listener("s")).unwrap())
            .collect();

        cache.set(&keys[target], 1u8, Utc::now()).unwrap();
        for (i, log) in logs.iter().enumerate() {
            prop_assert_eq!(log.len(), usize::from(i == target));
        }
    }

    #[test]
    fn prop_dropping_every_subscription_prunes_slot(key in arb_query_key(), n in 1usize..10) {
        let cache = QueryCache::new();
        let subs: Vec<Subscription> = (0..n)
            .map(|_| cache.subscribe(&key, |_| {}).unwrap())
            .collect();
        prop_assert_eq!(cache.subscriber_count(&key).unwrap(), n);
        drop(subs);
        prop_assert!(cache.inspect(&key).unwrap().is_none());
    }
}
