//! Scenario Tests for the Query Client
//!
//! End-to-end walks through the client: the core enums catalog, locally
//! composed state with no fetcher, failure isolation, and retry.

use coach_query::{QueryKey, QueryOptions};
use coach_test_utils::assertions::{assert_fetch_error, assert_not_found};
use coach_test_utils::fixtures::{
    core_enums, core_enums_key, final_prompt_key, manual_clock, one_hour, test_client,
};
use coach_test_utils::{CallLog, CountingFetcher, FailingFetcher, FetchError, ScriptedFetcher};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn core_enums_fetched_shared_and_refetched_after_two_hours() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(CountingFetcher::new(core_enums()));
    let key = core_enums_key();
    let options = QueryOptions::long_lived();
    assert_eq!(options.stale_after, one_hour());

    let (first, second) = tokio::join!(
        client.ensure_fresh::<Value, _>(&key, Arc::clone(&fetcher), &options),
        client.ensure_fresh::<Value, _>(&key, Arc::clone(&fetcher), &options),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(first["coaching_phases"][0], "intro");
    assert!(Arc::ptr_eq(&first, &second));

    let warm = client
        .read::<Value, _>(&key, Arc::clone(&fetcher), &options)
        .await
        .unwrap();
    assert!(warm.was_cache_hit());
    assert_eq!(fetcher.calls(), 1);

    clock.advance(Duration::from_secs(2 * 60 * 60));
    let later = client
        .read::<Value, _>(&key, Arc::clone(&fetcher), &options)
        .await
        .unwrap();
    assert!(!later.was_cache_hit());
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn final_prompt_absent_until_set_then_notified_once() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let key = final_prompt_key();
    let log = CallLog::new();
    let _sub = client
        .cache()
        .subscribe_listener(&key, log.listener("prompt-view"))
        .unwrap();

    assert!(client.get_query_data::<String>(&key).unwrap().is_none());

    let never_called = Arc::new(FailingFetcher::new(FetchError::transport("unused")));
    let disabled = QueryOptions::standard().with_enabled(false);
    let result = client
        .ensure_fresh::<String, _>(&key, Arc::clone(&never_called), &disabled)
        .await;
    assert_not_found(&result, &key);
    assert_eq!(never_called.calls(), 0);

    client
        .set_query_data(&key, "Keep answers short.".to_string())
        .unwrap();
    assert_eq!(log.entries(), vec!["prompt-view"]);

    let value = client.get_query_data::<String>(&key).unwrap().unwrap();
    assert_eq!(value.as_str(), "Keep answers short.");
    let served = client
        .ensure_fresh::<String, _>(&key, never_called, &disabled)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&served, &value));
}

#[tokio::test]
async fn failure_keeps_value_and_notifies_nobody() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let key = QueryKey::from(["identities"]);
    let log = CallLog::new();
    let _sub = client
        .cache()
        .subscribe_listener(&key, log.listener("view"))
        .unwrap();

    client.set_query_data(&key, vec!["coach".to_string()]).unwrap();
    clock.advance(Duration::from_secs(11 * 60));

    let fetcher = Arc::new(FailingFetcher::new(FetchError::status(502, "bad gateway")));
    let result = client
        .ensure_fresh::<Vec<String>, _>(&key, fetcher, &QueryOptions::standard())
        .await;
    assert_fetch_error(&result, &FetchError::status(502, "bad gateway"));

    let kept = client.get_query_data::<Vec<String>>(&key).unwrap().unwrap();
    assert_eq!(*kept, vec!["coach".to_string()]);
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn failed_first_fetch_creates_no_entry() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let key = QueryKey::from(["chat", "history"]).with(42);
    let fetcher = Arc::new(FailingFetcher::new(FetchError::transport("offline")));

    let result = client
        .ensure_fresh::<String, _>(&key, fetcher, &QueryOptions::standard())
        .await;
    assert!(result.is_err());
    assert!(client.cache().inspect(&key).unwrap().is_none());
    assert_eq!(client.cache().entry_count().unwrap(), 0);
}

#[tokio::test]
async fn failure_does_not_poison_later_success() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let key = QueryKey::from(["scenarios"]);
    let fetcher = Arc::new(ScriptedFetcher::new([
        Err(FetchError::transport("offline")),
        Ok("loaded".to_string()),
    ]));
    let options = QueryOptions::standard();

    assert!(client
        .ensure_fresh::<String, _>(&key, Arc::clone(&fetcher), &options)
        .await
        .is_err());
    let value = client
        .ensure_fresh::<String, _>(&key, Arc::clone(&fetcher), &options)
        .await
        .unwrap();
    assert_eq!(value.as_str(), "loaded");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_enabled_calls_fetcher_max_retries_plus_one_times() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let max_retries = client.config().retry.max_retries as usize;
    let fetcher = Arc::new(FailingFetcher::new(FetchError::status(500, "boom")));
    let options = QueryOptions::standard().with_retry(true);

    let result = client
        .ensure_fresh::<String, _>(&QueryKey::from(["retry"]), Arc::clone(&fetcher), &options)
        .await;
    assert_fetch_error(&result, &FetchError::status(500, "boom"));
    assert_eq!(fetcher.calls(), max_retries + 1);

    let stats = client.stats().unwrap();
    assert_eq!(stats.retries, max_retries as u64);
    assert_eq!(stats.failures, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_transient_failures() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(ScriptedFetcher::new([
        Err(FetchError::transport("reset")),
        Err(FetchError::transport("reset")),
        Ok(5u32),
    ]));
    let options = QueryOptions::standard().with_retry(true);

    let started = tokio::time::Instant::now();
    let value = client
        .ensure_fresh::<u32, _>(&QueryKey::from(["flaky"]), Arc::clone(&fetcher), &options)
        .await
        .unwrap();
    assert_eq!(*value, 5);
    assert_eq!(fetcher.calls(), 3);

    let backoff = &client.config().retry;
    assert!(started.elapsed() >= backoff.backoff(0) + backoff.backoff(1));
}

#[tokio::test]
async fn retry_disabled_calls_fetcher_once() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(FailingFetcher::new(FetchError::status(500, "boom")));

    let result = client
        .ensure_fresh::<String, _>(
            &QueryKey::from(["no-retry"]),
            Arc::clone(&fetcher),
            &QueryOptions::standard(),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn invalidate_prefix_refetches_only_matching_keys() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(CountingFetcher::new(1u8));
    let options = QueryOptions::long_lived();
    let chat_a = QueryKey::from(["chat", "a"]);
    let chat_b = QueryKey::from(["chat", "b"]);
    let identity = QueryKey::from(["identity"]);

    for key in [&chat_a, &chat_b, &identity] {
        client.prefetch::<u8, _>(key, Arc::clone(&fetcher), &options).await.unwrap();
    }
    assert_eq!(fetcher.calls(), 3);

    assert_eq!(client.invalidate_prefix(&QueryKey::from(["chat"])).unwrap(), 2);
    for key in [&chat_a, &chat_b, &identity] {
        client.ensure_fresh::<u8, _>(key, Arc::clone(&fetcher), &options).await.unwrap();
    }
    assert_eq!(fetcher.calls(), 5);
}
