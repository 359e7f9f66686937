//! Integration Tests for Query Observers
//!
//! Observers render for their own key only, never after unmount or a key
//! change, and keep showing the last value when a refresh fails.

use coach_query::{use_query_value, QueryKey, QueryObserver, QueryOptions};
use coach_test_utils::fixtures::{core_enums, core_enums_key, manual_clock, test_client};
use coach_test_utils::{FailingFetcher, FetchError, GatedFetcher, RenderCounter};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn mounted_observer_loads_then_renders() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(GatedFetcher::new(core_enums()));
    let renders = RenderCounter::new();

    let observer = use_query_value::<Value, _, _>(
        &client,
        core_enums_key(),
        Arc::clone(&fetcher),
        QueryOptions::long_lived(),
        renders.render_fn(),
    )
    .unwrap();

    fetcher.wait_started(1).await;
    let loading = observer.state().unwrap();
    assert!(loading.is_loading);
    assert!(loading.is_fetching);
    assert!(loading.value.is_none());

    fetcher.release(1);
    renders.wait_for(1).await;

    let loaded = observer.state().unwrap();
    assert!(!loaded.is_loading);
    assert_eq!(loaded.value.unwrap()["coaching_phases"][0], "intro");
    assert_eq!(renders.count(), 1);
}

#[tokio::test]
async fn disabled_observer_does_not_fetch() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(GatedFetcher::new(0u8));
    let renders = RenderCounter::new();

    let observer = use_query_value::<u8, _, _>(
        &client,
        QueryKey::from(["user", "finalPrompt"]),
        Arc::clone(&fetcher),
        QueryOptions::standard().with_enabled(false),
        renders.render_fn(),
    )
    .unwrap();
    tokio::task::yield_now().await;

    assert_eq!(fetcher.started(), 0);
    let state = observer.state().unwrap();
    assert!(state.value.is_none());
    assert!(!state.is_loading);
}

#[tokio::test]
async fn unmount_before_fetch_settles_suppresses_render() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(GatedFetcher::new(core_enums()));
    let renders = RenderCounter::new();
    let key = core_enums_key();
    let options = QueryOptions::long_lived();

    let mut observer = use_query_value::<Value, _, _>(
        &client,
        key.clone(),
        Arc::clone(&fetcher),
        options,
        renders.render_fn(),
    )
    .unwrap();
    fetcher.wait_started(1).await;
    observer.unmount();
    assert!(!observer.is_mounted());

    fetcher.release(1);
    // Joins the fetch the observer started; returns once the store is written.
    client
        .ensure_fresh::<Value, _>(&key, Arc::clone(&fetcher), &options)
        .await
        .unwrap();

    assert!(client.cache().contains(&key).unwrap());
    assert_eq!(fetcher.started(), 1);
    assert_eq!(renders.count(), 0);
}

#[tokio::test]
async fn dropped_observer_never_renders() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(GatedFetcher::new(3u32));
    let renders = RenderCounter::new();
    let key = QueryKey::from(["identities"]);
    let options = QueryOptions::standard();

    let observer = use_query_value::<u32, _, _>(
        &client,
        key.clone(),
        Arc::clone(&fetcher),
        options,
        renders.render_fn(),
    )
    .unwrap();
    fetcher.wait_started(1).await;
    drop(observer);

    fetcher.release(1);
    client
        .ensure_fresh::<u32, _>(&key, Arc::clone(&fetcher), &options)
        .await
        .unwrap();
    client.set_query_data(&key, 4u32).unwrap();

    assert_eq!(renders.count(), 0);
    assert_eq!(client.cache().subscriber_count(&key).unwrap(), 0);
}

#[tokio::test]
async fn key_change_ignores_old_fetch() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(GatedFetcher::new("old".to_string()));
    let renders = RenderCounter::new();
    let old_key = QueryKey::from(["scenario", "1"]);
    let new_key = QueryKey::from(["scenario", "2"]);
    let options = QueryOptions::standard();

    let mut observer = use_query_value::<String, _, _>(
        &client,
        old_key.clone(),
        Arc::clone(&fetcher),
        options,
        renders.render_fn(),
    )
    .unwrap();
    fetcher.wait_started(1).await;
    observer.set_key(new_key.clone()).unwrap();
    assert_eq!(observer.key(), new_key);

    fetcher.release(1);
    client
        .ensure_fresh::<String, _>(&old_key, Arc::clone(&fetcher), &options)
        .await
        .unwrap();
    assert_eq!(renders.count(), 0);
    assert!(observer.state().unwrap().value.is_none());

    client.set_query_data(&new_key, "new".to_string()).unwrap();
    assert_eq!(renders.count(), 1);
    assert_eq!(observer.state().unwrap().value.unwrap().as_str(), "new");
}

#[tokio::test]
async fn failed_refresh_renders_and_keeps_last_value() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let key = QueryKey::from(["chat", "history"]);
    client.set_query_data(&key, "hello".to_string()).unwrap();
    clock.advance(Duration::from_secs(60 * 60));

    let renders = RenderCounter::new();
    let fetcher = Arc::new(FailingFetcher::new(FetchError::transport("offline")));
    let observer = use_query_value::<String, _, _>(
        &client,
        key.clone(),
        Arc::clone(&fetcher),
        QueryOptions::standard(),
        renders.render_fn(),
    )
    .unwrap();

    renders.wait_for(1).await;
    let state = observer.state().unwrap();
    assert!(state.is_error);
    assert!(!state.is_loading);
    assert_eq!(state.value.unwrap().as_str(), "hello");
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn observers_on_different_keys_are_isolated() {
    let clock = manual_clock();
    let client = test_client(&clock);
    let fetcher = Arc::new(GatedFetcher::new(0u8));
    let a_renders = RenderCounter::new();
    let b_renders = RenderCounter::new();
    let a = QueryKey::from(["a"]);
    let b = QueryKey::from(["b"]);

    let mut a_observer = QueryObserver::<u8, _>::new(
        client.clone(),
        a.clone(),
        Arc::clone(&fetcher),
        QueryOptions::standard(),
        a_renders.render_fn(),
    );
    let mut b_observer = QueryObserver::<u8, _>::new(
        client.clone(),
        b.clone(),
        Arc::clone(&fetcher),
        QueryOptions::standard(),
        b_renders.render_fn(),
    );
    a_observer.mount().unwrap();
    b_observer.mount().unwrap();

    client.set_query_data(&a, 1u8).unwrap();
    client.set_query_data(&a, 2u8).unwrap();
    client.set_query_data(&b, 9u8).unwrap();

    assert_eq!(a_renders.count(), 2);
    assert_eq!(b_renders.count(), 1);
    assert_eq!(*a_observer.state().unwrap().value.unwrap(), 2);
}
