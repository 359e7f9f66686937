//! Query cache walkthrough.
//!
//! Loads configuration (`--config <path>` or `COACH_QUERY_CONFIG`, defaults
//! otherwise), then exercises the core-enums query against an in-process
//! fake backend: a cold fetch, a deduplicated concurrent read, a cache hit,
//! and a refetch once the hour-long window has passed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coach_query::{
    fetch_fn, init_tracing, use_query_value, ConfigError, FetchError, ManualClock, QueryCache,
    QueryClient, QueryClientConfig, QueryKey, QueryOptions,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct CoreEnums {
    coaching_phases: Vec<String>,
}

const CORE_ENUMS_BODY: &str = r#"{"coaching_phases":["intro"]}"#;

type DemoResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> DemoResult<()> {
    let config = match QueryClientConfig::load() {
        Ok(config) => config,
        Err(ConfigError::MissingConfigPath) => QueryClientConfig::default(),
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    init_tracing(&config.log_filter)?;

    let clock = ManualClock::default();
    let client = QueryClient::new(QueryCache::new(), Arc::new(clock.clone()), config);

    let calls = Arc::new(AtomicUsize::new(0));
    let backend_calls = Arc::clone(&calls);
    let fetcher = Arc::new(fetch_fn(move |key: QueryKey| {
        let calls = Arc::clone(&backend_calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tracing::info!(key = %key, "backend request");
            tokio::time::sleep(Duration::from_millis(20)).await;
            serde_json::from_str::<CoreEnums>(CORE_ENUMS_BODY).map_err(FetchError::from)
        }
    }));

    let key = QueryKey::from(["core", "enums"]);
    let options = QueryOptions::long_lived();

    let renders = Arc::new(AtomicUsize::new(0));
    let render_count = Arc::clone(&renders);
    let observer = use_query_value::<CoreEnums, _, _>(
        &client,
        key.clone(),
        Arc::clone(&fetcher),
        options,
        move || {
            render_count.fetch_add(1, Ordering::SeqCst);
        },
    )?;

    let (first, second) = tokio::join!(
        client.ensure_fresh::<CoreEnums, _>(&key, Arc::clone(&fetcher), &options),
        client.ensure_fresh::<CoreEnums, _>(&key, Arc::clone(&fetcher), &options),
    );
    let first = first?;
    second?;
    tracing::info!(
        phases = ?first.coaching_phases,
        backend_calls = calls.load(Ordering::SeqCst),
        "cold read"
    );

    let cached = client.read::<CoreEnums, _>(&key, Arc::clone(&fetcher), &options).await?;
    tracing::info!(cache_hit = cached.was_cache_hit(), "warm read");

    clock.advance(Duration::from_secs(2 * 60 * 60));
    client.ensure_fresh::<CoreEnums, _>(&key, Arc::clone(&fetcher), &options).await?;

    let state = observer.state()?;
    let stats = client.stats()?;
    tracing::info!(
        backend_calls = calls.load(Ordering::SeqCst),
        renders = renders.load(Ordering::SeqCst),
        has_value = state.value.is_some(),
        hits = stats.hits,
        deduplicated = stats.deduplicated,
        fetches = stats.fetches_started,
        "walkthrough complete"
    );

    drop(observer);
    client.cache().clear()?;
    Ok(())
}
