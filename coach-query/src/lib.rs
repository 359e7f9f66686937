//! Coach Query - Server-State Cache
//!
//! Keyed cache of fetched values with per-key staleness, in-flight fetch
//! deduplication, and change subscriptions for views.
//!
//! - [`QueryCache`]: the store. Holds values, pending fetches, subscribers.
//! - [`QueryClient`]: decides between serving the cache, joining a pending
//!   fetch, or starting one.
//! - [`QueryObserver`]: binds one key to a render callback.

pub mod bridge;
pub mod client;
pub mod config;
pub mod fetcher;
pub mod freshness;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use bridge::{use_query_value, QueryObserver, QueryState, RenderFn};
pub use client::QueryClient;
pub use config::{QueryClientConfig, RetryConfig, CONFIG_ENV_VAR};
pub use fetcher::{fetch_fn, FnFetcher, QueryFetcher};
pub use freshness::{age, CacheRead, QueryOptions, LONG_LIVED_STALE_AFTER, STANDARD_STALE_AFTER};
pub use stats::QueryStats;
pub use store::{
    EntryInfo, ErasedValue, FetchOutcome, Fetched, InflightFetch, Listener, QueryCache,
    Subscription, SubscriptionId,
};
pub use telemetry::{init_tracing, TelemetryError};

pub use coach_core::{
    CacheError, Clock, CoachError, CoachResult, ConfigError, FetchError, KeySegment, ManualClock,
    QueryKey, SystemClock, Timestamp,
};
