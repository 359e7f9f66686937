//! Query controller.
//!
//! [`QueryClient`] answers reads against a [`QueryCache`]: a fresh cached value
//! is returned as is, otherwise the caller joins the key's in-flight fetch or
//! starts one. Fetches run as spawned tasks, so a fetch keeps going and
//! updates the store even if every caller waiting on it goes away.

use std::any::Any;
use std::sync::Arc;

use coach_core::{CacheError, Clock, CoachResult, FetchError, QueryKey, SystemClock};
use futures_util::FutureExt;

use crate::config::QueryClientConfig;
use crate::fetcher::QueryFetcher;
use crate::freshness::{CacheRead, QueryOptions};
use crate::stats::{QueryStats, StatCounters};
use crate::store::{downcast, ErasedValue, FetchOutcome, FetchTicket, Fetched, InflightFetch, QueryCache};

struct ClientInner {
    cache: QueryCache,
    clock: Arc<dyn Clock>,
    config: QueryClientConfig,
    stats: StatCounters,
}

/// Reads cached values, fetching and deduplicating as needed.
///
/// Cloning is cheap; clones share the store, clock, config and counters.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(cache: QueryCache, clock: Arc<dyn Clock>, config: QueryClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                cache,
                clock,
                config,
                stats: StatCounters::default(),
            }),
        }
    }

    /// Client over `cache` with the wall clock and default config.
    pub fn with_defaults(cache: QueryCache) -> Self {
        Self::new(cache, Arc::new(SystemClock), QueryClientConfig::default())
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    pub fn config(&self) -> &QueryClientConfig {
        &self.inner.config
    }

    /// Options from config, for reads that do not bring their own.
    pub fn default_options(&self) -> QueryOptions {
        self.inner.config.default_options()
    }

    /// Return a value for `key` that is fresh under `options`.
    ///
    /// - fresh cached value: returned without calling `fetcher`
    /// - fetch already in flight for `key`: joins it
    /// - otherwise: starts a fetch; on success the store is written and its
    ///   subscribers notified, on failure the store is left as it was
    ///
    /// Every caller attached to one fetch sees the same success or error.
    ///
    /// Must be called from within a Tokio runtime whenever a fetch may start,
    /// since the fetch runs on a spawned task. Fresh hits and disabled reads
    /// never spawn.
    pub async fn ensure_fresh<T, F>(
        &self,
        key: &QueryKey,
        fetcher: Arc<F>,
        options: &QueryOptions,
    ) -> CoachResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: QueryFetcher<T> + ?Sized + 'static,
    {
        Ok(self.read(key, fetcher, options).await?.into_value())
    }

    /// Like [`QueryClient::ensure_fresh`], keeping the freshness metadata.
    /// Must be called from within a Tokio runtime when a fetch may start.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn read<T, F>(
        &self,
        key: &QueryKey,
        fetcher: Arc<F>,
        options: &QueryOptions,
    ) -> CoachResult<CacheRead<T>>
    where
        T: Any + Send + Sync,
        F: QueryFetcher<T> + ?Sized + 'static,
    {
        let cached = self.inner.cache.get::<T>(key)?;

        if !options.enabled {
            return cached.ok_or_else(|| CacheError::NotFound { key: key.clone() }.into());
        }

        if let Some(read) = cached {
            if read.is_fresh(options, self.inner.clock.now()) {
                StatCounters::bump(&self.inner.stats.hits);
                tracing::trace!("cache hit");
                return Ok(read);
            }
        }
        StatCounters::bump(&self.inner.stats.misses);

        let (fetch, started) = self
            .inner
            .cache
            .attach_or_start(key, |ticket| {
                self.spawn_fetch::<T, F>(key.clone(), ticket, fetcher, *options)
            })?;
        if started {
            StatCounters::bump(&self.inner.stats.fetches_started);
            tracing::debug!("fetch started");
        } else {
            StatCounters::bump(&self.inner.stats.deduplicated);
            tracing::debug!("joined in-flight fetch");
        }

        let fetched = fetch.await?;
        let typed = downcast::<T>(key, fetched.value)?;
        Ok(CacheRead::from_fetch(typed, fetched.fetched_at))
    }

    /// Warm the cache for `key` without keeping the value. Must be called from
    /// within a Tokio runtime.
    pub async fn prefetch<T, F>(
        &self,
        key: &QueryKey,
        fetcher: Arc<F>,
        options: &QueryOptions,
    ) -> CoachResult<()>
    where
        T: Any + Send + Sync,
        F: QueryFetcher<T> + ?Sized + 'static,
    {
        self.read::<T, F>(key, fetcher, options).await.map(|_| ())
    }

    /// Cached value for `key` regardless of staleness.
    pub fn get_query_data<T: Any + Send + Sync>(&self, key: &QueryKey) -> CoachResult<Option<Arc<T>>> {
        Ok(self.inner.cache.get::<T>(key)?.map(CacheRead::into_value))
    }

    /// Write `value` for `key` stamped with the client clock, notifying
    /// subscribers. For slots no fetcher owns, such as locally composed state.
    pub fn set_query_data<T: Any + Send + Sync>(&self, key: &QueryKey, value: T) -> CoachResult<()> {
        self.inner.cache.set(key, value, self.inner.clock.now())
    }

    /// Mark `key` stale; the next read refetches.
    pub fn invalidate(&self, key: &QueryKey) -> CoachResult<bool> {
        self.inner.cache.invalidate(key)
    }

    /// Mark every key under `prefix` stale.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> CoachResult<usize> {
        self.inner.cache.invalidate_prefix(prefix)
    }

    pub fn stats(&self) -> CoachResult<QueryStats> {
        let entry_count = self.inner.cache.entry_count()? as u64;
        Ok(self
            .inner
            .stats
            .snapshot(self.inner.cache.notification_count(), entry_count))
    }

    fn spawn_fetch<T, F>(
        &self,
        key: QueryKey,
        ticket: FetchTicket,
        fetcher: Arc<F>,
        options: QueryOptions,
    ) -> InflightFetch
    where
        T: Any + Send + Sync,
        F: QueryFetcher<T> + ?Sized + 'static,
    {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            let mut guard = InflightGuard {
                cache: client.inner.cache.clone(),
                key,
                ticket,
                armed: true,
            };
            let outcome = client
                .run_fetch::<T, F>(&guard.key, fetcher.as_ref(), &options).await;
            guard.armed = false;
            if let Err(e) = client
                .inner
                .cache
                .complete_fetch(&guard.key, ticket, &outcome, options.stale_after)
            {
                tracing::error!(key = %guard.key, error = %e, "failed to record fetch result");
            }
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FetchError::Aborted {
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn run_fetch<T, F>(&self, key: &QueryKey, fetcher: &F, options: &QueryOptions) -> FetchOutcome
    where
        T: Any + Send + Sync,
        F: QueryFetcher<T> + ?Sized,
    {
        let retry = &self.inner.config.retry;
        let mut attempt = 0u32;
        loop {
            match fetcher.fetch(key).await {
                Ok(value) => {
                    let value: ErasedValue = Arc::new(value);
                    return Ok(Fetched {
                        value,
                        fetched_at: self.inner.clock.now(),
                    });
                }
                Err(err) if options.retry && attempt < retry.max_retries => {
                    let delay = retry.backoff(attempt);
                    attempt += 1;
                    StatCounters::bump(&self.inner.stats.retries);
                    tracing::debug!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    StatCounters::bump(&self.inner.stats.failures);
                    tracing::warn!(key = %key, error = %err, attempts = attempt + 1, "fetch failed");
                    return Err(err);
                }
            }
        }
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.inner.cache)
            .field("clock", &self.inner.clock)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Releases the in-flight marker if the fetch task unwinds before settling.
struct InflightGuard {
    cache: QueryCache,
    key: QueryKey,
    ticket: FetchTicket,
    armed: bool,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(key = %self.key, "fetch task ended without a result");
            self.cache.abandon_fetch(&self.key, self.ticket);
        }
    }
}
