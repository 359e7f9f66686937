//! Freshness contracts for query reads.
//!
//! Every read names its staleness tolerance through [`QueryOptions`], and
//! cached reads come back as [`CacheRead<T>`] carrying when the value was
//! fetched.

use coach_core::Timestamp;
use std::sync::Arc;
use std::time::Duration;

/// Staleness window used by most Coach queries.
pub const STANDARD_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Staleness window for data that rarely changes (enum catalogs).
pub const LONG_LIVED_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Per-read options for [`crate::QueryClient::ensure_fresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long a fetched value is served without revalidation.
    pub stale_after: Duration,
    /// Whether a failed fetch is retried with backoff before rejecting.
    pub retry: bool,
    /// Disabled queries never fetch; they only read what is cached.
    pub enabled: bool,
}

impl QueryOptions {
    /// Ten-minute staleness, no retry.
    pub fn standard() -> Self {
        Self {
            stale_after: STANDARD_STALE_AFTER,
            retry: false,
            enabled: true,
        }
    }

    /// One-hour staleness, no retry.
    pub fn long_lived() -> Self {
        Self::standard().with_stale_after(LONG_LIVED_STALE_AFTER)
    }

    /// Zero staleness: every read revalidates.
    pub fn always_revalidate() -> Self {
        Self::standard().with_stale_after(Duration::ZERO)
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns true if a value fetched at `fetched_at` may still be served at `now`.
    ///
    /// The window is half-open: a value is fresh while its age is strictly
    /// below `stale_after`, so a zero window is never fresh.
    pub fn is_fresh(&self, fetched_at: Timestamp, now: Timestamp) -> bool {
        age(fetched_at, now) < self.stale_after
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::standard()
    }
}

/// Age of a value fetched at `fetched_at`, clamped to zero for clock skew.
pub fn age(fetched_at: Timestamp, now: Timestamp) -> Duration {
    now.signed_duration_since(fetched_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Result of a cache read, carrying freshness metadata.
#[derive(Debug)]
pub struct CacheRead<T> {
    value: Arc<T>,
    /// Absent after `invalidate`: the value is kept but counts as stale.
    fetched_at: Option<Timestamp>,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// A value served from the store.
    pub fn from_cache(value: Arc<T>, fetched_at: Option<Timestamp>) -> Self {
        Self {
            value,
            fetched_at,
            was_cache_hit: true,
        }
    }

    /// A value that was just fetched.
    pub fn from_fetch(value: Arc<T>, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at: Some(fetched_at),
            was_cache_hit: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Shared handle to the cached value.
    pub fn shared(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    pub fn fetched_at(&self) -> Option<Timestamp> {
        self.fetched_at
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    /// How old the value is at `now`; `None` if it has been invalidated.
    pub fn staleness(&self, now: Timestamp) -> Option<Duration> {
        self.fetched_at.map(|at| age(at, now))
    }

    /// Returns true if the value may be served at `now` under `options`.
    pub fn is_fresh(&self, options: &QueryOptions, now: Timestamp) -> bool {
        self.fetched_at
            .map(|at| options.is_fresh(at, now))
            .unwrap_or(false)
    }
}

impl<T> Clone for CacheRead<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
