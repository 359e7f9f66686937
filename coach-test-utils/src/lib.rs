//! Coach Test Utilities
//!
//! Shared test infrastructure for the Coach workspace:
//! - Mock fetchers that count, gate, fail, or follow a script
//! - Recorders for subscriber and render callbacks
//! - Proptest generators for keys
//! - Fixtures for clients and the standard scenarios
//! - Assertions for the error taxonomy

pub use coach_core::{
    CacheError, Clock, CoachError, CoachResult, FetchError, KeySegment, ManualClock, QueryKey,
    Timestamp,
};
pub use coach_query::{Listener, QueryCache, QueryClient, QueryClientConfig, QueryFetcher};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

// ============================================================================
// MOCK FETCHERS
// ============================================================================

/// Returns a clone of a fixed value and counts invocations.
#[derive(Debug)]
pub struct CountingFetcher<T> {
    value: T,
    calls: AtomicUsize,
}

impl<T: Clone + Send + Sync> CountingFetcher<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> QueryFetcher<T> for CountingFetcher<T> {
    async fn fetch(&self, _key: &QueryKey) -> Result<T, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value.clone())
    }
}

/// Fetcher that blocks every invocation until the test releases it.
///
/// Lets a test hold a fetch in flight while it issues more reads.
#[derive(Debug)]
pub struct GatedFetcher<T> {
    value: T,
    gate: Semaphore,
    started: AtomicUsize,
    started_changed: Notify,
}

impl<T: Clone + Send + Sync> GatedFetcher<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            started_changed: Notify::new(),
        }
    }

    /// Number of invocations that have begun (released or not).
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Let `n` waiting (or future) invocations complete.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Wait until at least `n` invocations have begun.
    pub async fn wait_started(&self, n: usize) {
        loop {
            let changed = self.started_changed.notified();
            if self.started() >= n {
                return;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> QueryFetcher<T> for GatedFetcher<T> {
    async fn fetch(&self, _key: &QueryKey) -> Result<T, FetchError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.started_changed.notify_waiters();
        match self.gate.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(self.value.clone())
            }
            Err(_) => Err(FetchError::Aborted {
                reason: "gate closed".to_string(),
            }),
        }
    }
}

/// Always fails with the same error and counts invocations.
#[derive(Debug)]
pub struct FailingFetcher {
    error: FetchError,
    calls: AtomicUsize,
}

impl FailingFetcher {
    pub fn new(error: FetchError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> QueryFetcher<T> for FailingFetcher {
    async fn fetch(&self, _key: &QueryKey) -> Result<T, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Plays back a fixed sequence of results, one per invocation.
///
/// Once the script runs out every call fails with a transport error.
#[derive(Debug)]
pub struct ScriptedFetcher<T> {
    script: Mutex<VecDeque<Result<T, FetchError>>>,
    calls: AtomicUsize,
}

impl<T: Send + Sync> ScriptedFetcher<T> {
    pub fn new(script: impl IntoIterator<Item = Result<T, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl<T: Send + Sync> QueryFetcher<T> for ScriptedFetcher<T> {
    async fn fetch(&self, _key: &QueryKey) -> Result<T, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Err(FetchError::transport("script exhausted")))
    }
}

// ============================================================================
// CALLBACK RECORDERS
// ============================================================================

/// Shared log of which named listener fired, in firing order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store listener that appends `name` each time it fires.
    pub fn listener(&self, name: &str) -> Listener {
        let entries = Arc::clone(&self.entries);
        let name = name.to_string();
        Arc::new(move |_key: &QueryKey| {
            if let Ok(mut entries) = entries.lock() {
                entries.push(name.clone());
            }
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts renders and lets a test wait for one.
#[derive(Debug, Clone, Default)]
pub struct RenderCounter {
    count: Arc<AtomicUsize>,
    rendered: Arc<Notify>,
}

impl RenderCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render callback to hand to an observer.
    pub fn render_fn(&self) -> impl Fn() + Send + Sync + 'static {
        let count = Arc::clone(&self.count);
        let rendered = Arc::clone(&self.rendered);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            rendered.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` renders have happened.
    pub async fn wait_for(&self, n: usize) {
        loop {
            let rendered = self.rendered.notified();
            if self.count() >= n {
                return;
            }
            rendered.await;
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_key_segment() -> impl Strategy<Value = KeySegment> {
        prop_oneof![
            "[a-zA-Z][a-zA-Z0-9_]{0,12}".prop_map(KeySegment::Str),
            any::<i64>().prop_map(KeySegment::Int),
            any::<bool>().prop_map(KeySegment::Bool),
        ]
    }

    /// Keys of one to four segments.
    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(arb_key_segment(), 1..=4).prop_map(QueryKey::new)
    }

    /// A small pool of distinct keys, for tests that need collisions.
    pub fn arb_key_pool(size: usize) -> impl Strategy<Value = Vec<QueryKey>> {
        prop::collection::hash_set(arb_query_key(), size..=size)
            .prop_map(|keys| keys.into_iter().collect())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Clients and scenario data.

    use super::*;
    use coach_query::RetryConfig;
    use std::time::Duration;

    /// Clock pinned at 2025-01-01T00:00:00Z.
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }

    /// Default config with short backoff so retry tests stay quick.
    pub fn fast_retry_config() -> QueryClientConfig {
        QueryClientConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 10,
                max_backoff_ms: 40,
                multiplier: 2.0,
            },
            ..QueryClientConfig::default()
        }
    }

    /// Fresh store and client driven by `clock`.
    pub fn test_client(clock: &ManualClock) -> QueryClient {
        QueryClient::new(
            QueryCache::new(),
            Arc::new(clock.clone()),
            fast_retry_config(),
        )
    }

    pub fn core_enums_key() -> QueryKey {
        QueryKey::from(["core", "enums"])
    }

    pub fn final_prompt_key() -> QueryKey {
        QueryKey::from(["user", "finalPrompt"])
    }

    /// Payload served for the core enums query.
    pub fn core_enums() -> serde_json::Value {
        serde_json::json!({ "coaching_phases": ["intro"] })
    }

    pub fn one_hour() -> Duration {
        Duration::from_secs(60 * 60)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &CoachResult<T>, expected: &FetchError) {
        match result {
            Err(CoachError::Fetch(e)) => assert_eq!(e, expected, "Wrong fetch error"),
            other => panic!("Expected Fetch error {:?}, got: {:?}", expected, other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CoachResult<T>, key: &QueryKey) {
        match result {
            Err(CoachError::Cache(CacheError::NotFound { key: k })) => {
                assert_eq!(k, key, "Wrong key in NotFound error");
            }
            other => panic!("Expected NotFound for {}, got: {:?}", key, other),
        }
    }

    #[track_caller]
    pub fn assert_type_mismatch<T: std::fmt::Debug>(result: &CoachResult<T>) {
        match result {
            Err(CoachError::Cache(CacheError::TypeMismatch { .. })) => {}
            other => panic!("Expected TypeMismatch, got: {:?}", other),
        }
    }
}
