//! Subscription bridge between the cache and a render cycle.
//!
//! A [`QueryObserver`] ties one key to a render callback. While mounted, the
//! callback fires whenever the store writes that key, and when the observer's
//! own fetch fails (a failure never writes the store, so nothing else would
//! tell the view). Unmounting, dropping the observer, or switching keys ends
//! delivery for the old registration, including for fetches that settle
//! afterwards. When the unmount and the deliveries share a thread, as on a
//! current-thread runtime, nothing renders after the unmount returns.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use coach_core::{CoachError, CoachResult, QueryKey, Timestamp};
use tokio::task::JoinHandle;

use crate::client::QueryClient;
use crate::fetcher::QueryFetcher;
use crate::freshness::QueryOptions;
use crate::store::Subscription;

/// Render trigger supplied by the view.
pub type RenderFn = Arc<dyn Fn() + Send + Sync>;

/// What a view shows for its key.
pub struct QueryState<T> {
    /// Last cached value. Kept on fetch errors.
    pub value: Option<Arc<T>>,
    pub fetched_at: Option<Timestamp>,
    /// Nothing to show yet and a fetch is pending.
    pub is_loading: bool,
    pub is_fetching: bool,
    pub is_error: bool,
    /// Error from this observer's most recent fetch, cleared by a later success.
    pub error: Option<CoachError>,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            is_loading: self.is_loading,
            is_fetching: self.is_fetching,
            is_error: self.is_error,
            error: self.error.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("value", &self.value)
            .field("fetched_at", &self.fetched_at)
            .field("is_loading", &self.is_loading)
            .field("is_fetching", &self.is_fetching)
            .field("is_error", &self.is_error)
            .field("error", &self.error)
            .finish()
    }
}

/// Per-observer state shared with background refreshes.
struct Binding {
    key: QueryKey,
    /// Bumped on every mount, unmount, and key change. A refresh only
    /// reports back if the generation it started under is still current.
    generation: u64,
    live: Option<Arc<AtomicBool>>,
    error: Option<CoachError>,
}

struct ObserverShared<F: ?Sized> {
    client: QueryClient,
    fetcher: Arc<F>,
    options: QueryOptions,
    render: RenderFn,
    binding: Mutex<Binding>,
}

impl<F: ?Sized> ObserverShared<F> {
    fn binding(&self) -> std::sync::MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh<T>(&self) -> CoachResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: QueryFetcher<T> + 'static,
    {
        let (key, generation) = {
            let binding = self.binding();
            (binding.key.clone(), binding.generation)
        };

        let result = self
            .client
            .ensure_fresh::<T, F>(&key, Arc::clone(&self.fetcher), &self.options)
            .await;

        let should_render = {
            let mut binding = self.binding();
            let live = binding
                .live
                .as_ref()
                .is_some_and(|live| live.load(Ordering::Acquire));
            if binding.generation != generation || !live {
                tracing::trace!(key = %key, "dropping result for stale observer");
                false
            } else {
                match &result {
                    Ok(_) => {
                        binding.error = None;
                        false
                    }
                    Err(e) => {
                        binding.error = Some(e.clone());
                        true
                    }
                }
            }
        };
        if should_render {
            (self.render)();
        }
        result
    }
}

/// Reactive read of one key, driving a render callback.
pub struct QueryObserver<T, F: ?Sized> {
    shared: Arc<ObserverShared<F>>,
    subscription: Option<Subscription>,
    _value: PhantomData<fn() -> T>,
}

impl<T, F> QueryObserver<T, F>
where
    T: Any + Send + Sync,
    F: QueryFetcher<T> + ?Sized + 'static,
{
    /// Build an unmounted observer. Nothing is registered until
    /// [`QueryObserver::mount`].
    pub fn new<R>(
        client: QueryClient,
        key: QueryKey,
        fetcher: Arc<F>,
        options: QueryOptions,
        render: R,
    ) -> Self
    where
        R: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(ObserverShared {
                client,
                fetcher,
                options,
                render: Arc::new(render),
                binding: Mutex::new(Binding {
                    key,
                    generation: 0,
                    live: None,
                    error: None,
                }),
            }),
            subscription: None,
            _value: PhantomData,
        }
    }

    /// Register with the store for the current key. Mounting twice is a no-op.
    ///
    /// A registration ended by [`QueryCache::clear`](crate::QueryCache::clear)
    /// is replaced with a fresh one.
    pub fn mount(&mut self) -> CoachResult<()> {
        if self.is_mounted() {
            return Ok(());
        }
        if let Some(stale) = self.subscription.take() {
            stale.unsubscribe();
        }
        let key = self.key();
        let render = Arc::clone(&self.shared.render);
        let subscription = self
            .shared
            .client
            .cache()
            .subscribe(&key, move |_key: &QueryKey| render())?;

        let mut binding = self.shared.binding();
        binding.generation += 1;
        binding.live = Some(subscription.liveness());
        binding.error = None;
        drop(binding);

        tracing::debug!(key = %key, subscription = %subscription.id(), "observer mounted");
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Deregister. Once this returns, no write that starts afterwards renders,
    /// and neither does a fetch that settles afterwards. A render already
    /// under way on another thread may still finish.
    pub fn unmount(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        subscription.unsubscribe();

        let mut binding = self.shared.binding();
        binding.generation += 1;
        binding.live = None;
        binding.error = None;
        tracing::debug!(key = %binding.key, "observer unmounted");
    }

    /// Point the observer at `key`. A mounted observer moves its registration
    /// to the new key; results of fetches started for the old key are ignored.
    /// An observer whose registration was ended by a store clear still counts
    /// as mounted here and registers under the new key.
    pub fn set_key(&mut self, key: QueryKey) -> CoachResult<()> {
        if self.key() == key {
            return Ok(());
        }
        let was_mounted = self.subscription.is_some();
        self.unmount();
        {
            let mut binding = self.shared.binding();
            binding.key = key;
            binding.generation += 1;
        }
        if was_mounted {
            self.mount()?;
        }
        Ok(())
    }

    pub fn key(&self) -> QueryKey {
        self.shared.binding().key.clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.as_ref().is_some_and(Subscription::is_active)
    }

    /// Current view of the key, read straight from the store.
    pub fn state(&self) -> CoachResult<QueryState<T>> {
        let (key, error) = {
            let binding = self.shared.binding();
            (binding.key.clone(), binding.error.clone())
        };
        let cache = self.shared.client.cache();
        let read = cache.get::<T>(&key)?;
        let is_fetching = cache.is_fetching(&key)?;

        let (value, fetched_at) = match read {
            Some(read) => {
                let fetched_at = read.fetched_at();
                (Some(read.into_value()), fetched_at)
            }
            None => (None, None),
        };
        Ok(QueryState {
            is_loading: value.is_none() && is_fetching,
            value,
            fetched_at,
            is_fetching,
            is_error: error.is_some(),
            error,
        })
    }

    /// Make the current key fresh through the client.
    ///
    /// A failure is recorded in [`QueryState::error`] and triggers a render
    /// if the observer is still mounted on the same key.
    pub async fn refresh(&self) -> CoachResult<Arc<T>> {
        self.shared.refresh::<T>().await
    }

    /// Run [`QueryObserver::refresh`] in the background. Errors land in the
    /// observer state. Must be called from within a Tokio runtime.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = shared.refresh::<T>().await {
                tracing::debug!(error = %e, "background refresh failed");
            }
        })
    }

    pub fn options(&self) -> &QueryOptions {
        &self.shared.options
    }
}

impl<T, F: ?Sized> Drop for QueryObserver<T, F> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
            let mut binding = self.shared.binding.lock().unwrap_or_else(PoisonError::into_inner);
            binding.generation += 1;
            binding.live = None;
        }
    }
}

impl<T, F: ?Sized> fmt::Debug for QueryObserver<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.shared.binding.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("QueryObserver")
            .field("key", &binding.key)
            .field(
                "mounted",
                &self.subscription.as_ref().is_some_and(Subscription::is_active),
            )
            .field("options", &self.shared.options)
            .finish()
    }
}

/// Mount an observer for `key` and, if the query is enabled, start a
/// background refresh. Must be called from within a Tokio runtime.
pub fn use_query_value<T, F, R>(
    client: &QueryClient,
    key: QueryKey,
    fetcher: Arc<F>,
    options: QueryOptions,
    render: R,
) -> CoachResult<QueryObserver<T, F>>
where
    T: Any + Send + Sync,
    F: QueryFetcher<T> + ?Sized + 'static,
    R: Fn() + Send + Sync + 'static,
{
    let mut observer = QueryObserver::new(client.clone(), key, fetcher, options, render);
    observer.mount()?;
    if options.enabled {
        observer.spawn_refresh();
    }
    Ok(observer)
}
