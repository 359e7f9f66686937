//! Fetch collaborator seam.
//!
//! The query layer never talks to the network itself. Callers hand it a
//! [`QueryFetcher`] that performs one request per invocation.

use async_trait::async_trait;
use coach_core::{FetchError, QueryKey};
use std::future::Future;
use std::marker::PhantomData;

/// Performs one asynchronous request for the value named by a key.
///
/// Invocations are treated as side-effecting: the controller makes sure at
/// most one is outstanding per key.
#[async_trait]
pub trait QueryFetcher<T>: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<T, FetchError>;
}

/// Adapter turning an async closure into a [`QueryFetcher`].
pub struct FnFetcher<F, T> {
    f: F,
    _value: PhantomData<fn() -> T>,
}

/// Wrap `f` as a fetcher. The closure receives an owned copy of the key.
pub fn fetch_fn<F, Fut, T>(f: F) -> FnFetcher<F, T>
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + 'static,
{
    FnFetcher {
        f,
        _value: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> QueryFetcher<T> for FnFetcher<F, T>
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + 'static,
{
    async fn fetch(&self, key: &QueryKey) -> Result<T, FetchError> {
        (self.f)(key.clone()).await
    }
}
