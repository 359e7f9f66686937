//! Process-wide keyed cache store.
//!
//! [`QueryCache`] maps each [`QueryKey`] to a slot holding the last fetched
//! value, when it was fetched, the shared in-flight fetch (if any), and the
//! subscribers registered for that key.
//!
//! # Notification discipline
//!
//! [`QueryCache::set`] is the only operation that fires callbacks. The slot is
//! fully updated and the store lock released before any callback runs, so a
//! callback may read the store, subscribe, or unsubscribe. Callbacks are
//! invoked from a snapshot of the subscriber list taken at write time:
//!
//! - a subscriber removed mid-walk is skipped (never called after removal)
//! - a subscriber added mid-walk is not called for that write
//! - every other subscriber is called exactly once, in registration order
//!
//! Liveness is checked just before each call, without a lock held across the
//! callback. A write that starts after [`Subscription::unsubscribe`] returns
//! never calls the subscriber. When another thread unsubscribes during a walk,
//! a call that already passed its check still runs.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use coach_core::{CacheError, CoachResult, FetchError, QueryKey, Timestamp};
use futures_util::future::{BoxFuture, Shared};

use crate::freshness::CacheRead;

/// Type-erased cached value.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A successfully fetched value and when it arrived.
#[derive(Clone)]
pub struct Fetched {
    pub value: ErasedValue,
    pub fetched_at: Timestamp,
}

impl fmt::Debug for Fetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetched")
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

/// Settled result of one fetch, shared by every attached caller.
pub type FetchOutcome = Result<Fetched, FetchError>;

/// A pending fetch that any number of callers can await.
pub type InflightFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Change callback. Receives the key whose entry changed.
pub type Listener = Arc<dyn Fn(&QueryKey) + Send + Sync>;

/// Identifies one registration in a key's subscriber list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Ticket identifying which fetch currently owns a slot's in-flight marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchTicket(u64);

struct Subscriber {
    id: SubscriptionId,
    listener: Listener,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Slot {
    value: Option<ErasedValue>,
    fetched_at: Option<Timestamp>,
    stale_after: Option<Duration>,
    inflight: Option<(FetchTicket, InflightFetch)>,
    subscribers: Vec<Subscriber>,
}

impl Slot {
    /// A slot with nothing in it is not an entry and gets dropped.
    fn is_vacant(&self) -> bool {
        self.value.is_none() && self.inflight.is_none() && self.subscribers.is_empty()
    }

    fn snapshot_listeners(&self) -> Vec<(Listener, Arc<AtomicBool>)> {
        self.subscribers
            .iter()
            .map(|s| (Arc::clone(&s.listener), Arc::clone(&s.active)))
            .collect()
    }
}

/// Read-only view of an entry's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub has_value: bool,
    pub fetched_at: Option<Timestamp>,
    pub stale_after: Option<Duration>,
    pub is_fetching: bool,
    pub subscriber_count: usize,
}

struct StoreInner {
    slots: RwLock<HashMap<QueryKey, Slot>>,
    next_subscription: AtomicU64,
    next_ticket: AtomicU64,
    notifications: AtomicU64,
}

impl StoreInner {
    fn remove_subscriber(&self, key: &QueryKey, id: SubscriptionId) {
        // Runs from Drop; a poisoned map is still safe to prune.
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(key) {
            slot.subscribers.retain(|s| s.id != id);
            if slot.is_vacant() {
                slots.remove(key);
            }
        }
    }
}

/// Keyed store of query results with per-key change subscriptions.
///
/// Cloning is cheap and every clone addresses the same store. Construct one
/// per application (or per test) and inject it; dropping the last clone, or
/// calling [`QueryCache::clear`], tears everything down.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<StoreInner>,
}

impl QueryCache {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                slots: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                next_ticket: AtomicU64::new(1),
                notifications: AtomicU64::new(0),
            }),
        }
    }

    fn read_slots(&self) -> CoachResult<RwLockReadGuard<'_, HashMap<QueryKey, Slot>>> {
        self.inner
            .slots
            .read()
            .map_err(|_| CacheError::LockPoisoned.into())
    }

    fn write_slots(&self) -> CoachResult<RwLockWriteGuard<'_, HashMap<QueryKey, Slot>>> {
        self.inner
            .slots
            .write()
            .map_err(|_| CacheError::LockPoisoned.into())
    }

    /// Read the cached value for `key`.
    ///
    /// Returns `Ok(None)` when no value has been stored, including keys that
    /// only have subscribers or a pending fetch.
    pub fn get<T: Any + Send + Sync>(&self, key: &QueryKey) -> CoachResult<Option<CacheRead<T>>> {
        let slots = self.read_slots()?;
        let Some(slot) = slots.get(key) else {
            return Ok(None);
        };
        let Some(value) = slot.value.as_ref() else {
            return Ok(None);
        };
        let typed = downcast::<T>(key, Arc::clone(value))?;
        Ok(Some(CacheRead::from_cache(typed, slot.fetched_at)))
    }

    /// Bookkeeping for `key`, or `None` if the store holds nothing for it.
    pub fn inspect(&self, key: &QueryKey) -> CoachResult<Option<EntryInfo>> {
        let slots = self.read_slots()?;
        Ok(slots.get(key).map(|slot| EntryInfo {
            has_value: slot.value.is_some(),
            fetched_at: slot.fetched_at,
            stale_after: slot.stale_after,
            is_fetching: slot.inflight.is_some(),
            subscriber_count: slot.subscribers.len(),
        }))
    }

    /// Store `value` for `key` and notify that key's subscribers.
    pub fn set<T: Any + Send + Sync>(
        &self,
        key: &QueryKey,
        value: T,
        fetched_at: Timestamp,
    ) -> CoachResult<()> {
        self.set_shared(key, Arc::new(value), fetched_at)
    }

    /// Like [`QueryCache::set`] for a value that is already shared.
    pub fn set_shared<T: Any + Send + Sync>(
        &self,
        key: &QueryKey,
        value: Arc<T>,
        fetched_at: Timestamp,
    ) -> CoachResult<()> {
        let value: ErasedValue = value;
        let listeners = {
            let mut slots = self.write_slots()?;
            let slot = slots.entry(key.clone()).or_default();
            slot.value = Some(value);
            slot.fetched_at = Some(fetched_at);
            slot.snapshot_listeners()
        };
        self.notify(key, listeners);
        Ok(())
    }

    /// Register `listener` for changes to `key`.
    ///
    /// The registration lasts until [`Subscription::unsubscribe`] is called or
    /// the returned guard is dropped, whichever comes first.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> CoachResult<Subscription>
    where
        F: Fn(&QueryKey) + Send + Sync + 'static,
    {
        self.subscribe_listener(key, Arc::new(listener))
    }

    /// Like [`QueryCache::subscribe`] for an already shared listener.
    pub fn subscribe_listener(&self, key: &QueryKey, listener: Listener) -> CoachResult<Subscription> {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let active = Arc::new(AtomicBool::new(true));
        {
            let mut slots = self.write_slots()?;
            slots.entry(key.clone()).or_default().subscribers.push(Subscriber {
                id,
                listener,
                active: Arc::clone(&active),
            });
        }
        tracing::trace!(key = %key, subscription = %id, "subscribed");
        Ok(Subscription {
            id,
            key: key.clone(),
            active,
            store: Arc::downgrade(&self.inner),
        })
    }

    /// The pending fetch for `key`, if any.
    pub fn inflight(&self, key: &QueryKey) -> CoachResult<Option<InflightFetch>> {
        let slots = self.read_slots()?;
        Ok(slots
            .get(key)
            .and_then(|slot| slot.inflight.as_ref())
            .map(|(_, fetch)| fetch.clone()))
    }

    /// Record `pending` as the shared fetch for `key`.
    ///
    /// If a fetch is already registered, it is returned instead and `pending`
    /// is discarded, so concurrent callers all end up on the same operation.
    pub fn mark_inflight(&self, key: &QueryKey, pending: InflightFetch) -> CoachResult<InflightFetch> {
        let (fetch, _) = self.attach_or_start(key, |_| pending)?;
        Ok(fetch)
    }

    /// Forget the pending fetch for `key` without touching its value.
    pub fn clear_inflight(&self, key: &QueryKey) -> CoachResult<()> {
        let mut slots = self.write_slots()?;
        if let Some(slot) = slots.get_mut(key) {
            slot.inflight = None;
            if slot.is_vacant() {
                slots.remove(key);
            }
        }
        Ok(())
    }

    /// Attach to the pending fetch for `key`, or register a new one built by
    /// `start`. The check and the registration happen under one lock.
    ///
    /// Returns the fetch and whether `start` was called.
    pub(crate) fn attach_or_start<S>(&self, key: &QueryKey, start: S) -> CoachResult<(InflightFetch, bool)>
    where
        S: FnOnce(FetchTicket) -> InflightFetch,
    {
        let mut slots = self.write_slots()?;
        let slot = slots.entry(key.clone()).or_default();
        if let Some((_, fetch)) = slot.inflight.as_ref() {
            return Ok((fetch.clone(), false));
        }
        let ticket = FetchTicket(self.inner.next_ticket.fetch_add(1, Ordering::Relaxed));
        let fetch = start(ticket);
        slot.inflight = Some((ticket, fetch.clone()));
        Ok((fetch, true))
    }

    /// Settle the fetch identified by `ticket`.
    ///
    /// On success the value is written and subscribers notified; on failure
    /// only the in-flight marker is cleared. Nothing happens if the marker has
    /// since been cleared or replaced. Returns true if a value was written.
    pub(crate) fn complete_fetch(
        &self,
        key: &QueryKey,
        ticket: FetchTicket,
        outcome: &FetchOutcome,
        stale_after: Duration,
    ) -> CoachResult<bool> {
        let listeners = {
            let mut slots = self.write_slots()?;
            let Some(slot) = slots.get_mut(key) else {
                return Ok(false);
            };
            match slot.inflight.as_ref() {
                Some((owner, _)) if *owner == ticket => {}
                _ => return Ok(false),
            }
            slot.inflight = None;
            match outcome {
                Ok(fetched) => {
                    slot.value = Some(Arc::clone(&fetched.value));
                    slot.fetched_at = Some(fetched.fetched_at);
                    slot.stale_after = Some(stale_after);
                    slot.snapshot_listeners()
                }
                Err(_) => {
                    if slot.is_vacant() {
                        slots.remove(key);
                    }
                    return Ok(false);
                }
            }
        };
        self.notify(key, listeners);
        Ok(true)
    }

    /// Drop the in-flight marker owned by `ticket` without recording a result.
    /// Used when a fetch task ends without settling (panic or runtime shutdown).
    pub(crate) fn abandon_fetch(&self, key: &QueryKey, ticket: FetchTicket) {
        let mut slots = self.inner.slots.write().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if matches!(slot.inflight.as_ref(), Some((owner, _)) if *owner == ticket) {
            slot.inflight = None;
            if slot.is_vacant() {
                slots.remove(key);
            }
        }
    }

    /// Mark the value for `key` stale so the next read refetches. The value
    /// itself is kept and no subscriber is notified.
    ///
    /// Returns true if there was a value to invalidate.
    pub fn invalidate(&self, key: &QueryKey) -> CoachResult<bool> {
        let mut slots = self.write_slots()?;
        match slots.get_mut(key) {
            Some(slot) if slot.value.is_some() => {
                slot.fetched_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Invalidate every key that starts with `prefix`. Returns how many
    /// values were invalidated.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> CoachResult<usize> {
        let mut slots = self.write_slots()?;
        let mut count = 0;
        for (key, slot) in slots.iter_mut() {
            if key.starts_with(prefix) && slot.value.is_some() {
                slot.fetched_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drop the value for `key`. Subscribers and any pending fetch stay.
    pub fn remove(&self, key: &QueryKey) -> CoachResult<bool> {
        let mut slots = self.write_slots()?;
        let Some(slot) = slots.get_mut(key) else {
            return Ok(false);
        };
        let had_value = slot.value.take().is_some();
        slot.fetched_at = None;
        slot.stale_after = None;
        if slot.is_vacant() {
            slots.remove(key);
        }
        Ok(had_value)
    }

    /// Tear down: drop every entry and deactivate every subscription.
    ///
    /// Fetches still running deliver their results to awaiting callers but
    /// no longer write into the store.
    pub fn clear(&self) -> CoachResult<()> {
        let drained: Vec<Slot> = {
            let mut slots = self.write_slots()?;
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            for subscriber in slot.subscribers {
                subscriber.active.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Returns true if a value is cached for `key`.
    pub fn contains(&self, key: &QueryKey) -> CoachResult<bool> {
        let slots = self.read_slots()?;
        Ok(slots.get(key).is_some_and(|slot| slot.value.is_some()))
    }

    /// Number of keys holding a value.
    pub fn entry_count(&self) -> CoachResult<usize> {
        let slots = self.read_slots()?;
        Ok(slots.values().filter(|slot| slot.value.is_some()).count())
    }

    /// Keys holding a value, in no particular order.
    pub fn keys(&self) -> CoachResult<Vec<QueryKey>> {
        let slots = self.read_slots()?;
        Ok(slots
            .iter()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(key, _)| key.clone())
            .collect())
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> CoachResult<usize> {
        let slots = self.read_slots()?;
        Ok(slots.get(key).map_or(0, |slot| slot.subscribers.len()))
    }

    pub fn is_fetching(&self, key: &QueryKey) -> CoachResult<bool> {
        let slots = self.read_slots()?;
        Ok(slots.get(key).is_some_and(|slot| slot.inflight.is_some()))
    }

    /// Total callbacks delivered since the store was created.
    pub fn notification_count(&self) -> u64 {
        self.inner.notifications.load(Ordering::Relaxed)
    }

    fn notify(&self, key: &QueryKey, listeners: Vec<(Listener, Arc<AtomicBool>)>) {
        for (listener, active) in listeners {
            if active.load(Ordering::Acquire) {
                self.inner.notifications.fetch_add(1, Ordering::Relaxed);
                listener(key);
            }
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.slots.read().map(|slots| slots.len()).ok();
        f.debug_struct("QueryCache").field("slots", &entries).finish()
    }
}

/// Guard for one subscriber registration.
///
/// Unsubscribing is idempotent, and dropping the guard unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    key: QueryKey,
    active: Arc<AtomicBool>,
    store: Weak<StoreInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// False once unsubscribed, or once the store has been cleared.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Shared liveness flag, for work that must stop when this registration ends.
    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Remove this registration. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.remove_subscriber(&self.key, self.id);
        }
        tracing::trace!(key = %self.key, subscription = %self.id, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

pub(crate) fn downcast<T: Any + Send + Sync>(key: &QueryKey, value: ErasedValue) -> CoachResult<Arc<T>> {
    value.downcast::<T>().map_err(|_| {
        CacheError::TypeMismatch {
            key: key.clone(),
            expected: type_name::<T>(),
        }
        .into()
    })
}
