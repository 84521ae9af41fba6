//! Concurrency-safe, stale-tolerant cache.
//!
//! Every credential lookup in this crate sits on top of [`StaleCache`]: a
//! keyed cache constructed with a max age and an injected async refresh
//! function. Reads follow a stale-while-revalidate policy:
//!
//! - A key with no entry blocks until the first refresh completes, and
//!   concurrent callers coalesce onto that single refresh (singleflight).
//! - A fresh entry is returned immediately.
//! - A stale entry is returned immediately while exactly one detached
//!   refresh replaces it in the background. Late callers during that window
//!   keep getting the stale value; they never wait for the in-flight
//!   refresh.
//!
//! A failed background refresh leaves the stale entry in place and is
//! retried on the next stale access; its error is only surfaced to callers
//! that have no cached value at all. No lock is held across a refresh call.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use depfleet_common::CredentialError;

type RefreshFuture<V> = Pin<Box<dyn Future<Output = Result<V, CredentialError>> + Send>>;
type RefreshFn<K, V> = Arc<dyn Fn(K) -> RefreshFuture<V> + Send + Sync>;
type Waiters<V> = broadcast::Sender<Result<V, CredentialError>>;

struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
    refresh_in_flight: bool,
}

enum Slot<V> {
    /// A value exists; it may be stale.
    Ready(CacheEntry<V>),
    /// The first refresh for this key is still running; waiters subscribe.
    Pending(Waiters<V>),
}

/// What `get` decided to do while holding the map lock.
enum Plan<V> {
    Hit(V),
    StaleRefresh(V),
    Wait(broadcast::Receiver<Result<V, CredentialError>>),
    Fetch(Waiters<V>),
}

/// Keyed stale-while-revalidate cache with singleflight refresh coalescing.
pub struct StaleCache<K, V> {
    max_age: Duration,
    refresh: RefreshFn<K, V>,
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K, V> Clone for StaleCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            max_age: self.max_age,
            refresh: Arc::clone(&self.refresh),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, V> StaleCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache whose entries expire `max_age` after they were
    /// fetched, refreshed through `refresh`.
    pub fn new<F, Fut>(max_age: Duration, refresh: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, CredentialError>> + Send + 'static,
    {
        Self {
            max_age,
            refresh: Arc::new(move |key| Box::pin(refresh(key))),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Look up `key`, refreshing per the stale-while-revalidate policy.
    ///
    /// Only a caller with no cached value ever observes a refresh error.
    pub async fn get(&self, key: K) -> Result<V, CredentialError> {
        let plan = {
            let mut slots = self.slots.lock().await;
            match slots.entry(key.clone()) {
                MapEntry::Vacant(vacant) => {
                    let (tx, _rx) = broadcast::channel(1);
                    vacant.insert(Slot::Pending(tx.clone()));
                    Plan::Fetch(tx)
                }
                MapEntry::Occupied(mut occupied) => match occupied.get_mut() {
                    Slot::Pending(tx) => Plan::Wait(tx.subscribe()),
                    Slot::Ready(entry) => {
                        let value = entry.value.clone();
                        if entry.fetched_at.elapsed() < self.max_age || entry.refresh_in_flight {
                            Plan::Hit(value)
                        } else {
                            entry.refresh_in_flight = true;
                            Plan::StaleRefresh(value)
                        }
                    }
                },
            }
        };

        match plan {
            Plan::Hit(value) => Ok(value),
            Plan::StaleRefresh(value) => {
                self.spawn_refresh(key);
                Ok(value)
            }
            Plan::Wait(mut rx) => match rx.recv().await {
                Ok(result) => result,
                // The fetching task died before publishing; treat like any
                // other refresh failure for a caller with no cached value.
                Err(_) => Err(CredentialError::Transient(
                    "cache refresh aborted before completion".to_string(),
                )),
            },
            Plan::Fetch(tx) => self.populate(key, tx).await,
        }
    }

    /// Drop the entry for `key`, forcing the next `get` to block on a fresh
    /// refresh.
    pub async fn invalidate(&self, key: &K) {
        self.slots.lock().await.remove(key);
    }

    /// Number of populated (ready or pending) entries.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// First fetch for a key: run the refresh, publish the result to every
    /// coalesced waiter, and store the entry on success only.
    async fn populate(&self, key: K, tx: Waiters<V>) -> Result<V, CredentialError> {
        let result = (self.refresh)(key.clone()).await;

        let mut slots = self.slots.lock().await;
        match &result {
            Ok(value) => {
                slots.insert(
                    key,
                    Slot::Ready(CacheEntry {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                        refresh_in_flight: false,
                    }),
                );
            }
            Err(err) => {
                debug!(error = %err, "initial cache fetch failed; nothing stored");
                slots.remove(&key);
            }
        }
        // Publish while still holding the lock: anyone who saw the Pending
        // slot has already subscribed.
        let _ = tx.send(result.clone());
        drop(slots);

        result
    }

    /// Detached refresh for a stale entry: swap the entry on success, keep
    /// the stale value on failure.
    fn spawn_refresh(&self, key: K) {
        let refresh = Arc::clone(&self.refresh);
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let result = refresh(key.clone()).await;
            let mut slots = slots.lock().await;
            match result {
                Ok(value) => {
                    slots.insert(
                        key,
                        Slot::Ready(CacheEntry {
                            value,
                            fetched_at: Instant::now(),
                            refresh_in_flight: false,
                        }),
                    );
                }
                Err(err) => {
                    warn!(key = ?key, error = %err, "background refresh failed; keeping stale entry");
                    if let Some(Slot::Ready(entry)) = slots.get_mut(&key) {
                        entry.refresh_in_flight = false;
                    }
                }
            }
        });
    }
}

// =========================================================================
// Tests
// =========================================================================
