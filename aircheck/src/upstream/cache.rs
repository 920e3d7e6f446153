//! TTL cache with in-flight request coalescing.
//!
//! Concurrent callers that miss the cache share one refresh: the first
//! caller fetches while the rest wait on the same in-flight state. A failed
//! refresh is reported to every waiter and leaves the cache empty so the
//! next request retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, OnceCell};

use crate::error::{Error, Result};

struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

type InFlightResult<T> = std::result::Result<T, String>;

struct InFlightState<T> {
    result: OnceCell<InFlightResult<T>>,
    notify: Notify,
}

impl<T: Clone> InFlightState<T> {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: InFlightResult<T>) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> InFlightResult<T> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }
            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }
            notified.await;
        }
    }
}

/// A single cached value refreshed lazily after its TTL expires.
pub struct SingleFlightCache<T> {
    ttl: Duration,
    slot: parking_lot::Mutex<Option<CacheEntry<T>>>,
    in_flight: parking_lot::Mutex<Option<Arc<InFlightState<T>>>>,
}

impl<T: Clone> SingleFlightCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: parking_lot::Mutex::new(None),
            in_flight: parking_lot::Mutex::new(None),
        }
    }

    fn fresh(&self) -> Option<T> {
        let slot = self.slot.lock();
        slot.as_ref()
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Drop the cached value so the next call refreshes.
    pub fn invalidate(&self) {
        self.slot.lock().take();
    }

    /// Return the cached value, or run `fetch` to refresh it. Concurrent
    /// callers during a refresh wait for the in-flight result instead of
    /// issuing their own fetch.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.fresh() {
            return Ok(value);
        }

        let (state, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.as_ref() {
                Some(state) => (Arc::clone(state), false),
                None => {
                    let state = Arc::new(InFlightState::new());
                    *in_flight = Some(Arc::clone(&state));
                    (state, true)
                }
            }
        };

        if !leader {
            return state
                .wait()
                .await
                .map_err(Error::UpstreamUnavailable);
        }

        let outcome = fetch().await;
        match &outcome {
            Ok(value) => {
                *self.slot.lock() = Some(CacheEntry {
                    value: value.clone(),
                    expires_at: Instant::now() + self.ttl,
                });
                state.set_result(Ok(value.clone()));
            }
            Err(e) => state.set_result(Err(e.to_string())),
        }
        self.in_flight.lock().take();
        outcome
    }
}
