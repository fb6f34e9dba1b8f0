//! Fetch coordinator: stale-while-revalidate with per-key request deduplication.
//!
//! Inspired by TanStack Query. For a given key:
//!
//! 1. Fresh data is returned immediately without calling the producer
//! 2. Stale data is returned immediately and one background refetch starts
//! 3. With no data, one fetch starts and every concurrent caller waits on it
//!
//! Failed attempts are retried up to the retry budget. A terminal failure keeps
//! the previously fetched data and is reported next to it.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::key::QueryKey;
use super::storage::CacheStorage;
use super::store::CacheStore;
use super::traits::{CacheEntry, CacheSource, FetchError, QueryResult, QueryStatus};

/// Upper bound for the delay between attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How failed producer calls are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first. 1 = no retry.
  pub max_attempts: u32,
  /// Delay before the first retry, doubled for each further one.
  /// Zero retries immediately.
  pub initial_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_delay: Duration::ZERO,
    }
  }
}

impl RetryPolicy {
  /// Delay to wait after the given (1-based) failed attempt.
  pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
    if self.initial_delay.is_zero() {
      return None;
    }
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    Some(
      self
        .initial_delay
        .saturating_mul(factor)
        .min(MAX_RETRY_DELAY),
    )
  }
}

/// Tuning for the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// How long fetched data is served without refetching
  pub stale_time: Duration,
  /// How long an entry is kept after its last update
  pub ttl: Duration,
  pub retry: RetryPolicy,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      ttl: Duration::from_secs(120),
      retry: RetryPolicy::default(),
    }
  }
}

/// A running fetch shared by every caller waiting on the same key
type InFlight<T> = Shared<BoxFuture<'static, CacheEntry<T>>>;

struct Inner<T> {
  store: CacheStore<T>,
  in_flight: Mutex<HashMap<QueryKey, InFlight<T>>>,
  stale_time: Duration,
  retry: RetryPolicy,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
  fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<QueryKey, InFlight<T>>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run the producer until it succeeds or the retry budget is spent, then
  /// record the outcome and close the fetch epoch for the key.
  async fn run_fetch<F, Fut>(self: Arc<Self>, key: QueryKey, producer: F) -> CacheEntry<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let mut attempt = 0;
    let result = loop {
      attempt += 1;
      let outcome = AssertUnwindSafe(producer())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(FetchError::Programmer("producer panicked".to_string())));

      match outcome {
        Ok(data) => break Ok(data),
        Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
          warn!(key = %key, attempt, error = %e, "fetch attempt failed, retrying");
          if let Some(delay) = self.retry.delay_after(attempt) {
            tokio::time::sleep(delay).await;
          }
        }
        Err(e) => break Err(e),
      }
    };

    let now = Utc::now();
    let entry = {
      let mut in_flight = self.lock_in_flight();
      let entry = match result {
        Ok(data) => {
          info!(key = %key, attempt, "fetch succeeded");
          self.store.record_success(&key, data, now)
        }
        Err(e) => {
          warn!(key = %key, attempt, error = %e, "fetch failed");
          self.store.record_error(&key, e, now)
        }
      };
      in_flight.remove(&key);
      entry
    };
    // Disk writes stay outside the in-flight lock
    self.store.persist(&key, &entry);
    entry
  }
}

/// Coordinates fetches against a [`CacheStore`].
///
/// Cloning is cheap; clones share the same store and in-flight table.
pub struct FetchCoordinator<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for FetchCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> FetchCoordinator<T> {
  pub fn new(options: QueryOptions) -> Self {
    Self::with_store(CacheStore::new(options.ttl), options)
  }

  /// Create a coordinator whose store persists to the given backend.
  pub fn with_storage(options: QueryOptions, storage: Arc<dyn CacheStorage<T>>) -> Self {
    Self::with_store(CacheStore::new(options.ttl).with_storage(storage), options)
  }

  fn with_store(store: CacheStore<T>, options: QueryOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        in_flight: Mutex::new(HashMap::new()),
        stale_time: options.stale_time,
        retry: options.retry,
      }),
    }
  }

  pub fn store(&self) -> &CacheStore<T> {
    &self.inner.store
  }

  /// Current cache state for a key, without fetching.
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.inner.store.get(key)
  }

  /// Mark a key stale so the next resolve refetches it (e.g. pull-to-refresh).
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    debug!(key = %key, "invalidating");
    self.inner.store.invalidate(key)
  }

  /// Whether a fetch for the key is currently running.
  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self.inner.lock_in_flight().contains_key(key)
  }

  /// Resolve a key, fetching through `producer` when needed.
  ///
  /// Returns immediately for fresh and stale data; waits for the (shared)
  /// fetch only when nothing has been fetched yet. Dropping the returned
  /// future never cancels the fetch.
  pub async fn resolve<F, Fut>(&self, key: &QueryKey, producer: F) -> QueryResult<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let now = Utc::now();
    self.inner.store.warm(key, now);
    let waiter = {
      let mut in_flight = self.inner.lock_in_flight();

      match self.inner.store.peek_at(key, now) {
        Some(entry) if entry.is_fresh(self.inner.stale_time, now) => {
          debug!(key = %key, "fresh cache hit");
          return QueryResult::from_entry(&entry, CacheSource::CacheFresh, false);
        }
        Some(entry) if entry.data.is_some() => {
          if !in_flight.contains_key(key) {
            debug!(key = %key, "stale cache hit, refetching in background");
            self.start_locked(&mut in_flight, key, producer);
          }
          let source = if entry.status == QueryStatus::Error {
            CacheSource::Offline
          } else {
            CacheSource::CacheStale
          };
          return QueryResult::from_entry(&entry, source, true);
        }
        _ => {
          if let Some(running) = in_flight.get(key).cloned() {
            debug!(key = %key, "joining in-flight fetch");
            running
          } else {
            debug!(key = %key, "cache miss");
            self.start_locked(&mut in_flight, key, producer)
          }
        }
      }
    };

    let entry = waiter.await;
    let source = if entry.status == QueryStatus::Success {
      CacheSource::Network
    } else {
      CacheSource::None
    };
    QueryResult::from_entry(&entry, source, false)
  }

  /// Fetch now and wait for the outcome, even when cached data is fresh.
  ///
  /// Joins a fetch that is already running. A failure still reports the
  /// previous data, marked [`CacheSource::Offline`].
  pub async fn refetch<F, Fut>(&self, key: &QueryKey, producer: F) -> QueryResult<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let waiter = {
      let mut in_flight = self.inner.lock_in_flight();
      if let Some(running) = in_flight.get(key).cloned() {
        running
      } else {
        debug!(key = %key, "forced refetch");
        self.start_locked(&mut in_flight, key, producer)
      }
    };

    let entry = waiter.await;
    let source = match (entry.status, entry.data.is_some()) {
      (QueryStatus::Success, _) => CacheSource::Network,
      (_, true) => CacheSource::Offline,
      _ => CacheSource::None,
    };
    QueryResult::from_entry(&entry, source, false)
  }

  /// Start a fetch unless the key is fresh or already being fetched.
  ///
  /// Returns whether a new fetch was started.
  pub fn prefetch<F, Fut>(&self, key: &QueryKey, producer: F) -> bool
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let now = Utc::now();
    self.inner.store.warm(key, now);
    let mut in_flight = self.inner.lock_in_flight();
    if in_flight.contains_key(key) {
      return false;
    }
    if let Some(entry) = self.inner.store.peek_at(key, now) {
      if entry.is_fresh(self.inner.stale_time, now) {
        return false;
      }
    }
    debug!(key = %key, "prefetching");
    self.start_locked(&mut in_flight, key, producer);
    true
  }

  /// Wait until no fetch is running, including background refetches.
  pub async fn settle(&self) {
    loop {
      let pending: Vec<InFlight<T>> = self.inner.lock_in_flight().values().cloned().collect();
      if pending.is_empty() {
        return;
      }
      futures::future::join_all(pending).await;
    }
  }

  /// Remove expired entries from memory and persistent storage.
  pub fn evict_expired(&self) -> usize {
    self.inner.store.evict_expired(Utc::now())
  }

  /// Spawn the fetch task and register it. Caller holds the in-flight lock.
  fn start_locked<F, Fut>(
    &self,
    in_flight: &mut HashMap<QueryKey, InFlight<T>>,
    key: &QueryKey,
    producer: F,
  ) -> InFlight<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.inner.store.mark_loading(key);

    let inner = Arc::clone(&self.inner);
    let handle = tokio::spawn(inner.run_fetch(key.clone(), producer));

    let fallback_key = key.clone();
    let fetch = async move {
      match handle.await {
        Ok(entry) => entry,
        // Only reachable if the runtime shuts down mid-fetch
        Err(e) => {
          let mut entry = CacheEntry::new(fallback_key);
          entry.status = QueryStatus::Error;
          entry.error = Some(FetchError::Transport(format!("fetch task aborted: {}", e)));
          entry
        }
      }
    }
    .boxed()
    .shared();

    in_flight.insert(key.clone(), fetch.clone());
    fetch
  }
}
