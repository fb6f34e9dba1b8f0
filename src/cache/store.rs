//! In-memory cache store with optional write-through persistence.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::key::QueryKey;
use super::storage::{CacheStorage, NoopStorage};
use super::traits::{age, CacheEntry, FetchError, QueryStatus};

/// Mapping from query key to cache entry.
///
/// All mutations happen under one lock, so readers never observe a partially
/// applied write. The lock is never held across an await point.
pub struct CacheStore<T> {
  entries: Mutex<HashMap<QueryKey, CacheEntry<T>>>,
  /// Entries fetched longer ago than this are evicted
  ttl: Duration,
  storage: Arc<dyn CacheStorage<T>>,
}

impl<T: Clone + Send + Sync + 'static> CacheStore<T> {
  pub fn new(ttl: Duration) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      ttl,
      storage: Arc::new(NoopStorage),
    }
  }

  /// Persist successful entries to the given backend and hydrate misses from it.
  pub fn with_storage(mut self, storage: Arc<dyn CacheStorage<T>>) -> Self {
    self.storage = storage;
    self
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry<T>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_expired(&self, entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
    // Entries that were never fetched are in flight; keep them
    entry
      .expires_from()
      .map(|at| age(at, now) > self.ttl)
      .unwrap_or(false)
  }

  /// Look up an entry, dropping it first if it has expired.
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.get_at(key, Utc::now())
  }

  pub fn get_at(&self, key: &QueryKey, now: DateTime<Utc>) -> Option<CacheEntry<T>> {
    if self.contains(key) {
      return self.peek_at(key, now);
    }
    self.hydrate(key, now)
  }

  /// Memory-only lookup; never touches persistent storage.
  pub(crate) fn peek_at(&self, key: &QueryKey, now: DateTime<Utc>) -> Option<CacheEntry<T>> {
    let mut entries = self.lock();
    let entry = entries.get(key)?;
    if !self.is_expired(entry, now) {
      return Some(entry.clone());
    }
    debug!(key = %key, "evicting expired entry");
    entries.remove(key);
    None
  }

  /// Load the persisted copy of a key into memory unless memory already has one.
  pub(crate) fn warm(&self, key: &QueryKey, now: DateTime<Utc>) {
    if !self.contains(key) {
      self.hydrate(key, now);
    }
  }

  fn contains(&self, key: &QueryKey) -> bool {
    self.lock().contains_key(key)
  }

  /// Fill a memory miss from persistent storage.
  fn hydrate(&self, key: &QueryKey, now: DateTime<Utc>) -> Option<CacheEntry<T>> {
    let stored = match self.storage.load(key) {
      Ok(stored) => stored?,
      Err(e) => {
        warn!(key = %key, error = %e, "failed to load persisted entry");
        return None;
      }
    };
    let entry = CacheEntry::success(key.clone(), stored.data, stored.fetched_at);
    if self.is_expired(&entry, now) {
      return None;
    }
    debug!(key = %key, "hydrated entry from storage");

    let mut entries = self.lock();
    // A concurrent writer may have populated the key meanwhile; it wins
    Some(entries.entry(key.clone()).or_insert(entry).clone())
  }

  /// Store an entry, overwriting any existing one.
  pub fn put(&self, key: QueryKey, entry: CacheEntry<T>) {
    self.lock().insert(key.clone(), entry.clone());
    self.persist(&key, &entry);
  }

  /// Write a successful entry through to persistent storage.
  pub(crate) fn persist(&self, key: &QueryKey, entry: &CacheEntry<T>) {
    let (QueryStatus::Success, Some(data), Some(at)) = (&entry.status, &entry.data, entry.fetched_at)
    else {
      return;
    };
    if let Err(e) = self.storage.store(key, data, at) {
      warn!(key = %key, error = %e, "failed to persist entry");
    }
  }

  /// Mark an entry stale without deleting its data.
  ///
  /// Returns whether an entry existed.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    match self.lock().get_mut(key) {
      Some(entry) => {
        entry.invalidated = true;
        true
      }
      None => false,
    }
  }

  /// Remove every entry fetched longer ago than the ttl.
  ///
  /// Returns the number of in-memory entries removed.
  pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
    let removed = {
      let mut entries = self.lock();
      let before = entries.len();
      entries.retain(|_, entry| !self.is_expired(entry, now));
      before - entries.len()
    };

    if let Ok(ttl) = chrono::Duration::from_std(self.ttl) {
      if let Err(e) = self.storage.purge_before(now - ttl) {
        warn!(error = %e, "failed to purge persisted entries");
      }
    }

    if removed > 0 {
      debug!(removed, "evicted expired entries");
    }
    removed
  }

  pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    let removed = self.lock().remove(key);
    if let Err(e) = self.storage.remove(key) {
      warn!(key = %key, error = %e, "failed to remove persisted entry");
    }
    removed
  }

  pub fn clear(&self) {
    self.lock().clear();
    if let Err(e) = self.storage.clear() {
      warn!(error = %e, "failed to clear persisted entries");
    }
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  // ==========================================================================
  // Lifecycle transitions, driven by the fetch coordinator
  // ==========================================================================

  /// First fetch for a key has started. Entries with data keep their status.
  pub(crate) fn mark_loading(&self, key: &QueryKey) {
    let mut entries = self.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone()));
    if entry.data.is_none() {
      entry.status = QueryStatus::Loading;
    }
  }

  /// Record fetched data in memory. The caller persists the returned entry.
  pub(crate) fn record_success(&self, key: &QueryKey, data: T, now: DateTime<Utc>) -> CacheEntry<T> {
    let entry = CacheEntry::success(key.clone(), data, now);
    self.lock().insert(key.clone(), entry.clone());
    entry
  }

  /// Record a terminal failure, keeping previously fetched data.
  pub(crate) fn record_error(
    &self,
    key: &QueryKey,
    error: FetchError,
    now: DateTime<Utc>,
  ) -> CacheEntry<T> {
    let mut entries = self.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone()));
    entry.status = QueryStatus::Error;
    entry.error = Some(error);
    entry.error_at = Some(now);
    entry.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use chrono::Duration as ChronoDuration;
  use serde_json::{json, Value};

  fn key(id: &str) -> QueryKey {
    QueryKey::builder("detail").push(id).build().unwrap()
  }

  #[test]
  fn test_put_and_get() {
    let store = CacheStore::new(Duration::from_secs(120));
    store.put(key("a"), CacheEntry::success(key("a"), 1, Utc::now()));

    let entry = store.get(&key("a")).unwrap();
    assert_eq!(entry.data, Some(1));
    assert_eq!(entry.status, QueryStatus::Success);
    assert!(store.get(&key("b")).is_none());
  }

  #[test]
  fn test_put_overwrites() {
    let store = CacheStore::new(Duration::from_secs(120));
    store.put(key("a"), CacheEntry::success(key("a"), 1, Utc::now()));
    store.put(key("a"), CacheEntry::success(key("a"), 2, Utc::now()));

    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&key("a")).unwrap().data, Some(2));
  }

  #[test]
  fn test_invalidate_keeps_data() {
    let store = CacheStore::new(Duration::from_secs(120));
    store.put(key("a"), CacheEntry::success(key("a"), 1, Utc::now()));

    assert!(store.invalidate(&key("a")));
    assert!(!store.invalidate(&key("missing")));

    let entry = store.get(&key("a")).unwrap();
    assert!(entry.invalidated);
    assert_eq!(entry.data, Some(1));
  }

  #[test]
  fn test_evict_expired() {
    let store = CacheStore::new(Duration::from_secs(120));
    let now = Utc::now();
    store.put(
      key("old"),
      CacheEntry::success(key("old"), 1, now - ChronoDuration::seconds(300)),
    );
    store.put(key("new"), CacheEntry::success(key("new"), 2, now));

    assert_eq!(store.evict_expired(now), 1);
    assert!(store.get_at(&key("old"), now).is_none());
    assert!(store.get_at(&key("new"), now).is_some());
  }

  #[test]
  fn test_recent_error_does_not_extend_old_data() {
    let store = CacheStore::new(Duration::from_secs(120));
    let now = Utc::now();
    store.record_success(&key("a"), 1, now - ChronoDuration::seconds(300));
    store.record_error(&key("a"), FetchError::Transport("down".into()), now);

    assert_eq!(store.evict_expired(now), 1);
    assert!(store.get_at(&key("a"), now).is_none());
  }

  #[test]
  fn test_error_only_entry_ages_from_error() {
    let store: CacheStore<i32> = CacheStore::new(Duration::from_secs(120));
    let now = Utc::now();
    store.record_error(&key("a"), FetchError::Transport("down".into()), now);

    assert_eq!(store.evict_expired(now + ChronoDuration::seconds(60)), 0);
    assert_eq!(store.evict_expired(now + ChronoDuration::seconds(121)), 1);
  }

  #[test]
  fn test_record_success_leaves_storage_to_caller() {
    let storage: Arc<dyn CacheStorage<Value>> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let store = CacheStore::new(Duration::from_secs(120)).with_storage(storage.clone());

    let entry = store.record_success(&key("a"), json!(1), Utc::now());
    assert!(storage.load(&key("a")).unwrap().is_none());

    store.persist(&key("a"), &entry);
    assert_eq!(storage.load(&key("a")).unwrap().unwrap().data, json!(1));
  }

  #[test]
  fn test_peek_does_not_hydrate() {
    let storage: Arc<dyn CacheStorage<Value>> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.store(&key("a"), &json!(1), Utc::now()).unwrap();
    let store = CacheStore::new(Duration::from_secs(120)).with_storage(storage);
    let now = Utc::now();

    assert!(store.peek_at(&key("a"), now).is_none());
    store.warm(&key("a"), now);
    assert_eq!(store.peek_at(&key("a"), now).unwrap().data, Some(json!(1)));
  }

  #[test]
  fn test_get_evicts_lazily() {
    let store = CacheStore::new(Duration::from_secs(120));
    let now = Utc::now();
    store.put(key("a"), CacheEntry::success(key("a"), 1, now));

    let later = now + ChronoDuration::seconds(121);
    assert!(store.get_at(&key("a"), later).is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn test_loading_entries_never_expire() {
    let store: CacheStore<i32> = CacheStore::new(Duration::from_secs(1));
    store.mark_loading(&key("a"));

    let later = Utc::now() + ChronoDuration::days(1);
    assert_eq!(store.evict_expired(later), 0);
    assert_eq!(
      store.get_at(&key("a"), later).unwrap().status,
      QueryStatus::Loading
    );
  }

  #[test]
  fn test_record_error_keeps_data() {
    let store = CacheStore::new(Duration::from_secs(120));
    let now = Utc::now();
    store.record_success(&key("a"), 1, now);
    store.record_error(&key("a"), FetchError::Transport("down".into()), now);

    let entry = store.get(&key("a")).unwrap();
    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.data, Some(1));
    assert_eq!(entry.error, Some(FetchError::Transport("down".into())));
  }

  #[test]
  fn test_mark_loading_keeps_status_when_data_exists() {
    let store = CacheStore::new(Duration::from_secs(120));
    store.record_success(&key("a"), 1, Utc::now());
    store.mark_loading(&key("a"));
    assert_eq!(store.get(&key("a")).unwrap().status, QueryStatus::Success);

    store.mark_loading(&key("b"));
    assert_eq!(store.get(&key("b")).unwrap().status, QueryStatus::Loading);
  }

  #[test]
  fn test_hydrates_from_storage() {
    let storage: Arc<dyn CacheStorage<Value>> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let now = Utc::now();

    let first = CacheStore::new(Duration::from_secs(120)).with_storage(storage.clone());
    first.put(key("a"), CacheEntry::success(key("a"), json!({"title": "x"}), now));

    // A second store sharing the backend sees the entry
    let second = CacheStore::new(Duration::from_secs(120)).with_storage(storage);
    let entry = second.get(&key("a")).unwrap();
    assert_eq!(entry.data, Some(json!({"title": "x"})));
    assert_eq!(entry.status, QueryStatus::Success);
  }

  #[test]
  fn test_expired_persisted_entries_are_ignored() {
    let storage: Arc<dyn CacheStorage<Value>> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage
      .store(&key("a"), &json!(1), Utc::now() - ChronoDuration::seconds(600))
      .unwrap();

    let store = CacheStore::new(Duration::from_secs(120)).with_storage(storage);
    assert!(store.get(&key("a")).is_none());
  }
}
