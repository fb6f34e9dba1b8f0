//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::key::{KeyError, QueryKey};

/// Failure reported by a producer.
///
/// `Transport` and `Validation` are retried up to the retry budget.
/// `Programmer` means the request itself is malformed and fails fast.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  /// Network failure, timeout or unexpected HTTP status
  #[error("transport error: {0}")]
  Transport(String),

  /// Response did not have the expected shape
  #[error("invalid response: {0}")]
  Validation(String),

  /// Malformed key or request; never retried
  #[error("invalid request: {0}")]
  Programmer(String),
}

impl FetchError {
  pub fn is_retryable(&self) -> bool {
    !matches!(self, FetchError::Programmer(_))
  }
}

impl From<KeyError> for FetchError {
  fn from(err: KeyError) -> Self {
    FetchError::Programmer(err.to_string())
  }
}

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Known key, never fetched
  Idle,
  /// First fetch in progress, no data yet
  Loading,
  /// Last fetch succeeded
  Success,
  /// Last fetch exhausted its attempts
  Error,
}

/// Cached state for one query key.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: QueryKey,
  /// Last good payload. Kept across failed refetches.
  pub data: Option<T>,
  pub status: QueryStatus,
  /// When `data` was fetched
  pub fetched_at: Option<DateTime<Utc>>,
  pub error: Option<FetchError>,
  /// When `error` was recorded
  pub error_at: Option<DateTime<Utc>>,
  /// Marked stale by an explicit invalidation
  pub invalidated: bool,
}

impl<T> CacheEntry<T> {
  pub fn new(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      status: QueryStatus::Idle,
      fetched_at: None,
      error: None,
      error_at: None,
      invalidated: false,
    }
  }

  /// A successful entry fetched at the given time.
  pub fn success(key: QueryKey, data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      key,
      data: Some(data),
      status: QueryStatus::Success,
      fetched_at: Some(fetched_at),
      error: None,
      error_at: None,
      invalidated: false,
    }
  }

  /// Whether the data may be served without refetching.
  pub fn is_fresh(&self, stale_time: Duration, now: DateTime<Utc>) -> bool {
    if self.invalidated || self.status != QueryStatus::Success {
      return false;
    }
    match self.fetched_at {
      Some(at) => age(at, now) < stale_time,
      None => false,
    }
  }

  /// Start of the entry's ttl: when its data was fetched.
  ///
  /// A later failure does not extend the life of old data. Entries that
  /// never held data age from their error.
  pub fn expires_from(&self) -> Option<DateTime<Utc>> {
    self.fetched_at.or(self.error_at)
  }
}

/// Age of a timestamp; clock skew into the future counts as zero.
pub fn age(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
  (now - at).to_std().unwrap_or(Duration::ZERO)
}

/// Result of a resolve, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
  /// The actual data, if any was ever fetched
  pub data: Option<T>,
  pub status: QueryStatus,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched
  pub fetched_at: Option<DateTime<Utc>>,
  /// Failure of the most recent fetch, reported alongside any stale data
  pub error: Option<FetchError>,
  /// A fetch for this key is running in the background
  pub is_fetching: bool,
}

impl<T: Clone> QueryResult<T> {
  pub(crate) fn from_entry(entry: &CacheEntry<T>, source: CacheSource, is_fetching: bool) -> Self {
    Self {
      data: entry.data.clone(),
      status: entry.status,
      source,
      fetched_at: entry.fetched_at,
      error: entry.error.clone(),
      is_fetching,
    }
  }
}

impl<T> QueryResult<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Stale data is preferred over an error; only no data at all is a failure.
  pub fn into_data(self) -> Result<T, FetchError> {
    match (self.data, self.error) {
      (Some(data), _) => Ok(data),
      (None, Some(err)) => Err(err),
      (None, None) => Err(FetchError::Transport("no data available".to_string())),
    }
  }

  /// Convert the payload, keeping the metadata.
  pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<QueryResult<U>, E> {
    let data = self.data.map(f).transpose()?;
    Ok(QueryResult {
      data,
      status: self.status,
      source: self.source,
      fetched_at: self.fetched_at,
      error: self.error,
      is_fetching: self.is_fetching,
    })
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the network during this call
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale; a refetch is in progress
  CacheStale,
  /// Refetch failed; serving the last good data
  Offline,
  /// Nothing cached and the fetch failed
  None,
}
