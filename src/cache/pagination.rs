//! Infinite lists: ordered pages accumulated per base key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::coordinator::FetchCoordinator;
use super::key::QueryKey;
use super::traits::{CacheSource, FetchError};

/// One fetched batch of list items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<I> {
  pub items: Vec<I>,
  /// More data is available after this page
  pub has_next: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
  /// The last page reported no more data
  #[error("no more pages for {0}")]
  Exhausted(String),

  #[error(transparent)]
  Fetch(#[from] FetchError),
}

struct PageSet<I> {
  pages: Vec<Page<I>>,
  /// Changes on every reset so that late results of an earlier session are dropped
  epoch: u64,
}

impl<I> PageSet<I> {
  fn has_next(&self) -> bool {
    self.pages.last().map(|p| p.has_next).unwrap_or(true)
  }
}

/// Ordered pages per base key.
///
/// Pages are kept in append order; the caller is responsible for appending
/// them in request order.
pub struct PaginationAccumulator<I> {
  sessions: Mutex<HashMap<QueryKey, PageSet<I>>>,
  next_epoch: AtomicU64,
}

impl<I: Clone> Default for PaginationAccumulator<I> {
  fn default() -> Self {
    Self::new()
  }
}

impl<I: Clone> PaginationAccumulator<I> {
  pub fn new() -> Self {
    Self {
      sessions: Mutex::new(HashMap::new()),
      next_epoch: AtomicU64::new(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, PageSet<I>>> {
    self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn new_set(&self) -> PageSet<I> {
    PageSet {
      pages: Vec::new(),
      epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
    }
  }

  /// Append a page. Rejected once the previous page reported no more data.
  pub fn append(&self, base_key: &QueryKey, page: Page<I>) -> Result<usize, PageError> {
    let mut sessions = self.lock();
    let set = sessions
      .entry(base_key.clone())
      .or_insert_with(|| self.new_set());
    if !set.has_next() {
      return Err(PageError::Exhausted(base_key.to_string()));
    }
    set.pages.push(page);
    Ok(set.pages.len())
  }

  /// Append a page only if the session has not been reset since `epoch`.
  ///
  /// Returns `Ok(None)` when the page belongs to an earlier session.
  pub fn append_in_epoch(
    &self,
    base_key: &QueryKey,
    epoch: u64,
    page: Page<I>,
  ) -> Result<Option<usize>, PageError> {
    let mut sessions = self.lock();
    match sessions.get_mut(base_key) {
      Some(set) if set.epoch == epoch => {
        if !set.has_next() {
          return Err(PageError::Exhausted(base_key.to_string()));
        }
        set.pages.push(page);
        Ok(Some(set.pages.len()))
      }
      _ => Ok(None),
    }
  }

  /// Current session epoch, starting a session if there is none.
  pub fn epoch(&self, base_key: &QueryKey) -> u64 {
    let mut sessions = self.lock();
    sessions
      .entry(base_key.clone())
      .or_insert_with(|| self.new_set())
      .epoch
  }

  /// Clear all pages and allow appends again.
  pub fn reset(&self, base_key: &QueryKey) {
    let set = self.new_set();
    self.lock().insert(base_key.clone(), set);
  }

  /// Forget a session entirely.
  pub fn discard(&self, base_key: &QueryKey) {
    self.lock().remove(base_key);
  }

  /// All items of all pages, in page order.
  pub fn flatten(&self, base_key: &QueryKey) -> Vec<I> {
    self
      .lock()
      .get(base_key)
      .map(|set| {
        set
          .pages
          .iter()
          .flat_map(|page| page.items.iter().cloned())
          .collect()
      })
      .unwrap_or_default()
  }

  /// Whether another page may be appended.
  pub fn has_next(&self, base_key: &QueryKey) -> bool {
    self
      .lock()
      .get(base_key)
      .map(PageSet::has_next)
      .unwrap_or(true)
  }

  pub fn page_count(&self, base_key: &QueryKey) -> usize {
    self
      .lock()
      .get(base_key)
      .map(|set| set.pages.len())
      .unwrap_or(0)
  }
}

/// Converts a cached payload into a page of items
type PageConverter<T, I> = dyn Fn(T) -> Result<Page<I>, FetchError> + Send + Sync;

/// Drives an infinite list through a [`FetchCoordinator`].
///
/// Each page is cached under `base_key.with_page(n)`. Page fetches for one
/// base key are serialized, so pages always arrive in request order.
pub struct InfiniteQuery<T, I> {
  coordinator: FetchCoordinator<T>,
  pages: PaginationAccumulator<I>,
  locks: Mutex<HashMap<QueryKey, Arc<tokio::sync::Mutex<()>>>>,
  to_page: Arc<PageConverter<T, I>>,
}

impl<T, I> InfiniteQuery<T, I>
where
  T: Clone + Send + Sync + 'static,
  I: Clone + Send + 'static,
{
  pub fn new<C>(coordinator: FetchCoordinator<T>, to_page: C) -> Self
  where
    C: Fn(T) -> Result<Page<I>, FetchError> + Send + Sync + 'static,
  {
    Self {
      coordinator,
      pages: PaginationAccumulator::new(),
      locks: Mutex::new(HashMap::new()),
      to_page: Arc::new(to_page),
    }
  }

  fn lock_for(&self, base_key: &QueryKey) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(base_key.clone()).or_default())
  }

  /// Fetch and append the next page.
  ///
  /// `fetch_page` receives the 1-based page number. Returns the number of
  /// the appended page, or `None` if the session was reset meanwhile.
  pub async fn fetch_next_page<F, Fut>(
    &self,
    base_key: &QueryKey,
    fetch_page: F,
  ) -> Result<Option<u32>, PageError>
  where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.next_page(base_key, fetch_page, false).await
  }

  /// Like `fetch_next_page`, but ignores cached copies of the page.
  pub async fn refetch_next_page<F, Fut>(
    &self,
    base_key: &QueryKey,
    fetch_page: F,
  ) -> Result<Option<u32>, PageError>
  where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.next_page(base_key, fetch_page, true).await
  }

  async fn next_page<F, Fut>(
    &self,
    base_key: &QueryKey,
    fetch_page: F,
    force: bool,
  ) -> Result<Option<u32>, PageError>
  where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let lock = self.lock_for(base_key);
    let _serial = lock.lock().await;

    if !self.pages.has_next(base_key) {
      return Err(PageError::Exhausted(base_key.to_string()));
    }
    let epoch = self.pages.epoch(base_key);
    let page_number = u32::try_from(self.pages.page_count(base_key))
      .unwrap_or(u32::MAX - 1)
      + 1;
    let page_key = base_key.with_page(page_number);

    let producer = move || fetch_page(page_number);
    let result = if force {
      self.coordinator.refetch(&page_key, producer).await
    } else {
      self.coordinator.resolve(&page_key, producer).await
    };
    debug!(key = %page_key, source = ?result.source, "page resolved");
    if result.source == CacheSource::None {
      if let Some(error) = result.error {
        return Err(error.into());
      }
    }
    let page = (self.to_page)(result.into_data()?)?;

    Ok(
      self
        .pages
        .append_in_epoch(base_key, epoch, page)?
        .map(|_| page_number),
    )
  }

  pub fn flatten(&self, base_key: &QueryKey) -> Vec<I> {
    self.pages.flatten(base_key)
  }

  pub fn has_next(&self, base_key: &QueryKey) -> bool {
    self.pages.has_next(base_key)
  }

  pub fn page_count(&self, base_key: &QueryKey) -> usize {
    self.pages.page_count(base_key)
  }

  /// Start the session over, e.g. after a pull-to-refresh.
  ///
  /// Cached pages are invalidated so they are refetched.
  pub fn reset(&self, base_key: &QueryKey) {
    for n in 1..=self.pages.page_count(base_key) {
      let page = u32::try_from(n).unwrap_or(u32::MAX);
      self.coordinator.invalidate(&base_key.with_page(page));
    }
    self.pages.reset(base_key);
  }

  /// Drop a session whose view went away.
  ///
  /// The page lock survives while a fetch still holds it, so a session
  /// restarted on the same key keeps waiting for that fetch.
  pub fn discard(&self, base_key: &QueryKey) {
    self.pages.discard(base_key);
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    if locks
      .get(base_key)
      .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
      locks.remove(base_key);
    }
  }
}
