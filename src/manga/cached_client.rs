//! Cached manga client that wraps MangaClient with transparent caching.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::cache::{
  CacheStorage, FetchCoordinator, FetchError, InfiniteQuery, Page, PageError, QueryKey, QueryResult,
  SqliteStorage,
};
use crate::config::Config;

use super::api_types::{ChapterPages, ChapterRef, MangaDetail, MangaList, MangaSummary, TagList, Thumbnail};
use super::client::MangaClient;
use super::keys::MangaQuery;
use super::types::{FilterState, MangaSource};

/// Manga client with transparent caching support.
///
/// Responses are cached as JSON values keyed by [`MangaQuery`], so one
/// coordinator (and one persistent table) serves every endpoint.
#[derive(Clone)]
pub struct CachedMangaClient {
  inner: MangaClient,
  cache: FetchCoordinator<Value>,
  /// Bypass fresh cache entries and wait for the network
  force_refetch: bool,
}

impl CachedMangaClient {
  /// Create a new cached client. Persists to the data directory unless
  /// `cache.persist` is off.
  pub fn new(config: &Config) -> Result<Self> {
    let inner = MangaClient::new(&config.api)?;
    let options = config.cache.query_options();
    let cache = if config.cache.persist {
      let storage: Arc<dyn CacheStorage<Value>> = Arc::new(SqliteStorage::open()?);
      FetchCoordinator::with_storage(options, storage)
    } else {
      FetchCoordinator::new(options)
    };
    Ok(Self::with_parts(inner, cache))
  }

  pub fn with_parts(inner: MangaClient, cache: FetchCoordinator<Value>) -> Self {
    Self {
      inner,
      cache,
      force_refetch: false,
    }
  }

  /// A handle sharing this cache whose reads always hit the network, like a
  /// pull-to-refresh. Cached data is still reported if the refetch fails.
  pub fn refreshing(&self) -> Self {
    Self {
      force_refetch: true,
      ..self.clone()
    }
  }

  /// Resolve a query through the cache and decode the payload.
  async fn query<T, F, Fut>(&self, query: MangaQuery, fetch: F) -> Result<QueryResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(MangaClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let key = query.key()?;
    let producer = self.producer::<T, _, _>(fetch);
    let result = if self.force_refetch {
      self.cache.refetch(&key, producer).await
    } else {
      self.cache.resolve(&key, producer).await
    };
    result
      .try_map(decode::<T>)
      .map_err(|e| eyre!("Failed to decode cached {}: {}", key, e))
  }

  fn producer<T, F, Fut>(
    &self,
    fetch: F,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync + 'static
  where
    T: Serialize + Send + 'static,
    F: Fn(MangaClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let client = self.inner.clone();
    move || {
      let request = fetch(client.clone());
      async move { encode(&request.await?) }.boxed()
    }
  }

  /// Latest updates for the home screen.
  pub async fn home(&self, source: MangaSource) -> Result<QueryResult<MangaList>> {
    self
      .query(MangaQuery::Home { source }, move |client: MangaClient| async move {
        client.list(source, &FilterState::default(), None).await
      })
      .await
  }

  pub async fn detail(&self, source: MangaSource, id: &str) -> Result<QueryResult<MangaDetail>> {
    let owned = id.to_string();
    self
      .query(
        MangaQuery::Detail {
          source,
          id: id.to_string(),
        },
        move |client: MangaClient| {
          let id = owned.clone();
          async move { client.detail(source, &id).await }
        },
      )
      .await
  }

  pub async fn chapters(
    &self,
    source: MangaSource,
    manga_id: &str,
  ) -> Result<QueryResult<Vec<ChapterRef>>> {
    let owned = manga_id.to_string();
    self
      .query(
        MangaQuery::Chapters {
          source,
          manga_id: manga_id.to_string(),
        },
        move |client: MangaClient| {
          let manga_id = owned.clone();
          async move { client.chapters(source, &manga_id).await }
        },
      )
      .await
  }

  pub async fn chapter_pages(
    &self,
    source: MangaSource,
    manga_id: &str,
    chapter_id: &str,
  ) -> Result<QueryResult<ChapterPages>> {
    let (key, fetch) = self.chapter_pages_query(source, manga_id, chapter_id);
    self.query(key, fetch).await
  }

  /// Start loading a chapter in the background, e.g. the one after the
  /// chapter being read. Returns whether a fetch was started.
  pub fn prefetch_chapter_pages(
    &self,
    source: MangaSource,
    manga_id: &str,
    chapter_id: &str,
  ) -> Result<bool> {
    let (query, fetch) = self.chapter_pages_query(source, manga_id, chapter_id);
    let key = query.key()?;
    Ok(
      self
        .cache
        .prefetch(&key, self.producer::<ChapterPages, _, _>(fetch)),
    )
  }

  fn chapter_pages_query(
    &self,
    source: MangaSource,
    manga_id: &str,
    chapter_id: &str,
  ) -> (
    MangaQuery,
    impl Fn(MangaClient) -> BoxFuture<'static, Result<ChapterPages, FetchError>> + Send + Sync + 'static,
  ) {
    let query = MangaQuery::ChapterPages {
      source,
      manga_id: manga_id.to_string(),
      chapter_id: chapter_id.to_string(),
    };
    let (manga_id, chapter_id) = (manga_id.to_string(), chapter_id.to_string());
    let fetch = move |client: MangaClient| {
      let (manga_id, chapter_id) = (manga_id.clone(), chapter_id.clone());
      async move { client.chapter_pages(source, &manga_id, &chapter_id).await }.boxed()
    };
    (query, fetch)
  }

  pub async fn tags(&self, source: MangaSource) -> Result<QueryResult<TagList>> {
    self
      .query(MangaQuery::Tags { source }, move |client: MangaClient| async move {
        client.tags(source).await
      })
      .await
  }

  pub async fn thumbnail(&self, source: MangaSource, id: &str) -> Result<QueryResult<Thumbnail>> {
    let owned = id.to_string();
    self
      .query(
        MangaQuery::Thumbnail {
          source,
          id: id.to_string(),
        },
        move |client: MangaClient| {
          let id = owned.clone();
          async move { client.thumbnail(source, &id).await }
        },
      )
      .await
  }

  /// Mark a query stale so the next read refetches it.
  pub fn invalidate(&self, query: &MangaQuery) -> Result<bool> {
    Ok(self.cache.invalidate(&query.key()?))
  }

  /// Start a paginated search session for the given filter.
  ///
  /// Every session keeps its own page list. Sessions on the same filter
  /// share cached pages through the coordinator.
  pub fn search(&self, source: MangaSource, filter: FilterState) -> Result<SearchSession> {
    let base_key = MangaQuery::Search {
      source,
      filter: filter.clone(),
    }
    .key()?;
    let pages = InfiniteQuery::new(self.cache.clone(), |value: Value| {
      let list: MangaList = decode(value)?;
      Ok(Page {
        items: list.data,
        has_next: list.can_next,
      })
    });
    Ok(SearchSession {
      client: self.clone(),
      pages,
      source,
      filter,
      base_key,
    })
  }

  /// Wait for background refetches and prefetches to finish.
  pub async fn settle(&self) {
    self.cache.settle().await;
  }

  /// Drop expired entries from memory and disk.
  pub fn evict_expired(&self) -> usize {
    let removed = self.cache.evict_expired();
    info!(removed, "evicted expired cache entries");
    removed
  }

  pub fn clear_cache(&self) {
    self.cache.store().clear();
    info!("cleared cache");
  }
}

/// A search result list that grows page by page.
///
/// Changing the source or filter starts over with a new session; pages of
/// the previous session are dropped, including ones still in flight.
pub struct SearchSession {
  client: CachedMangaClient,
  pages: InfiniteQuery<Value, MangaSummary>,
  source: MangaSource,
  filter: FilterState,
  base_key: QueryKey,
}

impl SearchSession {
  pub fn source(&self) -> MangaSource {
    self.source
  }

  pub fn filter(&self) -> &FilterState {
    &self.filter
  }

  /// Apply a new filter. Returns whether the session was restarted.
  pub fn set_filter(&mut self, filter: FilterState) -> Result<bool> {
    self.retarget(self.source, filter)
  }

  pub fn set_source(&mut self, source: MangaSource) -> Result<bool> {
    self.retarget(source, self.filter.clone())
  }

  fn retarget(&mut self, source: MangaSource, filter: FilterState) -> Result<bool> {
    let base_key = MangaQuery::Search {
      source,
      filter: filter.clone(),
    }
    .key()?;
    self.source = source;
    self.filter = filter;
    if base_key == self.base_key {
      return Ok(false);
    }

    self.pages.discard(&self.base_key);
    self.base_key = base_key;
    self.pages.reset(&self.base_key);
    Ok(true)
  }

  /// Fetch the next page. Returns its number, or `None` if the session was
  /// restarted while the page was loading.
  pub async fn load_more(&self) -> Result<Option<u32>, PageError> {
    let client = self.client.inner.clone();
    let source = self.source;
    let filter = self.filter.clone();
    let fetch_page = move |page| {
      let client = client.clone();
      let filter = filter.clone();
      async move { encode(&client.list(source, &filter, Some(page)).await?) }
    };
    if self.client.force_refetch {
      self.pages.refetch_next_page(&self.base_key, fetch_page).await
    } else {
      self.pages.fetch_next_page(&self.base_key, fetch_page).await
    }
  }

  /// All loaded items in page order.
  pub fn items(&self) -> Vec<MangaSummary> {
    self.pages.flatten(&self.base_key)
  }

  pub fn has_next(&self) -> bool {
    self.pages.has_next(&self.base_key)
  }

  pub fn page_count(&self) -> usize {
    self.pages.page_count(&self.base_key)
  }

  /// Start over from the first page, refetching cached pages.
  pub fn refresh(&self) {
    self.pages.reset(&self.base_key);
  }
}

fn encode<T: Serialize>(data: &T) -> Result<Value, FetchError> {
  serde_json::to_value(data).map_err(|e| FetchError::Programmer(format!("Failed to encode response: {}", e)))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FetchError> {
  serde_json::from_value(value).map_err(|e| FetchError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, QueryOptions, QueryStatus};
  use crate::config::ApiConfig;
  use serde_json::json;
  use wiremock::matchers::{method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client_for(server: &MockServer) -> CachedMangaClient {
    let inner = MangaClient::new(&ApiConfig {
      url: server.uri(),
      timeout_secs: 5,
    })
    .unwrap();
    CachedMangaClient::with_parts(inner, FetchCoordinator::new(QueryOptions::default()))
  }

  fn summaries(prefix: &str, count: usize) -> Value {
    Value::Array(
      (0..count)
        .map(|i| json!({ "_id": format!("{}{}", prefix, i), "title": format!("Manga {}", i) }))
        .collect(),
    )
  }

  async fn mount_page(server: &MockServer, page: u32, prefix: &str, can_next: bool) {
    Mock::given(method("GET"))
      .and(path("/api/manga/list"))
      .and(query_param("page", page.to_string()))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": summaries(prefix, 5),
        "canNext": can_next
      })))
      .expect(1)
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn test_detail_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/detail/m1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "_id": "m1",
        "title": "One"
      })))
      .expect(1)
      .mount(&server)
      .await;

    let client = client_for(&server);
    let first = client.detail(MangaSource::Blogtruyen, "m1").await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data.unwrap().title, "One");

    let second = client.detail(MangaSource::Blogtruyen, "m1").await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data.unwrap().id, "m1");
  }

  #[tokio::test]
  async fn test_sources_are_cached_separately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/tag"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": [{ "_id": "t1", "name": "Action" }],
        "total": 1
      })))
      .expect(2)
      .mount(&server)
      .await;

    let client = client_for(&server);
    client.tags(MangaSource::Blogtruyen).await.unwrap();
    client.tags(MangaSource::Nettruyen).await.unwrap();
    client.tags(MangaSource::Nettruyen).await.unwrap();
  }

  #[tokio::test]
  async fn test_failure_without_data_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/chapter/m1"))
      .respond_with(ResponseTemplate::new(500))
      .expect(3)
      .mount(&server)
      .await;

    let client = client_for(&server);
    let result = client.chapters(MangaSource::Blogtruyen, "m1").await.unwrap();
    assert_eq!(result.status, QueryStatus::Error);
    assert_eq!(result.source, CacheSource::None);
    assert!(result.data.is_none());
    assert!(matches!(result.into_data(), Err(FetchError::Transport(_))));
  }

  #[tokio::test]
  async fn test_blank_id_fails_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let client = client_for(&server);
    assert!(client.detail(MangaSource::Blogtruyen, " ").await.is_err());
    assert!(client.prefetch_chapter_pages(MangaSource::Blogtruyen, "m1", "").is_err());
  }

  #[tokio::test]
  async fn test_prefetched_chapter_is_fresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/chapter/m1/c2"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": [{ "_id": "p1", "src": "https://img/1.jpg" }],
        "canNext": false
      })))
      .expect(1)
      .mount(&server)
      .await;

    let client = client_for(&server);
    assert!(client
      .prefetch_chapter_pages(MangaSource::Blogtruyen, "m1", "c2")
      .unwrap());
    client.settle().await;

    let pages = client
      .chapter_pages(MangaSource::Blogtruyen, "m1", "c2")
      .await
      .unwrap();
    assert_eq!(pages.source, CacheSource::CacheFresh);
    assert_eq!(pages.data.unwrap().data.len(), 1);
  }

  #[tokio::test]
  async fn test_refreshing_client_bypasses_fresh_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/thumnail/m1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "src": "https://img/t.jpg" })))
      .expect(2)
      .mount(&server)
      .await;

    let client = client_for(&server);
    client.thumbnail(MangaSource::Blogtruyen, "m1").await.unwrap();
    let cached = client.thumbnail(MangaSource::Blogtruyen, "m1").await.unwrap();
    assert_eq!(cached.source, CacheSource::CacheFresh);

    let refreshed = client
      .refreshing()
      .thumbnail(MangaSource::Blogtruyen, "m1")
      .await
      .unwrap();
    assert_eq!(refreshed.source, CacheSource::Network);
    assert_eq!(refreshed.data.unwrap().src, "https://img/t.jpg");
  }

  #[tokio::test]
  async fn test_invalidate_serves_stale_and_refetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/tag"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [], "total": 0 })))
      .expect(2)
      .mount(&server)
      .await;

    let client = client_for(&server);
    let query = MangaQuery::Tags {
      source: MangaSource::Nettruyen,
    };
    assert!(!client.invalidate(&query).unwrap());
    client.tags(MangaSource::Nettruyen).await.unwrap();
    assert!(client.invalidate(&query).unwrap());

    let stale = client.tags(MangaSource::Nettruyen).await.unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert!(stale.is_fetching);
    client.settle().await;
  }

  #[tokio::test]
  async fn test_search_session_accumulates_pages() {
    let server = MockServer::start().await;
    mount_page(&server, 1, "a", true).await;
    mount_page(&server, 2, "b", false).await;

    let client = client_for(&server);
    let session = client
      .search(MangaSource::Nettruyen, FilterState::default())
      .unwrap();

    assert_eq!(session.load_more().await.unwrap(), Some(1));
    assert_eq!(session.items().len(), 5);
    assert!(session.has_next());

    assert_eq!(session.load_more().await.unwrap(), Some(2));
    let items = session.items();
    assert_eq!(items.len(), 10);
    assert_eq!(items[0].id, "a0");
    assert_eq!(items[9].id, "b4");
    assert!(!session.has_next());

    assert!(matches!(session.load_more().await, Err(PageError::Exhausted(_))));
  }

  #[tokio::test]
  async fn test_search_sessions_on_same_filter_are_independent() {
    let server = MockServer::start().await;
    mount_page(&server, 1, "a", true).await;
    mount_page(&server, 2, "b", false).await;

    let client = client_for(&server);
    let first = client
      .search(MangaSource::Nettruyen, FilterState::default())
      .unwrap();
    first.load_more().await.unwrap();

    let second = client
      .search(MangaSource::Nettruyen, FilterState::default())
      .unwrap();
    assert_eq!(first.page_count(), 1);
    assert_eq!(second.page_count(), 0);

    // Page 1 comes from the shared cache without a second request
    assert_eq!(second.load_more().await.unwrap(), Some(1));
    drop(second);

    assert_eq!(first.page_count(), 1);
    assert_eq!(first.load_more().await.unwrap(), Some(2));
    assert_eq!(first.items().len(), 10);
  }

  #[tokio::test]
  async fn test_search_filter_change_restarts_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/list"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": summaries("x", 3),
        "canNext": true
      })))
      .mount(&server)
      .await;

    let client = client_for(&server);
    let mut session = client
      .search(MangaSource::Nettruyen, FilterState::default())
      .unwrap();
    session.load_more().await.unwrap();
    assert_eq!(session.page_count(), 1);

    // Same logical filter keeps the session
    assert!(!session.set_filter(FilterState::default()).unwrap());
    assert_eq!(session.page_count(), 1);

    let filter = FilterState::default().with_keyword(Some("hero"));
    assert!(session.set_filter(filter).unwrap());
    assert_eq!(session.page_count(), 0);
    assert!(session.items().is_empty());
    assert!(session.has_next());

    assert!(session.set_source(MangaSource::Blogtruyen).unwrap());
    assert_eq!(session.filter().keyword(), Some("hero"));
  }
}
