use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::FetchError;
use crate::config::ApiConfig;

use super::api_types::{ChapterPages, ChapterRef, MangaDetail, MangaList, TagList, Thumbnail};
use super::types::{FilterState, MangaSource};

/// HTTP client for the manga backend.
///
/// Every call reports failures as [`FetchError`] so it can be used directly
/// as a cache producer.
#[derive(Clone)]
pub struct MangaClient {
  http: reqwest::Client,
  base_url: Url,
}

impl MangaClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let mut base_url =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Invalid API url {}: not a base url", config.url));
    }
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .default_headers(headers)
      .user_agent(concat!("yomu/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base_url })
  }

  /// Build `<base>/api/manga/<segments...>`. Segments are percent-encoded.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
    if let Some(blank) = segments.iter().find(|s| s.trim().is_empty()) {
      return Err(FetchError::Programmer(format!(
        "blank path segment {:?}",
        blank
      )));
    }
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| FetchError::Programmer(format!("{} cannot be a base url", self.base_url)))?
      .pop_if_empty()
      .extend(["api", "manga"])
      .extend(segments);
    Ok(url)
  }

  async fn get<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> Result<T, FetchError> {
    debug!(url = %url, "GET");
    let response = self
      .http
      .get(url.clone())
      .query(query)
      .send()
      .await
      .map_err(|e| FetchError::Transport(format!("Failed to request {}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Transport(format!(
        "{} returned {}",
        url, status
      )));
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Transport(format!("Failed to read response from {}: {}", url, e)))?;

    serde_json::from_slice(&body)
      .map_err(|e| FetchError::Validation(format!("Unexpected response from {}: {}", url, e)))
  }

  /// One page of the manga list. `page` is 1-based; `None` lets the backend
  /// pick the first page.
  pub async fn list(
    &self,
    source: MangaSource,
    filter: &FilterState,
    page: Option<u32>,
  ) -> Result<MangaList, FetchError> {
    let mut query = vec![
      ("type", source.as_str().to_string()),
      ("sort", filter.sort.as_str().to_string()),
      ("order", filter.order.as_str().to_string()),
    ];
    if let Some(page) = page {
      query.push(("page", page.to_string()));
    }
    if let Some(keyword) = filter.keyword() {
      query.push(("keyword", keyword.to_string()));
    }
    if let Some(tags) = filter.tag_param() {
      query.push(("tag", tags));
    }
    self.get(self.endpoint(&["list"])?, &query).await
  }

  pub async fn detail(&self, source: MangaSource, id: &str) -> Result<MangaDetail, FetchError> {
    self
      .get(self.endpoint(&["detail", id])?, &source_param(source))
      .await
  }

  pub async fn chapters(
    &self,
    source: MangaSource,
    manga_id: &str,
  ) -> Result<Vec<ChapterRef>, FetchError> {
    self
      .get(self.endpoint(&["chapter", manga_id])?, &source_param(source))
      .await
  }

  pub async fn chapter_pages(
    &self,
    source: MangaSource,
    manga_id: &str,
    chapter_id: &str,
  ) -> Result<ChapterPages, FetchError> {
    self
      .get(
        self.endpoint(&["chapter", manga_id, chapter_id])?,
        &source_param(source),
      )
      .await
  }

  pub async fn tags(&self, source: MangaSource) -> Result<TagList, FetchError> {
    self
      .get(self.endpoint(&["tag"])?, &source_param(source))
      .await
  }

  pub async fn thumbnail(&self, source: MangaSource, id: &str) -> Result<Thumbnail, FetchError> {
    // The backend spells this route "thumnail"
    self
      .get(self.endpoint(&["thumnail", id])?, &source_param(source))
      .await
  }
}

fn source_param(source: MangaSource) -> [(&'static str, String); 1] {
  [("type", source.as_str().to_string())]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manga::{SortField, SortOrder};
  use serde_json::json;
  use wiremock::matchers::{method, path, query_param, query_param_is_missing};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client_for(server: &MockServer) -> MangaClient {
    MangaClient::new(&ApiConfig {
      url: server.uri(),
      timeout_secs: 5,
    })
    .unwrap()
  }

  #[test]
  fn test_endpoint_joins_base_path() {
    let client = MangaClient::new(&ApiConfig {
      url: "http://example.test/backend".into(),
      timeout_secs: 5,
    })
    .unwrap();
    let url = client.endpoint(&["detail", "a b"]).unwrap();
    assert_eq!(url.as_str(), "http://example.test/backend/api/manga/detail/a%20b");
  }

  #[test]
  fn test_blank_segment_is_a_programmer_error() {
    let client = MangaClient::new(&ApiConfig::default()).unwrap();
    let err = client.endpoint(&["detail", ""]).unwrap_err();
    assert!(matches!(err, FetchError::Programmer(_)));
    assert!(!err.is_retryable());
  }

  #[test]
  fn test_invalid_base_url() {
    let result = MangaClient::new(&ApiConfig {
      url: "not a url".into(),
      timeout_secs: 5,
    });
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_list_sends_filter_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/list"))
      .and(query_param("type", "nettruyen"))
      .and(query_param("sort", "name"))
      .and(query_param("order", "asc"))
      .and(query_param("page", "2"))
      .and(query_param("keyword", "hero"))
      .and(query_param("tag", "action,drama"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": [{ "_id": "m1", "title": "Hero" }],
        "canNext": false
      })))
      .expect(1)
      .mount(&server)
      .await;

    let mut filter = FilterState::default().with_keyword(Some("hero"));
    filter.sort = SortField::Name;
    filter.order = SortOrder::Asc;
    filter.toggle_tag("drama");
    filter.toggle_tag("action");

    let list = client_for(&server)
      .list(MangaSource::Nettruyen, &filter, Some(2))
      .await
      .unwrap();
    assert_eq!(list.data.len(), 1);
    assert!(!list.can_next);
  }

  #[tokio::test]
  async fn test_list_omits_unset_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/list"))
      .and(query_param("type", "blogtruyen"))
      .and(query_param_is_missing("page"))
      .and(query_param_is_missing("keyword"))
      .and(query_param_is_missing("tag"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [], "canNext": true })))
      .expect(1)
      .mount(&server)
      .await;

    let list = client_for(&server)
      .list(MangaSource::Blogtruyen, &FilterState::default(), None)
      .await
      .unwrap();
    assert!(list.can_next);
  }

  #[tokio::test]
  async fn test_http_error_is_transport() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/detail/m1"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let err = client_for(&server)
      .detail(MangaSource::Blogtruyen, "m1")
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)));
  }

  #[tokio::test]
  async fn test_bad_shape_is_validation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/thumnail/m1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "url": "x" })))
      .mount(&server)
      .await;

    let err = client_for(&server)
      .thumbnail(MangaSource::Blogtruyen, "m1")
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Validation(_)));
  }

  #[tokio::test]
  async fn test_chapter_pages_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/manga/chapter/m1/c2"))
      .and(query_param("type", "blogtruyen"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": [{ "_id": "p1", "src": "https://img/1.jpg" }],
        "canPrev": true,
        "canNext": false
      })))
      .mount(&server)
      .await;

    let pages = client_for(&server)
      .chapter_pages(MangaSource::Blogtruyen, "m1", "c2")
      .await
      .unwrap();
    assert_eq!(pages.data.len(), 1);
    assert_eq!(pages.next_chapter_id(), None);
  }
}
