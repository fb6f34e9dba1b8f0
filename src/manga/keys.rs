//! Query keys for the manga backend.

use crate::cache::{KeyError, QueryKey};

use super::types::{FilterState, MangaSource};

/// Every cacheable manga request.
///
/// The source and filter are part of the key, so switching either one
/// never serves data cached for the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MangaQuery {
  /// Latest updates shown on the home screen
  Home { source: MangaSource },
  /// Base key of a search session; pages extend it with `with_page`
  Search {
    source: MangaSource,
    filter: FilterState,
  },
  Detail {
    source: MangaSource,
    id: String,
  },
  Chapters {
    source: MangaSource,
    manga_id: String,
  },
  ChapterPages {
    source: MangaSource,
    manga_id: String,
    chapter_id: String,
  },
  Tags { source: MangaSource },
  Thumbnail {
    source: MangaSource,
    id: String,
  },
}

impl MangaQuery {
  pub fn key(&self) -> Result<QueryKey, KeyError> {
    match self {
      MangaQuery::Home { source } => QueryKey::builder("home")
        .push(source.as_str())
        .build(),
      MangaQuery::Search { source, filter } => QueryKey::builder("search")
        .push(source.as_str())
        .push(filter.sort.as_str())
        .push(filter.order.as_str())
        .push_opt(filter.keyword())
        .push_set(filter.tags.iter().map(String::as_str))
        .build(),
      MangaQuery::Detail { source, id } => QueryKey::builder("detail")
        .push(source.as_str())
        .push_id("id", id)
        .build(),
      MangaQuery::Chapters { source, manga_id } => QueryKey::builder("chapters")
        .push(source.as_str())
        .push_id("manga_id", manga_id)
        .build(),
      MangaQuery::ChapterPages {
        source,
        manga_id,
        chapter_id,
      } => QueryKey::builder("chapter_pages")
        .push(source.as_str())
        .push_id("manga_id", manga_id)
        .push_id("chapter_id", chapter_id)
        .build(),
      MangaQuery::Tags { source } => QueryKey::builder("tags")
        .push(source.as_str())
        .build(),
      MangaQuery::Thumbnail { source, id } => QueryKey::builder("thumbnail")
        .push(source.as_str())
        .push_id("id", id)
        .build(),
    }
  }
}
