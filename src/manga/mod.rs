//! Manga backend: API types, HTTP client, query keys and the cached client.

mod api_types;
mod cached_client;
mod client;
mod keys;
mod types;

pub use api_types::{
  ChapterImage, ChapterLink, ChapterPages, ChapterRef, CurrentChapter, MangaDetail, MangaList,
  MangaSummary, Named, TagList, Thumbnail,
};
pub use cached_client::{CachedMangaClient, SearchSession};
pub use client::MangaClient;
pub use keys::MangaQuery;
pub use types::{FilterState, MangaSource, SortField, SortOrder};
