//! Serde types matching the manga backend's JSON responses.
//!
//! These are also the cached representation, so every type round-trips
//! through `serde_json::Value` unchanged.

use serde::{Deserialize, Serialize};

// ============================================================================
// Shared nested types
// ============================================================================

/// A named reference such as a tag or an author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Named {
  #[serde(rename = "_id")]
  pub id: String,
  pub name: String,
}

/// A chapter entry as it appears in lists and on the detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRef {
  #[serde(rename = "_id")]
  pub id: String,
  /// Chapter number; negative means a one-shot
  pub chapter: f64,
  /// Publication time in epoch milliseconds
  #[serde(default)]
  pub time: Option<i64>,
  #[serde(default)]
  pub watched: Option<u64>,
}

impl ChapterRef {
  pub fn is_one_shot(&self) -> bool {
    self.chapter < 0.0
  }
}

// ============================================================================
// api/manga/list
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MangaSummary {
  #[serde(rename = "_id")]
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub thumbnail: Option<String>,
  #[serde(default)]
  pub chapters: Vec<ChapterRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaList {
  #[serde(default)]
  pub data: Vec<MangaSummary>,
  #[serde(default)]
  pub can_next: bool,
  #[serde(default)]
  pub can_prev: Option<bool>,
  #[serde(default)]
  pub total_page: Option<u32>,
}

// ============================================================================
// api/manga/detail/{id}
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaDetail {
  #[serde(rename = "_id")]
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub alt_title: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub watched: Option<u64>,
  #[serde(default)]
  pub followed: Option<u64>,
  #[serde(default)]
  pub authors: Vec<Named>,
  #[serde(default)]
  pub tags: Vec<Named>,
}

// ============================================================================
// api/manga/chapter/{manga_id}/{chapter_id}
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterImage {
  #[serde(rename = "_id")]
  pub id: String,
  #[serde(default)]
  pub src: Option<String>,
}

/// Link to a neighbouring chapter.
///
/// The backend reports either a chapter reference, a bare id, or a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChapterLink {
  Ref {
    #[serde(rename = "_id")]
    id: String,
  },
  Id(String),
  Flag(bool),
}

impl ChapterLink {
  /// Id of the linked chapter, when the backend named one.
  pub fn chapter_id(&self) -> Option<&str> {
    match self {
      ChapterLink::Ref { id } | ChapterLink::Id(id) => Some(id),
      ChapterLink::Flag(_) => None,
    }
  }

  pub fn exists(&self) -> bool {
    !matches!(self, ChapterLink::Flag(false))
  }
}

/// The chapter being read, with the sibling chapter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentChapter {
  pub chapter: f64,
  #[serde(default)]
  pub chapters: Vec<ChapterRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterPages {
  #[serde(default)]
  pub data: Vec<ChapterImage>,
  #[serde(default)]
  pub current: Option<CurrentChapter>,
  #[serde(default)]
  pub can_prev: Option<ChapterLink>,
  #[serde(default)]
  pub can_next: Option<ChapterLink>,
}

impl ChapterPages {
  /// Id of the next chapter, if the backend provided one.
  pub fn next_chapter_id(&self) -> Option<&str> {
    self.can_next.as_ref().and_then(ChapterLink::chapter_id)
  }
}

// ============================================================================
// api/manga/tag and api/manga/thumnail/{id}
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagList {
  #[serde(default)]
  pub data: Vec<Named>,
  #[serde(default)]
  pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
  pub src: String,
}
