use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Backend provider the manga data is scraped from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MangaSource {
  Nettruyen,
  #[default]
  Blogtruyen,
}

impl MangaSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      MangaSource::Nettruyen => "nettruyen",
      MangaSource::Blogtruyen => "blogtruyen",
    }
  }

  pub fn display_name(&self) -> &'static str {
    match self {
      MangaSource::Nettruyen => "NetTruyen",
      MangaSource::Blogtruyen => "BlogTruyen",
    }
  }
}

impl fmt::Display for MangaSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Sort field accepted by the list endpoint.
///
/// `Lastest` is the backend's own spelling and is sent as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
  #[default]
  Lastest,
  Chapter,
  Name,
}

impl SortField {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortField::Lastest => "lastest",
      SortField::Chapter => "chapter",
      SortField::Name => "name",
    }
  }
}

impl fmt::Display for SortField {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  Asc,
  #[default]
  Desc,
}

impl SortOrder {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortOrder::Asc => "asc",
      SortOrder::Desc => "desc",
    }
  }
}

impl fmt::Display for SortOrder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Search filter applied to the manga list.
///
/// Tags are kept in a set, so selection order never changes the query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
  pub sort: SortField,
  pub order: SortOrder,
  pub tags: BTreeSet<String>,
  keyword: Option<String>,
}

impl FilterState {
  pub fn keyword(&self) -> Option<&str> {
    self.keyword.as_deref()
  }

  /// Set the search keyword. Blank input clears it.
  pub fn set_keyword(&mut self, keyword: Option<&str>) {
    self.keyword = keyword
      .map(str::trim)
      .filter(|k| !k.is_empty())
      .map(String::from);
  }

  pub fn with_keyword(mut self, keyword: Option<&str>) -> Self {
    self.set_keyword(keyword);
    self
  }

  /// Select a tag, or deselect it if already selected.
  ///
  /// Returns whether the tag is selected afterwards.
  pub fn toggle_tag(&mut self, tag: &str) -> bool {
    if self.tags.remove(tag) {
      false
    } else {
      self.tags.insert(tag.to_string());
      true
    }
  }

  /// Comma-joined tag ids as the list endpoint expects them.
  pub fn tag_param(&self) -> Option<String> {
    if self.tags.is_empty() {
      None
    } else {
      Some(self.tags.iter().cloned().collect::<Vec<_>>().join(","))
    }
  }
}
