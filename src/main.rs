use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use yomu::cache::{CacheSource, QueryResult};
use yomu::config::Config;
use yomu::format::{chapter_label, compact_number, time_from_now};
use yomu::manga::{
  CachedMangaClient, ChapterRef, FilterState, MangaSource, MangaSummary, SortField, SortOrder,
};

#[derive(Parser, Debug)]
#[command(name = "yomu")]
#[command(about = "A command-line manga reader with an offline-friendly cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/yomu/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Manga source to query
  #[arg(short, long, value_enum)]
  source: Option<MangaSource>,

  /// Refetch instead of serving cached data
  #[arg(short, long)]
  refresh: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Latest updated manga
  Home,

  /// Search manga by keyword and tags
  Search {
    #[arg(short, long)]
    keyword: Option<String>,
    /// Tag id; repeat to combine tags
    #[arg(short, long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum, default_value_t)]
    sort: SortField,
    #[arg(long, value_enum, default_value_t)]
    order: SortOrder,
    /// Number of result pages to load
    #[arg(short, long, default_value_t = 1)]
    pages: u32,
  },

  /// Manga details and chapter list
  Manga { id: String },

  /// Chapter list of a manga
  Chapters { id: String },

  /// Image URLs of a chapter
  Read { manga_id: String, chapter_id: String },

  /// Available tags
  Tags,

  /// Thumbnail URL of a manga
  Thumbnail { id: String },

  /// Manage the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Remove expired entries
  Purge,
  /// Remove every entry
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = yomu::logging::init()?;

  let config = Config::load(args.config.as_deref())?;
  let source = args.source.unwrap_or(config.default_source);

  let client = CachedMangaClient::new(&config)?;
  let outcome = if args.refresh {
    run(&client.refreshing(), source, args.command).await
  } else {
    run(&client, source, args.command).await
  };

  // Background refetches and prefetches update the on-disk cache
  client.settle().await;
  outcome
}

async fn run(client: &CachedMangaClient, source: MangaSource, command: Command) -> Result<()> {
  match command {
    Command::Home => {
      let list = report(client.home(source).await?, "home list")?;
      println!("Latest updates on {}\n", source.display_name());
      for manga in &list.data {
        print_summary(manga);
      }
    }
    Command::Search {
      keyword,
      tags,
      sort,
      order,
      pages,
    } => {
      let mut filter = FilterState::default().with_keyword(keyword.as_deref());
      filter.sort = sort;
      filter.order = order;
      filter.tags.extend(tags);

      let session = client.search(source, filter)?;
      for _ in 0..pages.max(1) {
        if !session.has_next() {
          break;
        }
        session
          .load_more()
          .await
          .map_err(|e| eyre!("Failed to load search results: {}", e))?;
      }

      let items = session.items();
      println!("Results on {}\n", session.source().display_name());
      if items.is_empty() {
        println!("No results.");
      }
      for manga in &items {
        print_summary(manga);
      }
      if session.has_next() {
        println!(
          "({} pages loaded, more available with --pages {})",
          session.page_count(),
          session.page_count() + 1
        );
      }
    }
    Command::Manga { id } => {
      let (detail, chapters) = tokio::join!(client.detail(source, &id), client.chapters(source, &id));
      let detail = report(detail?, "manga detail")?;
      let chapters = report(chapters?, "chapter list")?;

      println!("{}", detail.title);
      if let Some(alt) = &detail.alt_title {
        println!("  Also known as: {}", alt);
      }
      if !detail.authors.is_empty() {
        let names: Vec<&str> = detail.authors.iter().map(|a| a.name.as_str()).collect();
        println!("  Authors: {}", names.join(", "));
      }
      if let Some(status) = &detail.status {
        println!("  Status: {}", status);
      }
      if let Some(watched) = detail.watched {
        println!("  Views: {}", compact_number(watched));
      }
      if let Some(followed) = detail.followed {
        println!("  Follows: {}", compact_number(followed));
      }
      if !detail.tags.is_empty() {
        let tags: Vec<String> = detail
          .tags
          .iter()
          .map(|t| format!("{} ({})", t.name, t.id))
          .collect();
        println!("  Tags: {}", tags.join(", "));
      }
      if let Some(description) = &detail.description {
        println!("\n{}\n", description.trim());
      }
      print_chapters(&chapters);
    }
    Command::Chapters { id } => {
      let chapters = report(client.chapters(source, &id).await?, "chapter list")?;
      print_chapters(&chapters);
    }
    Command::Read {
      manga_id,
      chapter_id,
    } => {
      let pages = report(
        client.chapter_pages(source, &manga_id, &chapter_id).await?,
        "chapter",
      )?;
      if let Some(current) = &pages.current {
        println!("{}", chapter_label(current.chapter));
      }
      for image in &pages.data {
        if let Some(src) = &image.src {
          println!("{}", src);
        }
      }
      if let Some(next) = pages.next_chapter_id() {
        println!("Next chapter: {}", next);
        client.prefetch_chapter_pages(source, &manga_id, next)?;
      }
    }
    Command::Tags => {
      let tags = report(client.tags(source).await?, "tags")?;
      for tag in &tags.data {
        println!("{:<24} {}", tag.id, tag.name);
      }
    }
    Command::Thumbnail { id } => {
      let thumbnail = report(client.thumbnail(source, &id).await?, "thumbnail")?;
      println!("{}", thumbnail.src);
    }
    Command::Cache { action } => match action {
      CacheAction::Purge => {
        client.evict_expired();
        println!("Expired cache entries removed.");
      }
      CacheAction::Clear => {
        client.clear_cache();
        println!("Cache cleared.");
      }
    },
  }
  Ok(())
}

/// Unwrap a query result, warning when the data is stale because the last
/// refetch failed.
fn report<T>(result: QueryResult<T>, what: &str) -> Result<T> {
  if result.source == CacheSource::Offline {
    if let Some(err) = &result.error {
      eprintln!("warning: showing cached {} ({})", what, err);
    }
  }
  result
    .into_data()
    .map_err(|e| eyre!("Failed to load {}: {}", what, e))
}

fn print_summary(manga: &MangaSummary) {
  println!("{}  [{}]", manga.title, manga.id);
  let now = Utc::now();
  for chapter in manga.chapters.iter().take(3) {
    let when = chapter
      .time
      .map(|t| time_from_now(t, now))
      .unwrap_or_default();
    println!("    {:<16} {}", chapter_label(chapter.chapter), when);
  }
}

fn print_chapters(chapters: &[ChapterRef]) {
  let now = Utc::now();
  for chapter in chapters {
    let watched = chapter.watched.map(compact_number).unwrap_or_default();
    let when = chapter
      .time
      .map(|t| time_from_now(t, now))
      .unwrap_or_default();
    println!(
      "{:<24} {:<16} {:>6}  {}",
      chapter.id,
      chapter_label(chapter.chapter),
      watched,
      when
    );
  }
}
