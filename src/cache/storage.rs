//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Mutex;

use super::key::QueryKey;

/// A persisted payload and the time it was fetched.
#[derive(Debug, Clone)]
pub struct StoredEntry<T> {
  pub data: T,
  pub fetched_at: DateTime<Utc>,
}

/// Trait for persistent cache backends.
///
/// Only successful payloads are persisted; loading and error states live in
/// memory.
pub trait CacheStorage<T>: Send + Sync {
  /// Load the payload stored for a key.
  fn load(&self, key: &QueryKey) -> Result<Option<StoredEntry<T>>>;

  /// Store (or overwrite) the payload for a key.
  fn store(&self, key: &QueryKey, data: &T, fetched_at: DateTime<Utc>) -> Result<()>;

  /// Remove the payload for a key.
  fn remove(&self, key: &QueryKey) -> Result<()>;

  /// Remove every payload fetched before `cutoff`. Returns the number removed.
  fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Remove everything. Returns the number removed.
  fn clear(&self) -> Result<usize>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl<T> CacheStorage<T> for NoopStorage {
  fn load(&self, _key: &QueryKey) -> Result<Option<StoredEntry<T>>> {
    Ok(None) // Always miss
  }

  fn store(&self, _key: &QueryKey, _data: &T, _fetched_at: DateTime<Utc>) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &QueryKey) -> Result<()> {
    Ok(())
  }

  fn purge_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
///
/// Payloads are stored as JSON, addressed by the SHA-256 digest of the key.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Create a new SQLite storage at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Create a storage that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("yomu").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_cache (
    key_hash TEXT PRIMARY KEY,
    key_description TEXT NOT NULL,
    kind TEXT NOT NULL,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_cache_fetched
    ON query_cache(fetched_at);
"#;

impl<T: Serialize + DeserializeOwned> CacheStorage<T> for SqliteStorage {
  fn load(&self, key: &QueryKey) -> Result<Option<StoredEntry<T>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, fetched_at FROM query_cache WHERE key_hash = ?",
        params![key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((data, fetched_at)) => {
        let data: T = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        let fetched_at = parse_datetime(&fetched_at)?;
        Ok(Some(StoredEntry { data, fetched_at }))
      }
      None => Ok(None),
    }
  }

  fn store(&self, key: &QueryKey, data: &T, fetched_at: DateTime<Utc>) -> Result<()> {
    let data = serde_json::to_vec(data).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO query_cache (key_hash, key_description, kind, data, fetched_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key.hash(),
          key.to_string(),
          key.kind(),
          data,
          format_datetime(fetched_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn remove(&self, key: &QueryKey) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM query_cache WHERE key_hash = ?",
        params![key.hash()],
      )
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;

    Ok(())
  }

  fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM query_cache WHERE fetched_at < ?",
        params![format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to purge cache: {}", e))
  }

  fn clear(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM query_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))
  }
}

/// Fixed-width UTC timestamps so that string comparison orders them.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
