//! Cache storage trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::traits::CacheEntry;
use crate::error::{Result, SyncError};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Whether this backend actually persists anything.
  fn is_available(&self) -> bool {
    true
  }

  /// Read the entry stored under `key`, expired or not.
  fn read(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or replace the entry for `entry.key`.
  fn write(&self, entry: &CacheEntry) -> Result<()>;

  /// Delete one entry. Returns whether it existed.
  fn delete(&self, key: &str) -> Result<bool>;

  /// Delete every entry.
  fn delete_all(&self) -> Result<()>;
}

/// Storage used when no persistent store could be opened.
/// Reads miss, writes are discarded.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn is_available(&self) -> bool {
    false
  }

  fn read(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn write(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_all(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    debug!(path = %path.display(), "Cache database ready");
    Ok(storage)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, i64, i64)> = conn
      .query_row(
        "SELECT value, written_at, expires_at FROM cache_entries WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((data, written_at, expires_at)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        value: serde_json::from_slice(&data)?,
        written_at,
        expires_at,
      })),
      None => Ok(None),
    }
  }

  fn write(&self, entry: &CacheEntry) -> Result<()> {
    let data = serde_json::to_vec(&entry.value)?;
    self.lock()?.execute(
      "INSERT OR REPLACE INTO cache_entries (key, value, written_at, expires_at)
       VALUES (?, ?, ?, ?)",
      params![entry.key, data, entry.written_at, entry.expires_at],
    )?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
    Ok(removed > 0)
  }

  fn delete_all(&self) -> Result<()> {
    self.lock()?.execute("DELETE FROM cache_entries", [])?;
    Ok(())
  }
}
