//! Named, versioned request/response caches backed by SQLite.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::types::{FetchResponse, ResponseSource};
use crate::cache::epoch_millis;
use crate::error::{Result, SyncError};

/// All resource caches in one database.
pub struct ResourceCaches {
  conn: Mutex<Connection>,
}

impl ResourceCaches {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let caches = Self {
      conn: Mutex::new(Connection::open(path)?),
    };
    caches.run_migrations()?;

    debug!(path = %path.display(), "Resource cache database ready");
    Ok(caches)
  }

  pub fn open_in_memory() -> Result<Self> {
    let caches = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    caches.run_migrations()?;
    Ok(caches)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("agent.db"))
  }

  /// Create the named cache if it does not exist.
  pub fn open_cache(&self, name: &str) -> Result<()> {
    self.lock()?.execute(
      "INSERT OR IGNORE INTO resource_caches (name, created_at) VALUES (?, ?)",
      params![name, epoch_millis()],
    )?;
    Ok(())
  }

  pub fn has(&self, name: &str) -> Result<bool> {
    let found: Option<i64> = self
      .lock()?
      .query_row(
        "SELECT 1 FROM resource_caches WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  /// Cache names, oldest first.
  pub fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM resource_caches ORDER BY created_at, name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
  }

  /// Delete a cache and everything in it. Returns whether it existed.
  pub fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM resource_entries WHERE cache_name = ?",
      params![name],
    )?;
    let removed = tx.execute("DELETE FROM resource_caches WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  /// Store a response under `url`, creating the cache if needed.
  pub fn put(&self, name: &str, url: &str, response: &FetchResponse) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)?;
    let now = epoch_millis();

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO resource_caches (name, created_at) VALUES (?, ?)",
      params![name, now],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO resource_entries (cache_name, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![name, url, response.status, headers, response.body, now],
    )?;
    tx.commit()?;
    Ok(())
  }

  /// Look up the cached response for `url`.
  pub fn match_request(&self, name: &str, url: &str) -> Result<Option<FetchResponse>> {
    let row: Option<(u16, String, Vec<u8>)> = self
      .lock()?
      .query_row(
        "SELECT status, headers, body FROM resource_entries WHERE cache_name = ? AND url = ?",
        params![name, url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
        Ok(Some(FetchResponse {
          status,
          headers,
          body,
          source: ResponseSource::Cache,
        }))
      }
      None => Ok(None),
    }
  }

  /// URLs stored in the named cache.
  pub fn urls(&self, name: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT url FROM resource_entries WHERE cache_name = ? ORDER BY url")?;
    let urls = stmt
      .query_map(params![name], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(urls)
  }

  fn run_migrations(&self) -> Result<()> {
    self.lock()?.execute_batch(RESOURCE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

const RESOURCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resource_caches (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS resource_entries (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (cache_name, url)
);
"#;
