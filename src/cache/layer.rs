//! Cache store with TTL expiry and stale-while-revalidate fetching.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::{CacheStorage, NoopStorage, SqliteStorage};
use super::traits::{epoch_millis, CacheEntry, CacheResult, FetchOptions};
use crate::error::{Result, SyncError};

/// Key-value store with per-entry expiry, used to memoize reads.
///
/// Every operation is infallible from the caller's point of view: when the
/// backing store is missing the handle is degraded and reads miss, writes
/// report `false` and `fetch_with_cache` calls the producer directly.
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
}

impl CacheStore {
  /// Create a store over the given backend.
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Open the persistent store at `path` (or the default location).
  ///
  /// Falls back to a degraded handle if the database cannot be opened.
  pub fn init(path: Option<&Path>) -> Self {
    let path = match path {
      Some(p) => Ok(p.to_path_buf()),
      None => SqliteStorage::default_path(),
    };

    match path.and_then(|p| SqliteStorage::open(&p)) {
      Ok(storage) => Self::new(storage),
      Err(e) => {
        warn!(error = %e, "Cache store unavailable, reads will bypass the cache");
        Self::degraded()
      }
    }
  }

  /// A handle with no backing store.
  pub fn degraded() -> Self {
    Self::new(NoopStorage)
  }

  pub fn is_available(&self) -> bool {
    self.storage.is_available()
  }

  /// Look up a live entry, evicting it first if it has expired.
  pub fn try_get(&self, key: &str) -> Result<Option<CacheEntry>> {
    if !self.is_available() {
      return Err(SyncError::StorageUnavailable(
        "cache store not initialized".to_string(),
      ));
    }

    match self.storage.read(key)? {
      Some(entry) if entry.is_expired(epoch_millis()) => {
        debug!(key, "Cache entry expired");
        self.storage.delete(key)?;
        Ok(None)
      }
      other => Ok(other),
    }
  }

  /// Get the value stored under `key` if it has not expired.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.lookup(key)?;
    self.decode(entry)
  }

  /// Store `value` under `key` for `ttl`, replacing any previous entry.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
    match serde_json::to_value(value) {
      Ok(value) => self.write_value(key, value, ttl),
      Err(e) => {
        warn!(key, error = %e, "Failed to serialize cache value");
        false
      }
    }
  }

  pub fn remove(&self, key: &str) -> bool {
    if !self.is_available() {
      return false;
    }
    match self.storage.delete(key) {
      Ok(_) => true,
      Err(e) => {
        warn!(key, error = %e, "Failed to remove cache entry");
        false
      }
    }
  }

  pub fn clear(&self) -> bool {
    if !self.is_available() {
      return false;
    }
    match self.storage.delete_all() {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Failed to clear cache");
        false
      }
    }
  }

  /// Fetch with stale-while-revalidate semantics.
  ///
  /// 1. Store unavailable: call `producer` directly, nothing is cached
  /// 2. Hit: return the cached value now and refresh it in a spawned task;
  ///    `on_update` fires if the refreshed value differs
  /// 3. Miss: await `producer`, store its result; errors propagate
  ///
  /// Concurrent calls for the same key each run their own producer.
  pub async fn fetch_with_cache<T, F, Fut>(
    &self,
    key: &str,
    producer: F,
    options: FetchOptions<T>,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if !self.is_available() {
      debug!(key, "Cache unavailable, fetching directly");
      let data = producer().await?;
      return Ok(CacheResult::from_network(data));
    }

    if let Some(entry) = self.lookup(key) {
      let cached_at = entry.written_at_utc();
      let snapshot = entry.value.clone();
      if let Some(data) = self.decode::<T>(entry) {
        debug!(key, "Cache hit");
        let refresh = self.spawn_revalidation(key, snapshot, producer, options);
        return Ok(CacheResult::from_cache(data, cached_at, Some(refresh)));
      }
    }

    debug!(key, "Cache miss");
    let data = producer().await?;
    self.set(key, &data, options.ttl);
    Ok(CacheResult::from_network(data))
  }

  /// Refresh `key` in the background. Failures are logged and dropped.
  fn spawn_revalidation<T, F, Fut>(
    &self,
    key: &str,
    cached: Value,
    producer: F,
    options: FetchOptions<T>,
  ) -> JoinHandle<()>
  where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let store = self.clone();
    let key = key.to_string();

    tokio::spawn(async move {
      let fresh = match producer().await {
        Ok(fresh) => fresh,
        Err(e) => {
          debug!(key = %key, error = %e, "Background refresh failed");
          return;
        }
      };

      let fresh_value = match serde_json::to_value(&fresh) {
        Ok(value) => value,
        Err(e) => {
          warn!(key = %key, error = %e, "Failed to serialize refreshed value");
          return;
        }
      };

      let changed = fresh_value != cached;
      store.write_value(&key, fresh_value, options.ttl);

      if changed {
        debug!(key = %key, "Cache updated with changed data");
        if let Some(on_update) = options.on_update {
          on_update(fresh);
        }
      }
    })
  }

  fn lookup(&self, key: &str) -> Option<CacheEntry> {
    if !self.is_available() {
      return None;
    }
    match self.try_get(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "Cache read failed");
        None
      }
    }
  }

  fn decode<T: DeserializeOwned>(&self, entry: CacheEntry) -> Option<T> {
    match serde_json::from_value(entry.value) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key = %entry.key, error = %e, "Dropping undecodable cache entry");
        self.remove(&entry.key);
        None
      }
    }
  }

  fn write_value(&self, key: &str, value: Value, ttl: Duration) -> bool {
    if !self.is_available() {
      return false;
    }
    let entry = CacheEntry::new(key, value, epoch_millis(), ttl);
    match self.storage.write(&entry) {
      Ok(()) => true,
      Err(e) => {
        warn!(key, error = %e, "Cache write failed");
        false
      }
    }
  }
}

impl Clone for CacheStore {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
