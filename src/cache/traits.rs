//! Core types for the caching system.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

/// Default time-to-live for cached reads: 5 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
  Utc::now().timestamp_millis()
}

/// A stored value paired with its expiry time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  /// Epoch milliseconds
  pub written_at: i64,
  /// Epoch milliseconds, always greater than `written_at`
  pub expires_at: i64,
}

impl CacheEntry {
  /// Create an entry written at `now` that lives for `ttl`.
  ///
  /// A zero TTL is clamped to one millisecond.
  pub fn new(key: &str, value: Value, now: i64, ttl: Duration) -> Self {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
    Self {
      key: key.to_string(),
      value,
      written_at: now,
      expires_at: now.saturating_add(ttl_ms),
    }
  }

  pub fn is_expired(&self, now: i64) -> bool {
    now > self.expires_at
  }

  pub fn written_at_utc(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.written_at).single()
  }
}

/// Where a fetched value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Produced by a network call during this fetch
  Network,
  /// Served from the local store; a background refresh may be running
  Cache,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
    }
  }
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Result from a cache fetch, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background revalidation started for a cache hit
  pub refresh: Option<JoinHandle<()>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      refresh: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(
    data: T,
    cached_at: Option<DateTime<Utc>>,
    refresh: Option<JoinHandle<()>>,
  ) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at,
      refresh,
    }
  }
}

/// Callback invoked once when a background refresh yields a different value.
pub type UpdateCallback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Options for [`CacheStore::fetch_with_cache`](super::CacheStore::fetch_with_cache).
pub struct FetchOptions<T> {
  pub ttl: Duration,
  pub on_update: Option<UpdateCallback<T>>,
}

impl<T> FetchOptions<T> {
  pub fn with_ttl(ttl: Duration) -> Self {
    Self {
      ttl,
      on_update: None,
    }
  }

  pub fn on_update(mut self, callback: impl FnOnce(T) + Send + 'static) -> Self {
    self.on_update = Some(Box::new(callback));
    self
  }
}

impl<T> Default for FetchOptions<T> {
  fn default() -> Self {
    Self::with_ttl(DEFAULT_TTL)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_entry_expiry_boundary() {
    let entry = CacheEntry::new("k", json!(1), 1_000, Duration::from_millis(500));
    assert_eq!(entry.expires_at, 1_500);
    assert!(!entry.is_expired(1_500));
    assert!(entry.is_expired(1_501));
  }

  #[test]
  fn test_zero_ttl_is_clamped() {
    let entry = CacheEntry::new("k", json!(1), 1_000, Duration::ZERO);
    assert!(entry.expires_at > entry.written_at);
  }

  #[test]
  fn test_record_layout_uses_camel_case() {
    let entry = CacheEntry::new("api_files", json!([1]), 10, Duration::from_millis(5));
    let value = serde_json::to_value(&entry).unwrap();
    assert_eq!(value["writtenAt"], 10);
    assert_eq!(value["expiresAt"], 15);
  }

  #[test]
  fn test_source_labels() {
    assert_eq!(CacheSource::Network.to_string(), "network");
    assert_eq!(CacheSource::Cache.as_str(), "cache");
  }
}
