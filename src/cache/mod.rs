//! Persistent read cache for API data.
//!
//! This module provides a TTL-bounded key-value store that:
//! - Persists JSON values in SQLite so reads survive restarts
//! - Evicts expired entries lazily on read
//! - Serves cached values immediately while refreshing them in the background
//! - Degrades to a pass-through when no persistent store is available

mod layer;
mod storage;
mod traits;

pub use layer::CacheStore;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{
  epoch_millis, CacheEntry, CacheResult, CacheSource, FetchOptions, UpdateCallback, DEFAULT_TTL,
};
