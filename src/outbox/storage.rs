//! Queue persistence.
//!
//! The whole queue is one JSON document. Every change rewrites it in a single
//! locked read-modify-write so the add path and the flush path cannot lose
//! each other's updates.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::item::QueueItem;
use crate::error::{Result, SyncError};

/// Trait for queue storage backends.
pub trait QueueStorage: Send + Sync {
  fn is_available(&self) -> bool {
    true
  }

  /// Read the persisted queue in order.
  fn load(&self) -> Result<Vec<QueueItem>>;

  /// Apply `mutate` to the persisted queue as one step and return the list
  /// as written.
  fn update(&self, mutate: &mut dyn FnMut(&mut Vec<QueueItem>)) -> Result<Vec<QueueItem>>;
}

/// Used when no queue file can be written.
pub struct NoopQueueStorage;

impl QueueStorage for NoopQueueStorage {
  fn is_available(&self) -> bool {
    false
  }

  fn load(&self) -> Result<Vec<QueueItem>> {
    Ok(Vec::new())
  }

  fn update(&self, _mutate: &mut dyn FnMut(&mut Vec<QueueItem>)) -> Result<Vec<QueueItem>> {
    Err(SyncError::StorageUnavailable(
      "outbox storage not initialized".to_string(),
    ))
  }
}

/// JSON file storage, replaced atomically on every write.
pub struct FileQueueStorage {
  path: PathBuf,
  lock: Mutex<()>,
}

impl FileQueueStorage {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let storage = Self {
      path: path.to_path_buf(),
      lock: Mutex::new(()),
    };
    // Surface an unreadable file now rather than on the first write
    storage.read_items()?;
    Ok(storage)
  }

  /// Get the default queue path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("outbox.json"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn read_items(&self) -> Result<Vec<QueueItem>> {
    if !self.path.exists() {
      return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(&self.path)?;
    if contents.trim().is_empty() {
      return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&contents)?)
  }

  fn write_items(&self, items: &[QueueItem]) -> Result<()> {
    let tmp = self.path.with_extension("json.tmp");
    let contents = serde_json::to_string_pretty(items)?;
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, &self.path)?;
    debug!(pending = items.len(), "Outbox persisted");
    Ok(())
  }
}

impl QueueStorage for FileQueueStorage {
  fn load(&self) -> Result<Vec<QueueItem>> {
    let _guard = self
      .lock
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))?;
    self.read_items()
  }

  fn update(&self, mutate: &mut dyn FnMut(&mut Vec<QueueItem>)) -> Result<Vec<QueueItem>> {
    let _guard = self
      .lock
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))?;
    let mut items = self.read_items()?;
    mutate(&mut items);
    self.write_items(&items)?;
    Ok(items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::outbox::{QueueMetadata, RequestDescriptor};

  fn item(action: &str) -> QueueItem {
    QueueItem::new(
      "https://api.example/",
      RequestDescriptor::new("POST"),
      QueueMetadata::action(action),
    )
  }

  #[test]
  fn test_missing_file_is_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileQueueStorage::open(&dir.path().join("outbox.json")).unwrap();
    assert!(storage.load().unwrap().is_empty());
  }

  #[test]
  fn test_update_persists_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.json");
    let storage = FileQueueStorage::open(&path).unwrap();

    let first = item("createExam");
    let second = item("submitExam");
    storage.update(&mut |q| q.push(first.clone())).unwrap();
    let written = storage.update(&mut |q| q.push(second.clone())).unwrap();
    assert_eq!(written.len(), 2);

    let reopened = FileQueueStorage::open(&path).unwrap();
    let actions: Vec<String> = reopened
      .load()
      .unwrap()
      .into_iter()
      .map(|i| i.metadata.action)
      .collect();
    assert_eq!(actions, vec!["createExam", "submitExam"]);
    assert!(!path.with_extension("json.tmp").exists());
  }

  #[test]
  fn test_corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.json");
    std::fs::write(&path, "{not json").unwrap();

    assert!(matches!(
      FileQueueStorage::open(&path),
      Err(SyncError::Json(_))
    ));
  }

  #[test]
  fn test_noop_storage_rejects_writes() {
    let storage = NoopQueueStorage;
    assert!(!storage.is_available());
    assert!(storage.load().unwrap().is_empty());
    assert!(matches!(
      storage.update(&mut |q| q.push(item("addFile"))),
      Err(SyncError::StorageUnavailable(_))
    ));
  }
}
