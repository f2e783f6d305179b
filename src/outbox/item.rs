//! Queue records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::epoch_millis;

/// Method, headers and body of a deferred request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
  pub method: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<String>,
}

impl RequestDescriptor {
  pub fn new(method: &str) -> Self {
    Self {
      method: method.to_uppercase(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn post(body: impl Into<String>) -> Self {
    Self {
      body: Some(body.into()),
      ..Self::new("POST")
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_string(), value.to_string());
    self
  }
}

/// Caller-supplied description of the operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetadata {
  #[serde(default)]
  pub action: String,
}

impl QueueMetadata {
  pub fn action(action: impl Into<String>) -> Self {
    Self {
      action: action.into(),
    }
  }
}

/// A write operation waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
  pub id: String,
  pub target_url: String,
  pub request_descriptor: RequestDescriptor,
  pub metadata: QueueMetadata,
  pub retry_count: u32,
  /// Epoch milliseconds
  pub created_at: i64,
}

impl QueueItem {
  pub fn new(target_url: &str, request_descriptor: RequestDescriptor, metadata: QueueMetadata) -> Self {
    let created_at = epoch_millis();
    Self {
      id: generate_id(created_at, target_url),
      target_url: target_url.to_string(),
      request_descriptor,
      metadata,
      retry_count: 0,
      created_at,
    }
  }

  /// Human-readable name for logs: the action, or the URL when none was given.
  pub fn label(&self) -> &str {
    if self.metadata.action.is_empty() {
      &self.target_url
    } else {
      &self.metadata.action
    }
  }
}

/// `<created_at>_<8 hex chars>`, unique within and across processes.
fn generate_id(created_at: i64, target_url: &str) -> String {
  static COUNTER: AtomicU64 = AtomicU64::new(0);

  let nanos = chrono::Utc::now().timestamp_subsec_nanos();
  let seq = COUNTER.fetch_add(1, Ordering::Relaxed);

  let mut hasher = Sha256::new();
  hasher.update(created_at.to_be_bytes());
  hasher.update(nanos.to_be_bytes());
  hasher.update(seq.to_be_bytes());
  hasher.update(std::process::id().to_be_bytes());
  hasher.update(target_url.as_bytes());
  let digest = hex::encode(hasher.finalize());

  format!("{}_{}", created_at, &digest[..8])
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_new_item_starts_with_zero_retries() {
    let item = QueueItem::new(
      "https://api.example/",
      RequestDescriptor::new("post"),
      QueueMetadata::action("createExam"),
    );
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.request_descriptor.method, "POST");
    assert_eq!(item.label(), "createExam");
    assert!(item.id.starts_with(&format!("{}_", item.created_at)));
  }

  #[test]
  fn test_ids_are_unique() {
    let ids: HashSet<String> = (0..200)
      .map(|_| {
        QueueItem::new("https://api.example/", RequestDescriptor::new("POST"), QueueMetadata::default()).id
      })
      .collect();
    assert_eq!(ids.len(), 200);
  }

  #[test]
  fn test_label_falls_back_to_url() {
    let item = QueueItem::new("https://api.example/", RequestDescriptor::new("POST"), QueueMetadata::default());
    assert_eq!(item.label(), "https://api.example/");
  }

  #[test]
  fn test_record_layout() {
    let item = QueueItem::new(
      "https://api.example/",
      RequestDescriptor::post("{}").with_header("Content-Type", "text/plain"),
      QueueMetadata::action("submitExam"),
    );
    let value = serde_json::to_value(&item).unwrap();

    assert_eq!(value["targetUrl"], "https://api.example/");
    assert_eq!(value["requestDescriptor"]["method"], "POST");
    assert_eq!(value["requestDescriptor"]["headers"]["Content-Type"], "text/plain");
    assert_eq!(value["metadata"]["action"], "submitExam");
    assert_eq!(value["retryCount"], 0);
    assert!(value["createdAt"].is_i64());
  }
}
