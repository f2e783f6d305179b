//! Error types shared by the cache, outbox, API client and network agent.

use std::time::Duration;

use thiserror::Error;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Error, Debug)]
pub enum SyncError {
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Connection failed: {0}")]
  Network(String),

  #[error("Server error {status}: {body}")]
  Server { status: u16, body: String },

  #[error("Server rejected request: {0}")]
  Rejected(String),

  #[error("Storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("Invalid response: {0}")]
  InvalidResponse(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  #[error("Invalid state: {0}")]
  InvalidState(String),

  #[error("Configuration error: {0}")]
  Config(String),

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
  /// Map a transport failure, keeping timeouts distinguishable.
  pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
    if err.is_timeout() {
      SyncError::Timeout(timeout)
    } else {
      SyncError::Network(err.to_string())
    }
  }

  /// Errors worth retrying later: the backend may accept the same request.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      SyncError::Timeout(_) | SyncError::Network(_) | SyncError::Server { .. }
    )
  }

  pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
      end -= 1;
    }
    format!("{}... ({} bytes)", &body[..end], body.len())
  }
}
