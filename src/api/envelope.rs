//! Response envelope returned by the spreadsheet API.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// Fallback message when the backend rejects a request without saying why
const DEFAULT_REJECTION: &str = "Server responded with error";

/// `{ "success": bool, "data": any, "error": string? }`
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
  #[serde(default)]
  success: bool,
  #[serde(default)]
  data: Value,
  #[serde(default)]
  error: Option<String>,
}

impl Envelope {
  /// Parse a response body, keeping the start of it if it is not JSON.
  pub(crate) fn parse(body: &str) -> Result<Self> {
    serde_json::from_str(body).map_err(|_| {
      SyncError::InvalidResponse(format!(
        "Invalid JSON response from server: {}",
        SyncError::truncate_body(body)
      ))
    })
  }

  /// The payload of a successful response.
  pub(crate) fn into_data(self) -> Result<Value> {
    if self.success {
      Ok(self.data)
    } else {
      Err(SyncError::Rejected(
        self
          .error
          .filter(|e| !e.is_empty())
          .unwrap_or_else(|| DEFAULT_REJECTION.to_string()),
      ))
    }
  }
}

/// Build a write body: `{"action": ..., ...payload}`.
pub(crate) fn request_body(action: &str, payload: &Value) -> Result<String> {
  let mut body = Map::new();
  body.insert("action".to_string(), Value::String(action.to_string()));

  match payload {
    Value::Null => {}
    Value::Object(fields) => {
      for (key, value) in fields {
        if key != "action" {
          body.insert(key.clone(), value.clone());
        }
      }
    }
    other => {
      return Err(SyncError::InvalidRequest(format!(
        "{} payload must be an object, got {}",
        action, other
      )))
    }
  }

  Ok(serde_json::to_string(&Value::Object(body))?)
}
