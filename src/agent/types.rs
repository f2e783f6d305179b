//! Requests the agent sees and the responses it answers with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SyncError};

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
  /// Pre-caching the manifest.
  Installing,
  /// Installed, waiting to activate.
  Installed,
  /// Removing caches of other versions.
  Activating,
  /// Controlling clients and intercepting requests.
  Activated,
  /// Replaced by a newer version.
  Redundant,
}

/// An outgoing request from a controlled client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
  pub method: String,
  pub url: Url,
}

impl AgentRequest {
  pub fn new(method: &str, url: &str) -> Result<Self> {
    let url =
      Url::parse(url).map_err(|e| SyncError::InvalidRequest(format!("Bad URL {}: {}", url, e)))?;
    Ok(Self {
      method: method.to_uppercase(),
      url,
    })
  }

  pub fn get(url: &str) -> Result<Self> {
    Self::new("GET", url)
  }

  /// GET and HEAD never change server state and may be answered from cache.
  pub fn is_read_only(&self) -> bool {
    matches!(self.method.as_str(), "GET" | "HEAD")
  }

  /// Key under which the response is cached.
  pub fn cache_key(&self) -> &str {
    self.url.as_str()
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Built by the agent because neither cache nor network could answer.
  Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl FetchResponse {
  pub fn network(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      source: ResponseSource::Network,
    }
  }

  /// Cache-first miss with the network unreachable.
  pub fn timeout() -> Self {
    Self {
      status: 408,
      headers: BTreeMap::new(),
      body: Vec::new(),
      source: ResponseSource::Synthetic,
    }
  }

  /// Stale-while-revalidate miss with the network unreachable.
  pub fn offline() -> Self {
    Self {
      status: 503,
      headers: BTreeMap::new(),
      body: b"Offline".to_vec(),
      source: ResponseSource::Synthetic,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }
}

/// How the agent handled a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
  /// Not intercepted; the client talks to the network itself.
  Passthrough,
  Respond(FetchResponse),
}

impl Interception {
  pub fn response(&self) -> Option<&FetchResponse> {
    match self {
      Interception::Respond(response) => Some(response),
      Interception::Passthrough => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_read_only_methods() {
    assert!(AgentRequest::get("http://localhost/a.js").unwrap().is_read_only());
    assert!(AgentRequest::new("head", "http://localhost/a.js").unwrap().is_read_only());
    assert!(!AgentRequest::new("POST", "http://localhost/a.js").unwrap().is_read_only());
    assert!(!AgentRequest::new("DELETE", "http://localhost/a.js").unwrap().is_read_only());
  }

  #[test]
  fn test_bad_url() {
    assert!(matches!(
      AgentRequest::get("/relative"),
      Err(SyncError::InvalidRequest(_))
    ));
  }

  #[test]
  fn test_synthetic_responses() {
    let offline = FetchResponse::offline();
    assert_eq!(offline.status, 503);
    assert_eq!(offline.body, b"Offline");
    assert_eq!(offline.source, ResponseSource::Synthetic);

    let timeout = FetchResponse::timeout();
    assert_eq!(timeout.status, 408);
    assert!(timeout.body.is_empty());
    assert!(!timeout.is_success());
  }
}
