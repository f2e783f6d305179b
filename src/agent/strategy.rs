//! Per-host caching strategies.

use tracing::trace;

use super::types::AgentRequest;
use crate::config::AgentConfig;

/// How a read-only request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Never intercepted.
  Passthrough,
  /// Cached copy if present, otherwise fetch and store.
  CacheFirst,
  /// Cached copy now, refreshed in the background.
  StaleWhileRevalidate,
}

/// Host rules, checked passthrough first; anything unmatched falls back to
/// the default strategy.
#[derive(Debug, Clone)]
pub struct StrategyTable {
  passthrough_hosts: Vec<String>,
  cache_first_hosts: Vec<String>,
  fallback: Strategy,
}

impl StrategyTable {
  pub fn new(passthrough_hosts: Vec<String>, cache_first_hosts: Vec<String>) -> Self {
    Self {
      passthrough_hosts: normalize(passthrough_hosts),
      cache_first_hosts: normalize(cache_first_hosts),
      fallback: Strategy::StaleWhileRevalidate,
    }
  }

  pub fn from_config(config: &AgentConfig) -> Self {
    Self::new(
      config.passthrough_hosts.clone(),
      config.cache_first_hosts.clone(),
    )
  }

  /// Strategy for `request`. Mutating requests are always passed through.
  pub fn classify(&self, request: &AgentRequest) -> Strategy {
    if !request.is_read_only() {
      return Strategy::Passthrough;
    }

    let host = request
      .url
      .host_str()
      .map(|h| h.to_ascii_lowercase())
      .unwrap_or_default();

    let strategy = if self.passthrough_hosts.contains(&host) {
      Strategy::Passthrough
    } else if self.cache_first_hosts.contains(&host) {
      Strategy::CacheFirst
    } else {
      self.fallback
    };
    trace!(url = %request.url, ?strategy, "Classified request");
    strategy
  }
}

impl Default for StrategyTable {
  fn default() -> Self {
    Self::from_config(&AgentConfig::default())
  }
}

fn normalize(hosts: Vec<String>) -> Vec<String> {
  hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classify(method: &str, url: &str) -> Strategy {
    StrategyTable::default().classify(&AgentRequest::new(method, url).unwrap())
  }

  #[test]
  fn test_data_api_is_passthrough() {
    assert_eq!(
      classify("GET", "https://script.google.com/macros/s/x/exec?action=getFiles"),
      Strategy::Passthrough
    );
    assert_eq!(
      classify("GET", "https://script.googleusercontent.com/macros/echo?x=1"),
      Strategy::Passthrough
    );
  }

  #[test]
  fn test_fonts_are_cache_first() {
    assert_eq!(
      classify("GET", "https://fonts.googleapis.com/css2?family=Inter"),
      Strategy::CacheFirst
    );
    assert_eq!(
      classify("GET", "https://FONTS.GSTATIC.COM/s/inter/v1.woff2"),
      Strategy::CacheFirst
    );
  }

  #[test]
  fn test_everything_else_is_stale_while_revalidate() {
    assert_eq!(
      classify("GET", "http://localhost:8080/js/api.js"),
      Strategy::StaleWhileRevalidate
    );
    assert_eq!(
      classify("HEAD", "http://localhost:8080/"),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_mutating_requests_pass_through() {
    assert_eq!(
      classify("POST", "http://localhost:8080/js/api.js"),
      Strategy::Passthrough
    );
    assert_eq!(
      classify("PUT", "https://fonts.gstatic.com/x"),
      Strategy::Passthrough
    );
  }
}
