//! Page-side context: owns the cache store, outbox and connectivity monitor.

use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{build_http_client, ApiClient};
use crate::cache::CacheStore;
use crate::config::Config;
use crate::connectivity::{Connectivity, NetworkStatus};
use crate::error::Result;
use crate::outbox::{HttpDispatcher, Outbox, OutboxSettings};
use crate::portal::PortalClient;

/// Everything the UI side needs, built from one [`Config`].
///
/// Storage that cannot be opened leaves the matching handle degraded rather
/// than failing construction.
pub struct SyncContext {
  connectivity: Connectivity,
  cache: CacheStore,
  outbox: Outbox,
  portal: PortalClient,
  tasks: Vec<JoinHandle<()>>,
}

impl SyncContext {
  pub fn open(config: &Config, initial: NetworkStatus) -> Result<Self> {
    let timeout = config.api.timeout();
    let client = build_http_client(timeout)?;
    let connectivity = Connectivity::new(initial);

    let cache = CacheStore::init(config.cache.path.as_deref());
    let outbox = Outbox::init(
      config.outbox.path.as_deref(),
      HttpDispatcher::with_client(client.clone(), timeout),
      connectivity.clone(),
      OutboxSettings::from(&config.outbox),
    );
    let api = ApiClient::with_client(
      client,
      &config.api.url,
      timeout,
      connectivity.clone(),
      outbox.clone(),
    )?;

    info!(
      cache = cache.is_available(),
      outbox = outbox.is_available(),
      ?initial,
      "Sync context opened"
    );

    Ok(Self {
      portal: PortalClient::new(api, cache.clone()),
      connectivity,
      cache,
      outbox,
      tasks: Vec::new(),
    })
  }

  /// Start the background work: flush on reconnect and the deferred start-up
  /// flush. Calling it again is a no-op.
  pub fn start(&mut self) {
    if !self.tasks.is_empty() {
      return;
    }
    self.tasks.push(self.outbox.watch_connectivity());
    self.tasks.push(self.outbox.schedule_bootstrap());
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  pub fn outbox(&self) -> &Outbox {
    &self.outbox
  }

  pub fn portal(&self) -> &PortalClient {
    &self.portal
  }
}

impl Drop for SyncContext {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{ApiConfig, CacheConfig, OutboxConfig};
  use crate::outbox::OutboxEvent;
  use serde_json::json;
  use std::time::Duration;
  use wiremock::matchers::method;
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn config(url: &str, dir: &tempfile::TempDir) -> Config {
    Config {
      api: ApiConfig {
        url: url.to_string(),
        timeout_secs: 5,
      },
      cache: CacheConfig {
        path: Some(dir.path().join("cache.db")),
      },
      outbox: OutboxConfig {
        path: Some(dir.path().join("outbox.json")),
        bootstrap_delay_ms: 10,
        reconnect_delay_ms: 10,
        base_delay_ms: 10,
        ..OutboxConfig::default()
      },
      agent: Default::default(),
      log: Default::default(),
    }
  }

  #[tokio::test]
  async fn test_open_with_stores() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = SyncContext::open(&config("https://api.example/exec", &dir), NetworkStatus::Online).unwrap();
    assert!(ctx.cache().is_available());
    assert!(ctx.outbox().is_available());
    assert!(ctx.connectivity().is_online());
  }

  #[tokio::test]
  async fn test_unusable_paths_degrade() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("https://api.example/exec", &dir);
    config.cache.path = Some(dir.path().to_path_buf());
    config.outbox.path = Some(dir.path().to_path_buf());

    let ctx = SyncContext::open(&config, NetworkStatus::Online).unwrap();
    assert!(!ctx.cache().is_available());
    assert!(!ctx.outbox().is_available());
  }

  #[tokio::test]
  async fn test_offline_write_delivered_after_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
      .expect(1)
      .mount(&server)
      .await;

    let dir = tempfile::tempdir().unwrap();
    let mut ctx = SyncContext::open(&config(&server.uri(), &dir), NetworkStatus::Offline).unwrap();
    ctx.start();
    let mut events = ctx.outbox().subscribe();

    let outcome = ctx
      .portal()
      .create_exam(&json!({"title": "Quiz 1"}))
      .await
      .unwrap();
    assert!(outcome.is_queued());

    ctx.connectivity().set_online();
    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
      loop {
        if let Ok(OutboxEvent::Delivered { action, .. }) = events.recv().await {
          return action;
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(delivered, "createExam");
    assert!(ctx.outbox().get_pending().unwrap().is_empty());
  }
}
