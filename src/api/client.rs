use std::time::Duration;

use reqwest::{header, Client, Response};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::envelope::{request_body, Envelope};
use crate::config::ApiConfig;
use crate::connectivity::Connectivity;
use crate::error::{Result, SyncError};
use crate::outbox::{Outbox, QueueMetadata, RequestDescriptor};

/// Content type the backend accepts for writes without a CORS preflight
pub const WRITE_CONTENT_TYPE: &str = "text/plain;charset=utf-8";

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOutcome {
  /// The backend processed the write; carries the envelope's `data`.
  Delivered(Value),
  /// The write could not be sent and is waiting in the outbox.
  Queued { pending: usize },
}

impl PostOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, PostOutcome::Queued { .. })
  }
}

/// Build the shared HTTP client.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
  Client::builder()
    .timeout(timeout)
    .build()
    .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Client for the spreadsheet API.
///
/// Reads are `GET ?action=...`; writes are `POST {action, ...payload}` and
/// fall back to the outbox when the backend cannot be reached.
/// Clone is cheap: the connection pool and outbox are shared.
#[derive(Clone)]
pub struct ApiClient {
  client: Client,
  base_url: Url,
  timeout: Duration,
  connectivity: Connectivity,
  outbox: Outbox,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, connectivity: Connectivity, outbox: Outbox) -> Result<Self> {
    let timeout = config.timeout();
    Self::with_client(
      build_http_client(timeout)?,
      &config.url,
      timeout,
      connectivity,
      outbox,
    )
  }

  /// Create a client over an existing connection pool.
  pub fn with_client(
    client: Client,
    base_url: &str,
    timeout: Duration,
    connectivity: Connectivity,
    outbox: Outbox,
  ) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("Invalid API URL {}: {}", base_url, e)))?;

    Ok(Self {
      client,
      base_url,
      timeout,
      connectivity,
      outbox,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  pub fn outbox(&self) -> &Outbox {
    &self.outbox
  }

  /// Read `action` and return the envelope's `data`.
  ///
  /// Fails with `Network` without a request while offline, so cached reads
  /// keep their cached value.
  pub async fn get(&self, action: &str, params: &[(&str, &str)]) -> Result<Value> {
    if !self.connectivity.is_online() {
      debug!(action, "Offline, skipping API GET");
      return Err(SyncError::Network("offline".into()));
    }

    let mut url = self.base_url.clone();
    url
      .query_pairs_mut()
      .append_pair("action", action)
      .extend_pairs(params);

    debug!(action, "API GET");

    let response = self
      .client
      .get(url)
      .timeout(self.timeout)
      .send()
      .await
      .map_err(|e| {
        let err = SyncError::from_reqwest(e, self.timeout);
        warn!(action, error = %err, "API GET failed");
        err
      })?;

    let body = Self::read_body(response).await?;
    Envelope::parse(&body)?.into_data()
  }

  /// Write `action` with `payload` merged into the request body.
  ///
  /// While offline, or when the attempt fails in a way the backend may later
  /// accept, the request is handed to the outbox and `Queued` is returned. A
  /// rejection is returned as an error and never queued. If the outbox cannot
  /// take the request either, the original failure is returned.
  pub async fn post(&self, action: &str, payload: &Value) -> Result<PostOutcome> {
    let body = request_body(action, payload)?;
    let descriptor =
      RequestDescriptor::post(body.clone()).with_header(header::CONTENT_TYPE.as_str(), WRITE_CONTENT_TYPE);

    if !self.connectivity.is_online() {
      return self.defer(action, descriptor, SyncError::Network("offline".to_string()));
    }

    debug!(action, "API POST");

    let sent = self
      .client
      .post(self.base_url.clone())
      .timeout(self.timeout)
      .header(header::CONTENT_TYPE, WRITE_CONTENT_TYPE)
      .body(body)
      .send()
      .await;

    let result = match sent {
      Ok(response) => Self::read_body(response).await,
      Err(e) => Err(SyncError::from_reqwest(e, self.timeout)),
    };

    match result {
      Ok(text) => Envelope::parse(&text)?.into_data().map(PostOutcome::Delivered),
      Err(err) if err.is_transient() => self.defer(action, descriptor, err),
      Err(err) => Err(err),
    }
  }

  fn defer(&self, action: &str, descriptor: RequestDescriptor, cause: SyncError) -> Result<PostOutcome> {
    match self
      .outbox
      .add(self.base_url.as_str(), descriptor, QueueMetadata::action(action))
    {
      Ok(pending) => {
        info!(action, reason = %cause, pending, "Write deferred to outbox");
        Ok(PostOutcome::Queued { pending })
      }
      Err(e) => {
        warn!(action, error = %e, "Outbox rejected write");
        Err(cause)
      }
    }
  }

  /// Read the body, turning server errors into [`SyncError::Server`].
  async fn read_body(response: Response) -> Result<String> {
    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| SyncError::Network(format!("Failed to read response body: {}", e)))?;

    if status.is_server_error() {
      return Err(SyncError::Server {
        status: status.as_u16(),
        body: SyncError::truncate_body(&body),
      });
    }
    Ok(body)
  }
}
