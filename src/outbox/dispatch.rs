//! Delivery of queued requests.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method};
use tracing::debug;

use super::item::QueueItem;
use crate::error::{Result, SyncError};

/// Sends one queued request and reports the HTTP status it got back.
///
/// Transport failures (timeout, refused connection) are errors; any response
/// at all, including a server error, is `Ok(status)`.
pub trait Dispatcher: Send + Sync + 'static {
  fn dispatch<'a>(&'a self, item: &'a QueueItem) -> BoxFuture<'a, Result<u16>>;
}

/// Statuses below 500 mean the backend processed the request.
pub fn is_delivered(status: u16) -> bool {
  status < 500
}

/// Dispatcher that replays the stored request over HTTP.
#[derive(Clone)]
pub struct HttpDispatcher {
  client: Client,
  timeout: Duration,
}

impl HttpDispatcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::Network(e.to_string()))?;
    Ok(Self::with_client(client, timeout))
  }

  /// Share an existing connection pool.
  pub fn with_client(client: Client, timeout: Duration) -> Self {
    Self { client, timeout }
  }
}

impl Dispatcher for HttpDispatcher {
  fn dispatch<'a>(&'a self, item: &'a QueueItem) -> BoxFuture<'a, Result<u16>> {
    Box::pin(async move {
      let descriptor = &item.request_descriptor;
      let method = Method::from_bytes(descriptor.method.as_bytes())
        .map_err(|e| SyncError::InvalidRequest(format!("Bad method {}: {}", descriptor.method, e)))?;

      let mut request = self
        .client
        .request(method, &item.target_url)
        .timeout(self.timeout);
      for (name, value) in &descriptor.headers {
        request = request.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &descriptor.body {
        request = request.body(body.clone());
      }

      let response = request
        .send()
        .await
        .map_err(|e| SyncError::from_reqwest(e, self.timeout))?;

      let status = response.status().as_u16();
      debug!(id = %item.id, status, "Outbox dispatch answered");
      Ok(status)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::outbox::{QueueMetadata, RequestDescriptor};
  use wiremock::matchers::{body_string, header, method};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[test]
  fn test_delivery_threshold() {
    assert!(is_delivered(200));
    assert!(is_delivered(400));
    assert!(is_delivered(499));
    assert!(!is_delivered(500));
    assert!(!is_delivered(503));
  }

  #[tokio::test]
  async fn test_http_dispatch_replays_descriptor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(header("Content-Type", "text/plain;charset=utf-8"))
      .and(body_string(r#"{"action":"createExam"}"#))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;

    let item = QueueItem::new(
      &server.uri(),
      RequestDescriptor::post(r#"{"action":"createExam"}"#)
        .with_header("Content-Type", "text/plain;charset=utf-8"),
      QueueMetadata::action("createExam"),
    );

    let dispatcher = HttpDispatcher::new(Duration::from_secs(5)).unwrap();
    assert_eq!(dispatcher.dispatch(&item).await.unwrap(), 200);
  }

  #[tokio::test]
  async fn test_http_dispatch_reports_server_errors_as_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let item = QueueItem::new(&server.uri(), RequestDescriptor::new("POST"), QueueMetadata::default());
    let dispatcher = HttpDispatcher::new(Duration::from_secs(5)).unwrap();
    assert_eq!(dispatcher.dispatch(&item).await.unwrap(), 503);
  }

  #[tokio::test]
  async fn test_http_dispatch_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
      .mount(&server)
      .await;

    let item = QueueItem::new(&server.uri(), RequestDescriptor::new("POST"), QueueMetadata::default());
    let dispatcher = HttpDispatcher::new(Duration::from_millis(100)).unwrap();
    assert!(matches!(
      dispatcher.dispatch(&item).await,
      Err(SyncError::Timeout(_))
    ));
  }

  #[tokio::test]
  async fn test_http_dispatch_rejects_malformed_method() {
    let item = QueueItem::new(
      "http://127.0.0.1:9/",
      RequestDescriptor::new("BAD METHOD"),
      QueueMetadata::action("createExam"),
    );
    let dispatcher = HttpDispatcher::new(Duration::from_secs(5)).unwrap();
    let err = dispatcher.dispatch(&item).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidRequest(_)));
    assert!(!err.is_transient());
  }
}
