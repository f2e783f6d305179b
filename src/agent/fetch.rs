//! Network access for the agent.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method};

use super::types::{AgentRequest, FetchResponse};
use crate::error::{Result, SyncError};

/// Performs a request on the network. Any HTTP response is `Ok`; only
/// transport failures are errors.
pub trait ResourceFetcher: Send + Sync + 'static {
  fn fetch<'a>(&'a self, request: &'a AgentRequest) -> BoxFuture<'a, Result<FetchResponse>>;
}

#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
  timeout: Duration,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::Network(e.to_string()))?;
    Ok(Self { client, timeout })
  }
}

impl ResourceFetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a AgentRequest) -> BoxFuture<'a, Result<FetchResponse>> {
    Box::pin(async move {
      let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|e| SyncError::InvalidRequest(format!("Bad method {}: {}", request.method, e)))?;

      let response = self
        .client
        .request(method, request.url.clone())
        .send()
        .await
        .map_err(|e| SyncError::from_reqwest(e, self.timeout))?;

      let status = response.status().as_u16();
      let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| SyncError::from_reqwest(e, self.timeout))?;

      Ok(FetchResponse::network(status, headers, body.to_vec()))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_fetch_collects_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/css/styles.css"))
      .respond_with(
        ResponseTemplate::new(200)
          .insert_header("content-type", "text/css")
          .set_body_string("body{}"),
      )
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let request = AgentRequest::get(&format!("{}/css/styles.css", server.uri())).unwrap();
    let response = fetcher.fetch(&request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"body{}");
    assert_eq!(response.headers["content-type"], "text/css");
  }

  #[tokio::test]
  async fn test_fetch_returns_error_statuses() {
    let server = MockServer::start().await;
    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let request = AgentRequest::get(&format!("{}/missing.js", server.uri())).unwrap();

    let response = fetcher.fetch(&request).await.unwrap();
    assert_eq!(response.status, 404);
    assert!(!response.is_success());
  }
}
