//! Agent lifecycle and request handling.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::fetch::ResourceFetcher;
use super::resource_cache::ResourceCaches;
use super::strategy::{Strategy, StrategyTable};
use super::types::{AgentRequest, AgentState, FetchResponse, Interception};
use crate::config::AgentConfig;
use crate::error::{Result, SyncError};

/// Outcome of pre-caching the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub cache_name: String,
  pub cached: Vec<String>,
  pub failed: Vec<String>,
}

/// A handled request plus the background refresh it started, if any.
#[derive(Debug)]
pub struct Handled {
  pub interception: Interception,
  pub refresh: Option<JoinHandle<()>>,
}

impl Handled {
  fn passthrough() -> Self {
    Self {
      interception: Interception::Passthrough,
      refresh: None,
    }
  }

  fn respond(response: FetchResponse) -> Self {
    Self {
      interception: Interception::Respond(response),
      refresh: None,
    }
  }
}

/// One version of the background agent.
///
/// Answers static-asset requests from its own resource cache according to
/// the strategy table. Clones share state.
#[derive(Clone)]
pub struct NetworkAgent {
  inner: Arc<AgentInner>,
}

struct AgentInner {
  caches: Arc<ResourceCaches>,
  fetcher: Arc<dyn ResourceFetcher>,
  strategies: StrategyTable,
  version: String,
  cache_name: String,
  origin: Url,
  manifest: Vec<String>,
  state: Mutex<AgentState>,
}

impl NetworkAgent {
  pub fn new(
    caches: Arc<ResourceCaches>,
    fetcher: impl ResourceFetcher,
    config: &AgentConfig,
  ) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| SyncError::Config(format!("Invalid agent origin {}: {}", config.origin, e)))?;

    Ok(Self {
      inner: Arc::new(AgentInner {
        caches,
        fetcher: Arc::new(fetcher),
        strategies: StrategyTable::from_config(config),
        version: config.version.clone(),
        cache_name: format!("{}-{}", config.cache_prefix, config.version),
        origin,
        manifest: config.manifest.clone(),
        state: Mutex::new(AgentState::Installing),
      }),
    })
  }

  pub fn version(&self) -> &str {
    &self.inner.version
  }

  /// Name of the resource cache this version owns.
  pub fn cache_name(&self) -> &str {
    &self.inner.cache_name
  }

  pub fn state(&self) -> AgentState {
    *self.lock_state()
  }

  pub fn caches(&self) -> &ResourceCaches {
    &self.inner.caches
  }

  /// Pre-cache the manifest.
  ///
  /// Assets that fail to download are reported but do not fail the install.
  /// A storage failure does, and leaves the agent redundant.
  pub async fn install(&self) -> Result<InstallReport> {
    self.set_state(AgentState::Installing);

    if let Err(e) = self.inner.caches.open_cache(&self.inner.cache_name) {
      self.set_state(AgentState::Redundant);
      return Err(e);
    }

    let requests = self
      .inner
      .manifest
      .iter()
      .map(|path| {
        self
          .inner
          .origin
          .join(path)
          .map(|url| (path.clone(), url))
          .map_err(|e| (path.clone(), e.to_string()))
      })
      .collect::<Vec<_>>();

    let fetches = requests.iter().map(|resolved| async move {
      let (path, url) = match resolved {
        Ok(pair) => pair,
        Err((path, reason)) => return (path.clone(), Err(reason.clone())),
      };
      let request = AgentRequest {
        method: "GET".to_string(),
        url: url.clone(),
      };
      let outcome = match self.inner.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => self
          .inner
          .caches
          .put(&self.inner.cache_name, request.cache_key(), &response)
          .map_err(|e| e.to_string()),
        Ok(response) => Err(format!("status {}", response.status)),
        Err(e) => Err(e.to_string()),
      };
      (path.clone(), outcome)
    });

    let mut report = InstallReport {
      cache_name: self.inner.cache_name.clone(),
      ..InstallReport::default()
    };
    for (path, outcome) in join_all(fetches).await {
      match outcome {
        Ok(()) => report.cached.push(path),
        Err(reason) => {
          warn!(asset = %path, error = %reason, "Failed to pre-cache asset");
          report.failed.push(path);
        }
      }
    }

    self.set_state(AgentState::Installed);
    info!(
      version = %self.inner.version,
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Agent installed"
    );
    Ok(report)
  }

  /// Delete every resource cache except this version's.
  ///
  /// Returns the names of the deleted caches.
  pub fn activate(&self) -> Result<Vec<String>> {
    match self.state() {
      AgentState::Installed => {}
      AgentState::Activated => return Ok(Vec::new()),
      other => {
        return Err(SyncError::InvalidState(format!(
          "cannot activate agent {} while {:?}",
          self.inner.version, other
        )))
      }
    }
    self.set_state(AgentState::Activating);

    match self.delete_other_caches() {
      Ok(removed) => {
        self.set_state(AgentState::Activated);
        info!(version = %self.inner.version, "Agent activated");
        Ok(removed)
      }
      Err(e) => {
        // Back to Installed so activation can be retried
        self.set_state(AgentState::Installed);
        warn!(version = %self.inner.version, error = %e, "Agent activation failed");
        Err(e)
      }
    }
  }

  fn delete_other_caches(&self) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in self.inner.caches.keys()? {
      if name != self.inner.cache_name && self.inner.caches.delete(&name)? {
        info!(cache = %name, "Deleted old resource cache");
        removed.push(name);
      }
    }
    Ok(removed)
  }

  /// Resume a version installed by an earlier run.
  pub fn resume(&self) -> Result<()> {
    if !self.inner.caches.has(&self.inner.cache_name)? {
      return Err(SyncError::InvalidState(format!(
        "no resource cache for {}",
        self.inner.cache_name
      )));
    }
    self.set_state(AgentState::Installed);
    self.activate()?;
    Ok(())
  }

  pub fn mark_redundant(&self) {
    self.set_state(AgentState::Redundant);
    debug!(version = %self.inner.version, "Agent is redundant");
  }

  /// Answer a request from a controlled client.
  ///
  /// Only an activated agent intercepts anything.
  pub async fn handle_fetch(&self, request: &AgentRequest) -> Handled {
    if self.state() != AgentState::Activated {
      return Handled::passthrough();
    }

    match self.inner.strategies.classify(request) {
      Strategy::Passthrough => Handled::passthrough(),
      Strategy::CacheFirst => Handled::respond(self.cache_first(request).await),
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  async fn cache_first(&self, request: &AgentRequest) -> FetchResponse {
    if let Some(hit) = self.lookup(request) {
      return hit;
    }

    match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(request, &response);
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Cache-first fetch failed");
        FetchResponse::timeout()
      }
    }
  }

  async fn stale_while_revalidate(&self, request: &AgentRequest) -> Handled {
    if let Some(hit) = self.lookup(request) {
      let agent = self.clone();
      let request = request.clone();
      let refresh = tokio::spawn(async move {
        match agent.inner.fetcher.fetch(&request).await {
          Ok(response) => agent.store(&request, &response),
          Err(e) => debug!(url = %request.url, error = %e, "Background refresh failed"),
        }
      });
      return Handled {
        interception: Interception::Respond(hit),
        refresh: Some(refresh),
      };
    }

    let response = match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(request, &response);
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network unavailable, answering offline");
        FetchResponse::offline()
      }
    };
    Handled::respond(response)
  }

  fn lookup(&self, request: &AgentRequest) -> Option<FetchResponse> {
    match self
      .inner
      .caches
      .match_request(&self.inner.cache_name, request.cache_key())
    {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Resource cache read failed");
        None
      }
    }
  }

  /// Cache successful responses only.
  fn store(&self, request: &AgentRequest, response: &FetchResponse) {
    if !response.is_success() {
      return;
    }
    if let Err(e) = self
      .inner
      .caches
      .put(&self.inner.cache_name, request.cache_key(), response)
    {
      warn!(url = %request.url, error = %e, "Resource cache write failed");
    }
  }

  fn set_state(&self, state: AgentState) {
    *self.lock_state() = state;
  }

  fn lock_state(&self) -> MutexGuard<'_, AgentState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl std::fmt::Debug for NetworkAgent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NetworkAgent")
      .field("version", &self.inner.version)
      .field("cache_name", &self.inner.cache_name)
      .field("state", &self.state())
      .finish()
  }
}

/// A connected client and the agent version controlling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentClient {
  pub id: String,
  pub controller: Option<String>,
}

/// The active agent and the clients it controls.
#[derive(Debug, Default)]
pub struct AgentRegistration {
  active: Option<NetworkAgent>,
  clients: Vec<AgentClient>,
}

impl AgentRegistration {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn active(&self) -> Option<&NetworkAgent> {
    self.active.as_ref()
  }

  pub fn clients(&self) -> &[AgentClient] {
    &self.clients
  }

  /// Register a client. It is controlled by the active agent, if any.
  pub fn connect_client(&mut self, id: &str) {
    let controller = self.active.as_ref().map(|a| a.version().to_string());
    match self.clients.iter_mut().find(|c| c.id == id) {
      Some(client) => client.controller = controller,
      None => self.clients.push(AgentClient {
        id: id.to_string(),
        controller,
      }),
    }
  }

  pub fn disconnect_client(&mut self, id: &str) -> bool {
    let before = self.clients.len();
    self.clients.retain(|c| c.id != id);
    self.clients.len() != before
  }

  /// Install `agent`, activate it without waiting for clients to close, and
  /// take control of every connected client.
  pub async fn deploy(&mut self, agent: NetworkAgent) -> Result<InstallReport> {
    let report = agent.install().await?;
    agent.activate()?;
    self.replace_active(agent);
    Ok(report)
  }

  /// Re-activate a version whose resource cache survived from an earlier run.
  pub fn restore(&mut self, agent: NetworkAgent) -> Result<()> {
    agent.resume()?;
    self.replace_active(agent);
    Ok(())
  }

  /// Route a client request through the active agent.
  pub async fn handle_fetch(&self, request: &AgentRequest) -> Handled {
    match &self.active {
      Some(agent) => agent.handle_fetch(request).await,
      None => Handled::passthrough(),
    }
  }

  fn replace_active(&mut self, agent: NetworkAgent) {
    if let Some(previous) = self.active.replace(agent) {
      previous.mark_redundant();
    }
    self.claim();
  }

  fn claim(&mut self) {
    let version = self.active.as_ref().map(|a| a.version().to_string());
    for client in &mut self.clients {
      client.controller = version.clone();
    }
    debug!(clients = self.clients.len(), ?version, "Clients claimed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::ResponseSource;
  use futures::future::BoxFuture;
  use std::collections::{BTreeMap, HashMap, HashSet};

  /// Serves bodies by path; paths in `down` fail like an unreachable host.
  #[derive(Clone, Default)]
  struct FakeNetwork {
    bodies: Arc<Mutex<HashMap<String, (u16, String)>>>,
    down: Arc<Mutex<HashSet<String>>>,
    offline: Arc<Mutex<bool>>,
    calls: Arc<Mutex<Vec<String>>>,
  }

  impl FakeNetwork {
    fn serve(&self, path: &str, status: u16, body: &str) {
      self
        .bodies
        .lock()
        .unwrap()
        .insert(path.to_string(), (status, body.to_string()));
    }

    fn fail(&self, path: &str, down: bool) {
      let mut set = self.down.lock().unwrap();
      if down {
        set.insert(path.to_string());
      } else {
        set.remove(path);
      }
    }

    fn set_offline(&self, offline: bool) {
      *self.offline.lock().unwrap() = offline;
    }

    fn calls(&self, path: &str) -> usize {
      self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
    }
  }

  impl ResourceFetcher for FakeNetwork {
    fn fetch<'a>(&'a self, request: &'a AgentRequest) -> BoxFuture<'a, Result<FetchResponse>> {
      let path = request.url.path().to_string();
      self.calls.lock().unwrap().push(path.clone());

      let outcome = if *self.offline.lock().unwrap() || self.down.lock().unwrap().contains(&path) {
        Err(SyncError::Network("connection refused".into()))
      } else {
        let (status, body) = self
          .bodies
          .lock()
          .unwrap()
          .get(&path)
          .cloned()
          .unwrap_or((404, String::new()));
        Ok(FetchResponse::network(status, BTreeMap::new(), body.into_bytes()))
      };
      Box::pin(async move { outcome })
    }
  }

  fn config(version: &str, manifest: &[&str]) -> AgentConfig {
    AgentConfig {
      version: version.to_string(),
      origin: "http://localhost:8080/".to_string(),
      manifest: manifest.iter().map(|s| s.to_string()).collect(),
      ..AgentConfig::default()
    }
  }

  fn agent(caches: &Arc<ResourceCaches>, network: &FakeNetwork, version: &str, manifest: &[&str]) -> NetworkAgent {
    NetworkAgent::new(Arc::clone(caches), network.clone(), &config(version, manifest)).unwrap()
  }

  fn response(handled: &Handled) -> &FetchResponse {
    handled.interception.response().expect("request should be intercepted")
  }

  fn local(path: &str) -> AgentRequest {
    AgentRequest::get(&format!("http://localhost:8080{}", path)).unwrap()
  }

  #[tokio::test]
  async fn test_partial_install_still_activates() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    network.serve("/a.js", 200, "console.log('a')");
    network.serve("/b.css", 200, "body{}");
    network.fail("/b.css", true);

    let mut registration = AgentRegistration::new();
    let report = registration
      .deploy(agent(&caches, &network, "v3", &["/a.js", "/b.css"]))
      .await
      .unwrap();
    assert_eq!(report.cached, vec!["/a.js"]);
    assert_eq!(report.failed, vec!["/b.css"]);
    assert_eq!(registration.active().unwrap().state(), AgentState::Activated);

    network.fail("/b.css", false);

    let a = registration.handle_fetch(&local("/a.js")).await;
    assert_eq!(response(&a).source, ResponseSource::Cache);
    assert_eq!(response(&a).body, b"console.log('a')");
    a.refresh.unwrap().await.unwrap();

    let b = registration.handle_fetch(&local("/b.css")).await;
    assert_eq!(response(&b).source, ResponseSource::Network);
    assert_eq!(response(&b).body, b"body{}");
    assert!(b.refresh.is_none());
    assert!(caches
      .match_request("portal-static-v3", local("/b.css").cache_key())
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_activation_deletes_other_versions() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    network.serve("/a.js", 200, "v2");

    let mut registration = AgentRegistration::new();
    registration.connect_client("tab-1");
    let old = agent(&caches, &network, "v2", &["/a.js"]);
    registration.deploy(old.clone()).await.unwrap();
    assert_eq!(registration.clients()[0].controller.as_deref(), Some("v2"));

    network.serve("/a.js", 200, "v3");
    registration
      .deploy(agent(&caches, &network, "v3", &["/a.js"]))
      .await
      .unwrap();

    assert_eq!(caches.keys().unwrap(), vec!["portal-static-v3"]);
    assert_eq!(old.state(), AgentState::Redundant);
    assert_eq!(registration.clients()[0].controller.as_deref(), Some("v3"));

    // A redundant agent no longer intercepts
    assert_eq!(
      old.handle_fetch(&local("/a.js")).await.interception,
      Interception::Passthrough
    );
  }

  #[tokio::test]
  async fn test_cache_first_serves_and_stores() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    network.serve("/css2", 200, "@font-face{}");
    let agent = agent(&caches, &network, "v3", &[]);
    agent.install().await.unwrap();
    agent.activate().unwrap();

    let request = AgentRequest::get("https://fonts.googleapis.com/css2?family=Inter").unwrap();
    let first = agent.handle_fetch(&request).await;
    assert_eq!(response(&first).source, ResponseSource::Network);

    network.set_offline(true);
    let second = agent.handle_fetch(&request).await;
    assert_eq!(response(&second).source, ResponseSource::Cache);
    assert_eq!(response(&second).body, b"@font-face{}");
    assert!(second.refresh.is_none());
    assert_eq!(network.calls("/css2"), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_is_408() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    let agent = agent(&caches, &network, "v3", &[]);
    agent.install().await.unwrap();
    agent.activate().unwrap();
    network.set_offline(true);

    let request = AgentRequest::get("https://fonts.gstatic.com/s/inter.woff2").unwrap();
    let handled = agent.handle_fetch(&request).await;
    assert_eq!(response(&handled).status, 408);
    assert_eq!(response(&handled).source, ResponseSource::Synthetic);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_offline_is_503() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    let agent = agent(&caches, &network, "v3", &[]);
    agent.install().await.unwrap();
    agent.activate().unwrap();
    network.set_offline(true);

    let handled = agent.handle_fetch(&local("/js/student.js")).await;
    assert_eq!(*response(&handled), FetchResponse::offline());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refreshes_in_background() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    network.serve("/js/api.js", 200, "old");
    let agent = agent(&caches, &network, "v3", &["/js/api.js"]);
    agent.install().await.unwrap();
    agent.activate().unwrap();

    network.serve("/js/api.js", 200, "new");
    let handled = agent.handle_fetch(&local("/js/api.js")).await;
    assert_eq!(response(&handled).body, b"old");
    handled.refresh.unwrap().await.unwrap();

    let cached = caches
      .match_request("portal-static-v3", local("/js/api.js").cache_key())
      .unwrap()
      .unwrap();
    assert_eq!(cached.body, b"new");
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    network.serve("/broken.js", 500, "oops");
    let agent = agent(&caches, &network, "v3", &[]);
    agent.install().await.unwrap();
    agent.activate().unwrap();

    let handled = agent.handle_fetch(&local("/broken.js")).await;
    assert_eq!(response(&handled).status, 500);
    assert!(caches
      .match_request("portal-static-v3", local("/broken.js").cache_key())
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_api_and_mutating_requests_pass_through() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    let agent = agent(&caches, &network, "v3", &[]);
    agent.install().await.unwrap();
    agent.activate().unwrap();

    let api = AgentRequest::get("https://script.google.com/macros/s/x/exec?action=getFiles").unwrap();
    assert_eq!(agent.handle_fetch(&api).await.interception, Interception::Passthrough);

    let post = AgentRequest::new("POST", "http://localhost:8080/upload").unwrap();
    assert_eq!(agent.handle_fetch(&post).await.interception, Interception::Passthrough);
    assert_eq!(network.calls("/macros/s/x/exec") + network.calls("/upload"), 0);
  }

  #[tokio::test]
  async fn test_installed_agent_does_not_intercept() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    let agent = agent(&caches, &network, "v3", &[]);
    agent.install().await.unwrap();

    assert_eq!(agent.state(), AgentState::Installed);
    assert_eq!(
      agent.handle_fetch(&local("/index.html")).await.interception,
      Interception::Passthrough
    );
  }

  #[test]
  fn test_activate_requires_install() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let agent = agent(&caches, &FakeNetwork::default(), "v3", &[]);
    assert!(matches!(agent.activate(), Err(SyncError::InvalidState(_))));
  }

  #[tokio::test]
  async fn test_failed_activation_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");
    let caches = Arc::new(ResourceCaches::open(&path).unwrap());
    caches.open_cache("portal-static-v2").unwrap();
    let network = FakeNetwork::default();
    let agent = agent(&caches, &network, "v3", &[]);
    agent.install().await.unwrap();
    assert_eq!(agent.state(), AgentState::Installed);

    let other = rusqlite::Connection::open(&path).unwrap();
    other.execute_batch("DROP TABLE resource_entries").unwrap();

    assert!(agent.activate().is_err());
    assert_eq!(agent.state(), AgentState::Installed);

    other
      .execute_batch(
        "CREATE TABLE resource_entries (
           cache_name TEXT NOT NULL,
           url TEXT NOT NULL,
           status INTEGER NOT NULL,
           headers TEXT NOT NULL,
           body BLOB NOT NULL,
           cached_at INTEGER NOT NULL,
           PRIMARY KEY (cache_name, url)
         )",
      )
      .unwrap();

    assert_eq!(agent.activate().unwrap(), vec!["portal-static-v2"]);
    assert_eq!(agent.state(), AgentState::Activated);
    assert_eq!(caches.keys().unwrap(), vec!["portal-static-v3"]);
  }

  #[tokio::test]
  async fn test_restore_requires_existing_cache() {
    let caches = Arc::new(ResourceCaches::open_in_memory().unwrap());
    let network = FakeNetwork::default();
    let mut registration = AgentRegistration::new();

    assert!(matches!(
      registration.restore(agent(&caches, &network, "v3", &[])),
      Err(SyncError::InvalidState(_))
    ));
    assert!(registration.active().is_none());

    caches.open_cache("portal-static-v3").unwrap();
    registration.connect_client("tab-1");
    registration.restore(agent(&caches, &network, "v3", &[])).unwrap();
    assert_eq!(registration.active().unwrap().state(), AgentState::Activated);
    assert_eq!(registration.clients()[0].controller.as_deref(), Some("v3"));
  }

  #[test]
  fn test_client_bookkeeping() {
    let mut registration = AgentRegistration::new();
    registration.connect_client("tab-1");
    registration.connect_client("tab-1");
    assert_eq!(registration.clients().len(), 1);
    assert_eq!(registration.clients()[0].controller, None);

    assert!(registration.disconnect_client("tab-1"));
    assert!(!registration.disconnect_client("tab-1"));
  }
}
