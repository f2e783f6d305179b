//! Connectivity signal shared by the API client and the outbox.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Network reachability as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
  Online,
  Offline,
}

/// Broadcasts "went offline" / "came back online" transitions.
///
/// Cheap to clone; all clones observe the same status.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<NetworkStatus>>,
}

impl Connectivity {
  pub fn new(initial: NetworkStatus) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn status(&self) -> NetworkStatus {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.status() == NetworkStatus::Online
  }

  /// Record a status change. Repeating the current status is not a transition.
  pub fn set(&self, status: NetworkStatus) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == status {
        return false;
      }
      *current = status;
      true
    });
    if changed {
      info!(?status, "Connectivity changed");
    }
  }

  pub fn set_online(&self) {
    self.set(NetworkStatus::Online);
  }

  pub fn set_offline(&self) {
    self.set(NetworkStatus::Offline);
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(NetworkStatus::Online)
  }
}
