//! Durable FIFO outbox with bounded retry.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::dispatch::{is_delivered, Dispatcher};
use super::item::{QueueItem, QueueMetadata, RequestDescriptor};
use super::storage::{FileQueueStorage, NoopQueueStorage, QueueStorage};
use crate::config::OutboxConfig;
use crate::connectivity::{Connectivity, NetworkStatus};
use crate::error::Result;

/// Delivery attempts before an item is abandoned.
pub const MAX_RETRIES: u32 = 3;

/// Backoff unit; the n-th retry waits `BASE_DELAY * n`.
pub const BASE_DELAY: Duration = Duration::from_secs(3);

/// Capacity of the notification channel
const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct OutboxSettings {
  pub max_retries: u32,
  pub base_delay: Duration,
  /// Delay before the start-up flush, so a reload does not burst retries
  pub bootstrap_delay: Duration,
  /// Settle time after connectivity returns
  pub reconnect_delay: Duration,
}

impl Default for OutboxSettings {
  fn default() -> Self {
    Self {
      max_retries: MAX_RETRIES,
      base_delay: BASE_DELAY,
      bootstrap_delay: Duration::from_secs(2),
      reconnect_delay: Duration::from_secs(1),
    }
  }
}

impl From<&OutboxConfig> for OutboxSettings {
  fn from(config: &OutboxConfig) -> Self {
    Self {
      max_retries: config.max_retries.max(1),
      base_delay: Duration::from_millis(config.base_delay_ms),
      bootstrap_delay: Duration::from_millis(config.bootstrap_delay_ms),
      reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
    }
  }
}

/// Outbox notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboxEvent {
  /// Item persisted; `pending` is the queue length after insertion.
  Queued { id: String, action: String, pending: usize },
  /// Backend accepted the item and it was removed.
  Delivered {
    id: String,
    action: String,
    status: u16,
    retry_count: u32,
  },
  /// Attempt failed; the item waits `delay` before the next one.
  Retrying {
    id: String,
    action: String,
    retry_count: u32,
    delay: Duration,
  },
  /// Retry ceiling reached; the item was dropped.
  Exhausted { item: QueueItem, last_error: String },
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
  pub delivered: usize,
  pub dropped: usize,
}

/// Durable queue of write operations awaiting delivery.
///
/// Clones share the same storage, dispatcher and flush flag.
#[derive(Clone)]
pub struct Outbox {
  inner: Arc<OutboxInner>,
}

struct OutboxInner {
  storage: Box<dyn QueueStorage>,
  dispatcher: Arc<dyn Dispatcher>,
  connectivity: Connectivity,
  settings: OutboxSettings,
  flushing: AtomicBool,
  events: broadcast::Sender<OutboxEvent>,
}

/// Clears the flush flag when the flush ends, however it ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| FlushGuard(flag))
  }
}

impl Drop for FlushGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

enum Attempt {
  Delivered(u16),
  Failed(String),
}

impl Outbox {
  pub fn new(
    storage: impl QueueStorage + 'static,
    dispatcher: impl Dispatcher,
    connectivity: Connectivity,
    settings: OutboxSettings,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
    Self {
      inner: Arc::new(OutboxInner {
        storage: Box::new(storage),
        dispatcher: Arc::new(dispatcher),
        connectivity,
        settings,
        flushing: AtomicBool::new(false),
        events,
      }),
    }
  }

  /// Open the queue file at `path` (or the default location).
  ///
  /// Falls back to unavailable storage if the file cannot be used; `add`
  /// then fails and the caller sees its original error.
  pub fn init(
    path: Option<&Path>,
    dispatcher: impl Dispatcher,
    connectivity: Connectivity,
    settings: OutboxSettings,
  ) -> Self {
    let path = match path {
      Some(p) => Ok(p.to_path_buf()),
      None => FileQueueStorage::default_path(),
    };

    match path.and_then(|p| FileQueueStorage::open(&p)) {
      Ok(storage) => Self::new(storage, dispatcher, connectivity, settings),
      Err(e) => {
        warn!(error = %e, "Outbox unavailable, offline writes will fail");
        Self::new(NoopQueueStorage, dispatcher, connectivity, settings)
      }
    }
  }

  pub fn is_available(&self) -> bool {
    self.inner.storage.is_available()
  }

  pub fn is_flushing(&self) -> bool {
    self.inner.flushing.load(Ordering::Acquire)
  }

  /// Receive outbox notifications.
  ///
  /// The channel is bounded: a receiver that falls behind gets
  /// `RecvError::Lagged` and misses the oldest events, including any
  /// `Exhausted`. Dropped items are also logged at warn level.
  pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
    self.inner.events.subscribe()
  }

  /// Append a request and start a flush if online.
  ///
  /// Returns the queue length after insertion.
  pub fn add(
    &self,
    target_url: &str,
    request_descriptor: RequestDescriptor,
    metadata: QueueMetadata,
  ) -> Result<usize> {
    let item = QueueItem::new(target_url, request_descriptor, metadata);
    let id = item.id.clone();
    let action = item.label().to_string();

    let mut pending_item = Some(item);
    let items = self.inner.storage.update(&mut |queue| {
      if let Some(item) = pending_item.take() {
        queue.push(item);
      }
    })?;
    let pending = items.len();

    info!(id = %id, action = %action, pending, "Request queued for delivery");
    self.emit(OutboxEvent::Queued {
      id,
      action,
      pending,
    });

    if self.inner.connectivity.is_online() {
      self.spawn_flush();
    }
    Ok(pending)
  }

  /// Run [`flush`](Self::flush) on a background task.
  pub fn spawn_flush(&self) -> JoinHandle<FlushSummary> {
    let outbox = self.clone();
    tokio::spawn(async move { outbox.flush().await })
  }

  /// Deliver queued items in order until the queue is empty.
  ///
  /// A call while another flush is running returns immediately. A failed item
  /// is retried after a linear backoff before anything behind it is tried;
  /// the flush stops early if connectivity is lost.
  pub async fn flush(&self) -> FlushSummary {
    let mut summary = FlushSummary::default();
    if !self.is_available() {
      return summary;
    }

    loop {
      let Some(guard) = FlushGuard::acquire(&self.inner.flushing) else {
        debug!("Flush already in progress");
        break;
      };
      let drained = self.drain(&mut summary).await;
      drop(guard);

      // An add() between the last empty read and the flag release found the
      // flag still set and did not start a flush of its own.
      if !drained || !self.has_deliverable_items() {
        break;
      }
      debug!("Items queued while finishing, flushing again");
    }

    if summary.delivered > 0 || summary.dropped > 0 {
      info!(
        delivered = summary.delivered,
        dropped = summary.dropped,
        "Outbox flush finished"
      );
    }
    summary
  }

  /// Deliver from the head until the queue is empty. Returns `false` if it
  /// stopped early (offline or a storage failure).
  async fn drain(&self, summary: &mut FlushSummary) -> bool {
    loop {
      if self.inner.connectivity.status() == NetworkStatus::Offline {
        debug!("Offline, pausing outbox flush");
        return false;
      }

      let head = match self.inner.storage.load() {
        Ok(items) => items.into_iter().next(),
        Err(e) => {
          warn!(error = %e, "Failed to read outbox");
          return false;
        }
      };
      let Some(item) = head else {
        return true;
      };

      let attempt = match self.inner.dispatcher.dispatch(&item).await {
        Ok(status) if is_delivered(status) => Attempt::Delivered(status),
        Ok(status) => Attempt::Failed(format!("server error {}", status)),
        Err(e) => Attempt::Failed(e.to_string()),
      };

      let step = match attempt {
        Attempt::Delivered(status) => self.complete(&item, status).map(|()| {
          summary.delivered += 1;
        }),
        Attempt::Failed(reason) => match self.record_failure(&item, reason) {
          Ok(Some(delay)) => {
            sleep(delay).await;
            Ok(())
          }
          Ok(None) => {
            summary.dropped += 1;
            Ok(())
          }
          Err(e) => Err(e),
        },
      };

      if let Err(e) = step {
        warn!(id = %item.id, error = %e, "Failed to persist outbox change");
        return false;
      }
    }
  }

  fn has_deliverable_items(&self) -> bool {
    self.inner.connectivity.is_online()
      && self
        .inner
        .storage
        .load()
        .map(|items| !items.is_empty())
        .unwrap_or(false)
  }

  /// Queued items in delivery order.
  pub fn get_pending(&self) -> Result<Vec<QueueItem>> {
    self.inner.storage.load()
  }

  /// Drop every queued item. A no-op when storage is unavailable.
  pub fn clear(&self) -> Result<()> {
    if !self.is_available() {
      return Ok(());
    }
    self.inner.storage.update(&mut |queue| queue.clear())?;
    info!("Outbox cleared");
    Ok(())
  }

  /// Flush once after the start-up delay, if online by then.
  pub fn schedule_bootstrap(&self) -> JoinHandle<()> {
    let outbox = self.clone();
    tokio::spawn(async move {
      sleep(outbox.inner.settings.bootstrap_delay).await;
      if outbox.inner.connectivity.is_online() {
        outbox.flush().await;
      }
    })
  }

  /// Flush whenever connectivity comes back.
  pub fn watch_connectivity(&self) -> JoinHandle<()> {
    let outbox = self.clone();
    let mut rx = self.inner.connectivity.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let status = *rx.borrow_and_update();
        match status {
          NetworkStatus::Online => {
            info!("Back online, processing outbox");
            sleep(outbox.inner.settings.reconnect_delay).await;
            outbox.flush().await;
          }
          NetworkStatus::Offline => {
            info!("Went offline, writes will be queued");
          }
        }
      }
    })
  }

  fn complete(&self, item: &QueueItem, status: u16) -> Result<()> {
    self
      .inner
      .storage
      .update(&mut |queue| queue.retain(|i| i.id != item.id))?;

    info!(id = %item.id, action = %item.label(), status, "Queued request delivered");
    self.emit(OutboxEvent::Delivered {
      id: item.id.clone(),
      action: item.label().to_string(),
      status,
      retry_count: item.retry_count,
    });
    Ok(())
  }

  /// Count a failed attempt. Returns the backoff before the next attempt, or
  /// `None` if the item was dropped.
  fn record_failure(&self, item: &QueueItem, reason: String) -> Result<Option<Duration>> {
    let retry_count = item.retry_count + 1;

    if retry_count >= self.inner.settings.max_retries {
      self
        .inner
        .storage
        .update(&mut |queue| queue.retain(|i| i.id != item.id))?;

      warn!(
        id = %item.id,
        action = %item.label(),
        attempts = retry_count,
        error = %reason,
        "Giving up on queued request"
      );
      let mut dropped = item.clone();
      dropped.retry_count = retry_count;
      self.emit(OutboxEvent::Exhausted {
        item: dropped,
        last_error: reason,
      });
      return Ok(None);
    }

    self.inner.storage.update(&mut |queue| {
      if let Some(stored) = queue.iter_mut().find(|i| i.id == item.id) {
        stored.retry_count = retry_count;
      }
    })?;

    let delay = self.inner.settings.base_delay * retry_count;
    info!(
      id = %item.id,
      action = %item.label(),
      retry = retry_count,
      max = self.inner.settings.max_retries,
      ?delay,
      error = %reason,
      "Queued request failed, will retry"
    );
    self.emit(OutboxEvent::Retrying {
      id: item.id.clone(),
      action: item.label().to_string(),
      retry_count,
      delay,
    });
    Ok(Some(delay))
  }

  fn emit(&self, event: OutboxEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }
}

impl std::fmt::Debug for Outbox {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Outbox")
      .field("available", &self.is_available())
      .field("flushing", &self.is_flushing())
      .field("settings", &self.inner.settings)
      .finish()
  }
}
