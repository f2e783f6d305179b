//! Offline outbox for write operations.
//!
//! Writes that cannot reach the backend are persisted in FIFO order and
//! replayed when connectivity returns, with linear backoff and a bounded
//! number of attempts per item.

mod dispatch;
mod item;
mod queue;
mod storage;

pub use dispatch::{is_delivered, Dispatcher, HttpDispatcher};
pub use item::{QueueItem, QueueMetadata, RequestDescriptor};
pub use queue::{FlushSummary, Outbox, OutboxEvent, OutboxSettings, BASE_DELAY, MAX_RETRIES};
pub use storage::{FileQueueStorage, NoopQueueStorage, QueueStorage};
