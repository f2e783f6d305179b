//! Offline-first data access for a portal backed by a slow spreadsheet API.
//!
//! - [`cache`]: TTL-bounded local cache with stale-while-revalidate reads
//! - [`outbox`]: durable queue that delivers writes once the backend is reachable
//! - [`agent`]: page-independent interception of static-asset requests
//!
//! [`SyncContext`] wires the page-side pieces together from a [`Config`].

pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod logging;
pub mod outbox;
pub mod portal;

pub use config::Config;
pub use context::SyncContext;
pub use error::{Result, SyncError};
