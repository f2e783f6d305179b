//! Background network agent for static assets.
//!
//! Runs independently of the page-side cache and outbox. It pre-caches a
//! versioned manifest, drops the caches of other versions on activation, and
//! answers read-only requests per host:
//!
//! ```text
//! data API hosts   -> passthrough (never intercepted)
//! font hosts       -> cache-first            (miss + offline: 408)
//! everything else  -> stale-while-revalidate (miss + offline: 503 "Offline")
//! ```

mod fetch;
mod resource_cache;
mod strategy;
mod types;
mod worker;

pub use fetch::{HttpFetcher, ResourceFetcher};
pub use resource_cache::ResourceCaches;
pub use strategy::{Strategy, StrategyTable};
pub use types::{AgentRequest, AgentState, FetchResponse, Interception, ResponseSource};
pub use worker::{AgentClient, AgentRegistration, Handled, InstallReport, NetworkAgent};
