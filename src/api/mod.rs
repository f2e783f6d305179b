//! Networking layer for the spreadsheet API.

mod client;
mod envelope;

pub use client::{build_http_client, ApiClient, PostOutcome, WRITE_CONTENT_TYPE};
