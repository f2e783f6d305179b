//! Portal data operations with transparent caching.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::api::{ApiClient, PostOutcome};
use crate::cache::{CacheResult, CacheStore, FetchOptions, UpdateCallback};
use crate::error::Result;

/// Cache key for the file listing
pub const FILES_KEY: &str = "api_files";
/// Cache key for the exam listing
pub const EXAMS_KEY: &str = "api_exams";

pub const FILES_TTL: Duration = Duration::from_secs(5 * 60);
pub const EXAMS_TTL: Duration = Duration::from_secs(3 * 60);

/// The operations the portal UI calls.
///
/// Listings are served stale-while-revalidate from the cache store; writes go
/// through the API client (and its outbox) and invalidate the listings they
/// affect.
#[derive(Clone)]
pub struct PortalClient {
  api: ApiClient,
  cache: CacheStore,
}

impl PortalClient {
  pub fn new(api: ApiClient, cache: CacheStore) -> Self {
    Self { api, cache }
  }

  pub fn api(&self) -> &ApiClient {
    &self.api
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  /// Shared files. `on_update` fires if a cached listing turns out stale.
  pub async fn get_files(&self, on_update: Option<UpdateCallback<Value>>) -> Result<CacheResult<Value>> {
    self
      .read_cached(FILES_KEY, "getFiles", FILES_TTL, on_update)
      .await
  }

  pub async fn get_exams(&self, on_update: Option<UpdateCallback<Value>>) -> Result<CacheResult<Value>> {
    self
      .read_cached(EXAMS_KEY, "getExams", EXAMS_TTL, on_update)
      .await
  }

  /// Scores for one exam (not cached: results change while an exam is open).
  pub async fn get_scores(&self, exam_id: &str) -> Result<Value> {
    self.api.get("getScores", &[("examId", exam_id)]).await
  }

  pub async fn add_file(&self, payload: &Value) -> Result<PostOutcome> {
    let outcome = self.api.post("addFile", payload).await?;
    self.invalidate(&[FILES_KEY]);
    Ok(outcome)
  }

  /// Delete the row of `sheet_name` whose column `id_col_index` equals `id_value`.
  pub async fn delete_item(
    &self,
    sheet_name: &str,
    id_col_index: u32,
    id_value: &str,
  ) -> Result<PostOutcome> {
    let payload = json!({
      "sheetName": sheet_name,
      "idColIndex": id_col_index,
      "idValue": id_value,
    });
    let outcome = self.api.post("deleteItem", &payload).await?;
    self.invalidate(&[FILES_KEY, EXAMS_KEY]);
    Ok(outcome)
  }

  pub async fn create_exam(&self, payload: &Value) -> Result<PostOutcome> {
    let outcome = self.api.post("createExam", payload).await?;
    self.invalidate(&[EXAMS_KEY]);
    Ok(outcome)
  }

  pub async fn update_exam_status(&self, exam_id: &str, new_status: &str) -> Result<PostOutcome> {
    let payload = json!({ "examId": exam_id, "newStatus": new_status });
    let outcome = self.api.post("updateExamStatus", &payload).await?;
    self.invalidate(&[EXAMS_KEY]);
    Ok(outcome)
  }

  pub async fn submit_exam(&self, payload: &Value) -> Result<PostOutcome> {
    self.api.post("submitExam", payload).await
  }

  async fn read_cached(
    &self,
    key: &str,
    action: &'static str,
    ttl: Duration,
    on_update: Option<UpdateCallback<Value>>,
  ) -> Result<CacheResult<Value>> {
    let api = self.api.clone();
    let options = FetchOptions { ttl, on_update };
    self
      .cache
      .fetch_with_cache(key, move || async move { api.get(action, &[]).await }, options)
      .await
  }

  // Also called for queued writes
  fn invalidate(&self, keys: &[&str]) {
    for key in keys {
      if self.cache.remove(key) {
        debug!(key, "Invalidated cached listing");
      }
    }
  }
}
