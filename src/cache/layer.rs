//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration, Utc};
use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::storage::CacheStorage;
use super::table::Table;
use super::traits::{CacheMeta, CacheResult, Cacheable, Record};

/// Cache layer that manages caching logic and network fetching.
///
/// Freshness is decided per table from the metadata written by the last
/// bulk refresh.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over a shared storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn is_stale(&self, meta: &CacheMeta) -> bool {
    Utc::now().timestamp_millis() - meta.last_sync > self.stale_time.num_milliseconds()
  }

  /// Read a whole table with a cache-first strategy.
  ///
  /// 1. If the table was refreshed within the stale time, serve the cache
  /// 2. Otherwise fetch and bulk-cache the result
  /// 3. On fetch failure, serve whatever is cached (offline mode)
  ///
  /// A failed fetch with no prior refresh is returned as an error.
  pub async fn fetch_table<F, Fut>(&self, table: Table, fetcher: F) -> Result<CacheResult<Vec<Record>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<Record>>>,
  {
    let Some(meta) = self.storage.get_cache_meta(table)? else {
      // Never refreshed, must fetch from network
      let data = fetcher().await?;
      self.storage.cache_data(table, &data)?;
      return Ok(CacheResult::from_network(data));
    };

    if !self.is_stale(&meta) {
      let cached = self.storage.get_cached_data(table, None)?;
      return Ok(CacheResult::from_cache(cached, meta.last_sync_at()));
    }

    match fetcher().await {
      Ok(data) => {
        self.storage.cache_data(table, &data)?;
        Ok(CacheResult::from_network(data))
      }
      Err(e) => {
        warn!(%table, error = %e, "refresh failed, serving cached data");
        let cached = self.storage.get_cached_data(table, None)?;
        Ok(CacheResult::offline(cached, meta.last_sync_at()))
      }
    }
  }

  /// Typed variant of [`CacheLayer::fetch_table`].
  pub async fn fetch_records<T, F, Fut>(&self, fetcher: F) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<Record>>>,
  {
    let result = self.fetch_table(T::table(), fetcher).await?;
    let data = result
      .data
      .into_iter()
      .map(|record| {
        serde_json::from_value(serde_json::Value::Object(record)).map_err(|e| {
          color_eyre::eyre::eyre!("Failed to deserialize {} record: {}", T::table(), e)
        })
      })
      .collect::<Result<Vec<T>>>()?;

    Ok(CacheResult {
      data,
      source: result.source,
      cached_at: result.cached_at,
    })
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      stale_time: self.stale_time,
    }
  }
}
