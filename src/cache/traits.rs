//! Core traits and types for the caching system.

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use super::table::Table;

/// An opaque record as last seen from the server: field name to value.
pub type Record = Map<String, Value>;

/// Extract the record id. Both string and integer ids are accepted.
pub fn record_id(record: &Record) -> Option<String> {
  match record.get("id")? {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Trait for typed records that can be cached.
///
/// The record serializes to a JSON object carrying an `id` field; the
/// cache stores that object verbatim.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Table this record type lives in
  fn table() -> Table;

  /// Unique identifier within the table
  fn cache_key(&self) -> String;
}

/// Per-table bookkeeping for the last bulk refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMeta {
  pub table: Table,
  /// Milliseconds since epoch of the most recent bulk write
  pub last_sync: i64,
  /// Digest of the last written batch
  pub etag: Option<String>,
}

impl CacheMeta {
  /// `last_sync` as a UTC timestamp.
  pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.last_sync).single()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data that is still fresh.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
