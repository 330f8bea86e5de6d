//! Durable cache of server records for offline reads.
//!
//! This module provides:
//! - Per-table key-value storage of opaque records, newest first
//! - Grouped lookups for messages (by conversation) and pipeline items (by pipeline)
//! - Per-table refresh metadata used to decide when to refetch
//! - A cache-first read layer that falls back to cached data when offline

mod layer;
mod storage;
mod table;
mod traits;

pub use layer::CacheLayer;
pub use storage::CacheStorage;
pub use table::Table;
pub use traits::{record_id, CacheMeta, CacheResult, CacheSource, Cacheable, Record};
