//! Durable queue of mutations waiting to be replayed against the remote.
//!
//! Operations are stored in insertion order with an auto-assigned,
//! monotonically increasing id. A failed operation keeps its id and
//! therefore its place in line.

use color_eyre::{eyre::eyre, Report, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::cache::{record_id, Record, Table};
use crate::db::{now_millis, SqliteStorage};

/// Kind of mutation carried by a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  /// `data` is the full record
  Insert,
  /// `data` is the record `id` plus the changed fields
  Update,
  /// `data` carries at least the record `id`
  Delete,
}

impl OperationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      OperationKind::Insert => "insert",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "insert" => Ok(OperationKind::Insert),
      "update" => Ok(OperationKind::Update),
      "delete" => Ok(OperationKind::Delete),
      other => Err(eyre!("Unknown operation: {}", other)),
    }
  }
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
  pub id: i64,
  pub table: Table,
  pub operation: OperationKind,
  pub data: Record,
  /// Milliseconds since epoch at enqueue time
  pub created_at: i64,
  /// Failed replay attempts so far
  pub retries: u32,
}

impl SyncOperation {
  /// Id of the record this operation targets.
  pub fn record_id(&self) -> Option<String> {
    record_id(&self.data)
  }
}

/// Trait for sync queue storage backends.
pub trait QueueStorage: Send + Sync {
  /// Append an operation with zero retries and return its id.
  ///
  /// Updates and deletes must name the target record `id`. A failed write
  /// is returned to the caller, never dropped.
  fn add_to_sync_queue(&self, table: Table, operation: OperationKind, data: Record) -> Result<i64>;

  /// All queued operations in insertion order.
  fn get_pending_sync_ops(&self) -> Result<Vec<SyncOperation>>;

  /// Remove one operation. Missing ids are not an error.
  fn remove_sync_op(&self, id: i64) -> Result<()>;

  /// Bump the retry counter of one operation. Missing ids are a no-op.
  fn increment_sync_retry(&self, id: i64) -> Result<()>;

  /// Number of queued operations.
  fn get_pending_sync_count(&self) -> Result<usize>;
}

impl QueueStorage for SqliteStorage {
  fn add_to_sync_queue(&self, table: Table, operation: OperationKind, data: Record) -> Result<i64> {
    if operation != OperationKind::Insert && record_id(&data).is_none() {
      return Err(eyre!("{} on {} requires a record id", operation, table));
    }

    let payload =
      serde_json::to_vec(&data).map_err(|e| eyre!("Failed to serialize operation: {}", e))?;
    let now = now_millis();

    let id = self.with_conn(|conn| {
      conn
        .execute(
          "INSERT INTO sync_queue (table_name, operation, data, created_at, retries)
           VALUES (?, ?, ?, ?, 0)",
          params![table.name(), operation.as_str(), payload, now],
        )
        .map_err(|e| eyre!("Failed to enqueue {} on {}: {}", operation, table, e))?;
      Ok(conn.last_insert_rowid())
    })?;

    debug!(id, %table, %operation, "queued sync operation");
    Ok(id)
  }

  fn get_pending_sync_ops(&self) -> Result<Vec<SyncOperation>> {
    let rows: Vec<(i64, String, String, Vec<u8>, i64, u32)> = self.with_conn(|conn| {
      let mut stmt = conn
        .prepare(
          "SELECT id, table_name, operation, data, created_at, retries
           FROM sync_queue ORDER BY id",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let rows = stmt
        .query_map([], |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        })
        .map_err(|e| eyre!("Failed to query sync queue: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read sync queue: {}", e))?;
      Ok(rows)
    })?;

    rows
      .into_iter()
      .map(|(id, table, operation, data, created_at, retries)| -> Result<SyncOperation> {
        Ok(SyncOperation {
          id,
          table: table.parse()?,
          operation: operation.parse()?,
          data: serde_json::from_slice(&data)
            .map_err(|e| eyre!("Failed to deserialize operation {}: {}", id, e))?,
          created_at,
          retries,
        })
      })
      .collect()
  }

  fn remove_sync_op(&self, id: i64) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to remove sync operation {}: {}", id, e))?;
      Ok(())
    })
  }

  fn increment_sync_retry(&self, id: i64) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute(
          "UPDATE sync_queue SET retries = retries + 1 WHERE id = ?",
          params![id],
        )
        .map_err(|e| eyre!("Failed to update sync operation {}: {}", id, e))?;
      Ok(())
    })
  }

  fn get_pending_sync_count(&self) -> Result<usize> {
    let count: i64 = self.with_conn(|conn| {
      conn
        .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
        .map_err(|e| eyre!("Failed to count sync queue: {}", e))
    })?;
    usize::try_from(count).map_err(|e| eyre!("Invalid sync queue count {}: {}", count, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap()
  }

  fn storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().unwrap()
  }

  #[test]
  fn test_enqueue_preserves_order_and_defaults() {
    let storage = storage();
    let first = storage
      .add_to_sync_queue(Table::Posts, OperationKind::Insert, record(json!({"id": "p1"})))
      .unwrap();
    let second = storage
      .add_to_sync_queue(
        Table::Posts,
        OperationKind::Update,
        record(json!({"id": "p1", "title": "B"})),
      )
      .unwrap();
    let third = storage
      .add_to_sync_queue(Table::Messages, OperationKind::Delete, record(json!({"id": "m1"})))
      .unwrap();
    assert!(first < second && second < third);

    let ops = storage.get_pending_sync_ops().unwrap();
    let ids: Vec<i64> = ops.iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![first, second, third]);
    assert_eq!(ops[1].operation, OperationKind::Update);
    assert_eq!(ops[2].table, Table::Messages);
    assert!(ops.iter().all(|op| op.retries == 0 && op.created_at > 0));
  }

  #[test]
  fn test_update_and_delete_require_record_id() {
    let storage = storage();
    assert!(storage
      .add_to_sync_queue(Table::Posts, OperationKind::Update, record(json!({"title": "x"})))
      .is_err());
    assert!(storage
      .add_to_sync_queue(Table::Posts, OperationKind::Delete, record(json!({})))
      .is_err());
    // Inserts may rely on the server assigning an id
    assert!(storage
      .add_to_sync_queue(Table::Posts, OperationKind::Insert, record(json!({"title": "x"})))
      .is_ok());
    assert_eq!(storage.get_pending_sync_count().unwrap(), 1);
  }

  #[test]
  fn test_remove_sync_op_is_idempotent() {
    let storage = storage();
    let id = storage
      .add_to_sync_queue(Table::Posts, OperationKind::Insert, record(json!({"id": "p1"})))
      .unwrap();

    storage.remove_sync_op(id).unwrap();
    storage.remove_sync_op(id).unwrap();
    storage.remove_sync_op(9999).unwrap();
    assert_eq!(storage.get_pending_sync_count().unwrap(), 0);
  }

  #[test]
  fn test_increment_sync_retry() {
    let storage = storage();
    let id = storage
      .add_to_sync_queue(Table::Posts, OperationKind::Insert, record(json!({"id": "p1"})))
      .unwrap();

    storage.increment_sync_retry(id).unwrap();
    storage.increment_sync_retry(id).unwrap();
    assert_eq!(storage.get_pending_sync_ops().unwrap()[0].retries, 2);

    // Concurrently removed operations are left alone
    storage.remove_sync_op(id).unwrap();
    storage.increment_sync_retry(id).unwrap();
    assert_eq!(storage.get_pending_sync_count().unwrap(), 0);
  }

  #[test]
  fn test_ids_stay_monotonic_after_clear() {
    use crate::cache::CacheStorage;

    let storage = storage();
    let before = storage
      .add_to_sync_queue(Table::Posts, OperationKind::Insert, record(json!({"id": "p1"})))
      .unwrap();
    storage.clear_all_data().unwrap();
    let after = storage
      .add_to_sync_queue(Table::Posts, OperationKind::Insert, record(json!({"id": "p2"})))
      .unwrap();
    assert!(after > before);
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage
        .add_to_sync_queue(
          Table::PipelineItems,
          OperationKind::Update,
          record(json!({"id": "i1", "stage": "won"})),
        )
        .unwrap();
      storage.close().unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    let ops = storage.get_pending_sync_ops().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].record_id().as_deref(), Some("i1"));
    assert_eq!(ops[0].data["stage"], "won");
  }

  #[test]
  fn test_enqueue_on_closed_storage_fails() {
    let storage = storage();
    storage.close().unwrap();
    assert!(storage
      .add_to_sync_queue(Table::Posts, OperationKind::Insert, record(json!({"id": "p1"})))
      .is_err());
  }

  #[test]
  fn test_operation_kind_parses() {
    assert_eq!("delete".parse::<OperationKind>().unwrap(), OperationKind::Delete);
    assert!("upsert".parse::<OperationKind>().is_err());
  }
}
