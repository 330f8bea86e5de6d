//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Params, Statement};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::table::Table;
use super::traits::{record_id, CacheMeta, Cacheable, Record};
use crate::db::{now_millis, SqliteStorage};

/// Trait for cache storage backends.
///
/// Storage errors are returned to the caller as-is; nothing here retries.
pub trait CacheStorage: Send + Sync {
  /// Upsert every record (each must carry an `id`) with `updated_at = now`,
  /// then stamp the table's metadata with the same time.
  ///
  /// Existing entries with the same id are fully replaced. Entries absent
  /// from `items` are left alone. An empty batch still refreshes the
  /// metadata timestamp.
  fn cache_data(&self, table: Table, items: &[Record]) -> Result<()>;

  /// Cached records, most recently written first, optionally capped.
  fn get_cached_data(&self, table: Table, limit: Option<usize>) -> Result<Vec<Record>>;

  /// A single cached record by id.
  fn get_cached_item(&self, table: Table, id: &str) -> Result<Option<Record>>;

  /// Remove one entry. Missing ids are not an error.
  fn delete_cached_item(&self, table: Table, id: &str) -> Result<()>;

  /// Remove every entry of one table.
  fn clear_cache(&self, table: Table) -> Result<()>;

  /// Remove all entries, all metadata and the whole sync queue.
  fn clear_all_data(&self) -> Result<()>;

  /// Metadata of the last bulk write for a table.
  fn get_cache_meta(&self, table: Table) -> Result<Option<CacheMeta>>;

  /// Records of a grouped table whose grouping field equals `group_key`.
  fn get_grouped(&self, table: Table, group_key: &str) -> Result<Vec<Record>>;

  /// Cached messages of one conversation.
  fn get_conversation_messages(&self, conversation_id: &str) -> Result<Vec<Record>> {
    self.get_grouped(Table::Messages, conversation_id)
  }

  /// Cached items of one pipeline.
  fn get_pipeline_items(&self, pipeline_id: &str) -> Result<Vec<Record>> {
    self.get_grouped(Table::PipelineItems, pipeline_id)
  }

  /// Typed variant of [`CacheStorage::cache_data`].
  fn cache_records<T: Cacheable>(&self, items: &[T]) -> Result<()>
  where
    Self: Sized,
  {
    let records = items
      .iter()
      .map(to_record)
      .collect::<Result<Vec<_>>>()?;
    self.cache_data(T::table(), &records)
  }

  /// Typed variant of [`CacheStorage::get_cached_item`].
  fn get_record<T: Cacheable>(&self, id: &str) -> Result<Option<T>>
  where
    Self: Sized,
  {
    self
      .get_cached_item(T::table(), id)?
      .map(from_record)
      .transpose()
  }

  /// Typed variant of [`CacheStorage::get_cached_data`].
  fn get_records<T: Cacheable>(&self, limit: Option<usize>) -> Result<Vec<T>>
  where
    Self: Sized,
  {
    self
      .get_cached_data(T::table(), limit)?
      .into_iter()
      .map(from_record)
      .collect()
  }
}

fn to_record<T: Cacheable>(item: &T) -> Result<Record> {
  match serde_json::to_value(item).map_err(|e| eyre!("Failed to serialize record: {}", e))? {
    Value::Object(mut map) => {
      map
        .entry("id")
        .or_insert_with(|| Value::String(item.cache_key()));
      Ok(map)
    }
    other => Err(eyre!(
      "Record for {} did not serialize to an object: {}",
      T::table(),
      other
    )),
  }
}

fn from_record<T: Cacheable>(record: Record) -> Result<T> {
  serde_json::from_value(Value::Object(record))
    .map_err(|e| eyre!("Failed to deserialize {} record: {}", T::table(), e))
}

/// Grouping value of a record, stringified the same way ids are.
fn group_value(record: &Record, field: &str) -> Option<String> {
  match record.get(field)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Run a `SELECT data ...` statement and decode every row.
fn query_records<P: Params>(stmt: &mut Statement<'_>, params: P) -> Result<Vec<Record>> {
  let rows = stmt
    .query_map(params, |row| row.get::<_, Vec<u8>>(0))
    .map_err(|e| eyre!("Failed to query cache entries: {}", e))?;

  let mut records = Vec::new();
  for row in rows {
    let data = row.map_err(|e| eyre!("Failed to read cache entry: {}", e))?;
    let record = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize cache entry: {}", e))?;
    records.push(record);
  }
  Ok(records)
}

impl CacheStorage for SqliteStorage {
  fn cache_data(&self, table: Table, items: &[Record]) -> Result<()> {
    let now = now_millis();
    let group_field = table.group_field();
    let mut hasher = Sha256::new();

    // Validate and encode everything before touching the database
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
      let id = record_id(item).ok_or_else(|| eyre!("Record in {} has no id", table))?;
      let data =
        serde_json::to_vec(item).map_err(|e| eyre!("Failed to serialize record: {}", e))?;
      hasher.update(&data);
      let group_key = group_field.and_then(|field| group_value(item, field));
      rows.push((id, data, group_key));
    }
    let etag = hex::encode(hasher.finalize());

    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      {
        let mut stmt = tx
          .prepare(
            "INSERT OR REPLACE INTO cache_entries (table_name, id, data, updated_at, group_key)
             VALUES (?, ?, ?, ?, ?)",
          )
          .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

        for (id, data, group_key) in &rows {
          stmt
            .execute(params![table.name(), id, data, now, group_key])
            .map_err(|e| eyre!("Failed to store {} record {}: {}", table, id, e))?;
        }
      }

      tx.execute(
        "INSERT OR REPLACE INTO cache_meta (table_name, last_sync, etag) VALUES (?, ?, ?)",
        params![table.name(), now, etag],
      )
      .map_err(|e| eyre!("Failed to update cache metadata: {}", e))?;

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      Ok(())
    })?;

    debug!(%table, count = rows.len(), "cached records");
    Ok(())
  }

  fn get_cached_data(&self, table: Table, limit: Option<usize>) -> Result<Vec<Record>> {
    // SQLite treats a negative LIMIT as unbounded
    let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

    self.with_conn(|conn| {
      // rowid breaks ties between writes landing in the same millisecond
      let mut stmt = conn
        .prepare(
          "SELECT data FROM cache_entries
           WHERE table_name = ?
           ORDER BY updated_at DESC, rowid DESC
           LIMIT ?",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      query_records(&mut stmt, params![table.name(), limit])
    })
  }

  fn get_cached_item(&self, table: Table, id: &str) -> Result<Option<Record>> {
    let data: Option<Vec<u8>> = self.with_conn(|conn| {
      conn
        .query_row(
          "SELECT data FROM cache_entries WHERE table_name = ? AND id = ?",
          params![table.name(), id],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read {} record {}: {}", table, id, e))
    })?;

    data
      .map(|data| {
        serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry: {}", e))
      })
      .transpose()
  }

  fn delete_cached_item(&self, table: Table, id: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries WHERE table_name = ? AND id = ?",
          params![table.name(), id],
        )
        .map_err(|e| eyre!("Failed to delete {} record {}: {}", table, id, e))?;
      Ok(())
    })
  }

  fn clear_cache(&self, table: Table) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries WHERE table_name = ?",
          params![table.name()],
        )
        .map_err(|e| eyre!("Failed to clear {} cache: {}", table, e))?;
      Ok(())
    })
  }

  fn clear_all_data(&self) -> Result<()> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
      tx.execute_batch(
        "DELETE FROM cache_entries;
         DELETE FROM cache_meta;
         DELETE FROM sync_queue;",
      )
      .map_err(|e| eyre!("Failed to clear local data: {}", e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      Ok(())
    })?;

    debug!("cleared all local data");
    Ok(())
  }

  fn get_cache_meta(&self, table: Table) -> Result<Option<CacheMeta>> {
    self.with_conn(|conn| {
      conn
        .query_row(
          "SELECT last_sync, etag FROM cache_meta WHERE table_name = ?",
          params![table.name()],
          |row| {
            Ok(CacheMeta {
              table,
              last_sync: row.get(0)?,
              etag: row.get(1)?,
            })
          },
        )
        .optional()
        .map_err(|e| eyre!("Failed to read {} cache metadata: {}", table, e))
    })
  }

  fn get_grouped(&self, table: Table, group_key: &str) -> Result<Vec<Record>> {
    if table.group_field().is_none() {
      return Err(eyre!("Table {} has no grouping key", table));
    }

    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT data FROM cache_entries WHERE table_name = ? AND group_key = ?")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      query_records(&mut stmt, params![table.name(), group_key])
    })
  }
}
