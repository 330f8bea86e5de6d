pub mod schema;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// SQLite-backed storage for the cache and the sync queue.
///
/// The handle is opened explicitly and shared through an `Arc`. After
/// [`SqliteStorage::close`] every operation fails with a storage error.
pub struct SqliteStorage {
  conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
  /// Open or create the database at `path`
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    debug!(path = %path.display(), "opened storage");

    Self::from_connection(conn)
  }

  /// Open a private in-memory database. Nothing survives the handle.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(Some(conn)),
    })
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("cache.db"))
  }

  /// Close the underlying connection. Safe to call more than once.
  pub fn close(&self) -> Result<()> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(conn) = guard.take() {
      conn
        .close()
        .map_err(|(_, e)| eyre!("Failed to close database: {}", e))?;
      debug!("closed storage");
    }
    Ok(())
  }

  /// Run `f` against the open connection.
  pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let conn = guard.as_mut().ok_or_else(|| eyre!("Storage is closed"))?;
    f(conn)
  }
}

/// Current wall-clock time in milliseconds since epoch.
pub(crate) fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_at_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert!(path.exists());
    storage.close().unwrap();
  }

  #[test]
  fn test_closed_storage_rejects_calls() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.close().unwrap();
    storage.close().unwrap();

    let err = storage.with_conn(|_| Ok(())).unwrap_err();
    assert!(err.to_string().contains("closed"));
  }
}
