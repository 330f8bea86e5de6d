/// Schema for the cache, cache metadata and sync queue stores.
pub const SCHEMA: &str = r#"
-- Cached server records, one namespace per entity table
CREATE TABLE IF NOT EXISTS cache_entries (
    table_name TEXT NOT NULL,
    id TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    group_key TEXT,
    PRIMARY KEY (table_name, id)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_updated
    ON cache_entries(table_name, updated_at);

CREATE INDEX IF NOT EXISTS idx_cache_entries_group
    ON cache_entries(table_name, group_key);

-- Last bulk refresh per table
CREATE TABLE IF NOT EXISTS cache_meta (
    table_name TEXT PRIMARY KEY,
    last_sync INTEGER NOT NULL,
    etag TEXT
);

-- Pending mutations; AUTOINCREMENT keeps ids monotonic across clears
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL,
    data BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0
);
"#;
