//! Offline-first record cache and mutation sync engine.
//!
//! Reads are served from a durable per-table cache. Writes made while
//! offline are queued and replayed against the remote API in enqueue order
//! once connectivity returns, with exponential backoff and a retry ceiling.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod sync;

pub use engine::SyncEngine;
