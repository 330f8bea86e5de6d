mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::info;

use offsync::cache::{CacheLayer, CacheSource, CacheStorage, Record, Table};
use offsync::config::Config;
use offsync::db::SqliteStorage;
use offsync::models::{Message, PipelineItem, Post, Profile};
use offsync::sync::{Connectivity, HttpRemote, OperationKind, QueueStorage, SyncEvent};
use offsync::SyncEngine;

type Engine = SyncEngine<SqliteStorage, HttpRemote>;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first record cache with a replayable mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, queue length and per-table cache freshness
  Status,
  /// List queued operations in replay order
  Queue,
  /// Queue a mutation, e.g. `enqueue posts insert '{"id":"p1","title":"hi"}'`
  Enqueue {
    table: String,
    operation: String,
    /// JSON object with the record fields
    data: String,
  },
  /// Replay the queue once against the remote
  Sync,
  /// Fetch a table (or every table) from the remote into the cache
  Refresh {
    table: Option<String>,
    /// Ignore cache freshness
    #[arg(short, long)]
    force: bool,
  },
  /// Print cached records of a table, newest first
  Show {
    table: String,
    #[arg(short, long)]
    limit: Option<usize>,
    /// Print raw JSON instead of a one-line summary
    #[arg(long)]
    json: bool,
  },
  /// Sync in the background until interrupted
  Watch,
  /// Wipe cached records, cache metadata and the queue
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let db_path = match &config.database {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  let log_dir = config
    .log_dir
    .clone()
    .or_else(|| db_path.parent().map(Path::to_path_buf))
    .unwrap_or_else(|| PathBuf::from("."));
  let _guard = logging::init(&log_dir)?;

  let storage = Arc::new(SqliteStorage::open_at(&db_path)?);
  let remote = HttpRemote::new(&config.remote, Config::get_api_key())?;
  let connectivity = Connectivity::new(remote.ping().await);
  let engine = SyncEngine::new(
    Arc::clone(&storage),
    Arc::new(remote.clone()),
    connectivity,
    config.sync.retry_policy(),
  );

  let result = run(args.command, &engine, &remote, &config).await;
  engine.stop_background_sync();
  storage.close()?;
  result
}

async fn run(command: Command, engine: &Engine, remote: &HttpRemote, config: &Config) -> Result<()> {
  match command {
    Command::Status => status(engine),
    Command::Queue => {
      let ops = engine.storage().get_pending_sync_ops()?;
      if ops.is_empty() {
        println!("queue is empty");
      }
      for op in ops {
        println!(
          "{:>6}  {:<6}  {:<15}  retries={}  {}",
          op.id,
          op.operation,
          op.table,
          op.retries,
          serde_json::to_string(&op.data)?
        );
      }
      Ok(())
    }
    Command::Enqueue {
      table,
      operation,
      data,
    } => {
      let table: Table = table.parse()?;
      let operation: OperationKind = operation.parse()?;
      let data = parse_record(&data)?;
      let id = engine.enqueue(table, operation, data)?;
      println!("queued {} on {} as #{}", operation, table, id);
      Ok(())
    }
    Command::Sync => {
      if !engine.connectivity().is_online() {
        println!("remote unreachable, {} operation(s) left queued", engine.pending_count()?);
        return Ok(());
      }
      let mut events = engine.subscribe();
      let summary = engine.force_sync().await?;
      loop {
        match events.try_recv() {
          Ok(SyncEvent::Dropped(op)) => {
            eprintln!("dropped #{} {} on {} after {} retries", op.id, op.operation, op.table, op.retries)
          }
          Ok(_) | Err(TryRecvError::Lagged(_)) => {}
          Err(_) => break,
        }
      }
      println!(
        "processed {}, failed {}, {} still queued",
        summary.processed,
        summary.failed,
        engine.pending_count()?
      );
      Ok(())
    }
    Command::Refresh { table, force } => {
      let tables = match table {
        Some(name) => vec![name.parse::<Table>()?],
        None => Table::ALL.to_vec(),
      };
      refresh(engine, remote, tables, force).await
    }
    Command::Show { table, limit, json } => {
      let table: Table = table.parse()?;
      for record in engine.storage().get_cached_data(table, limit)? {
        match summarize(table, &record).filter(|_| !json) {
          Some(line) => println!("{}", line),
          None => println!("{}", serde_json::to_string(&record)?),
        }
      }
      Ok(())
    }
    Command::Watch => watch(engine, remote, config).await,
    Command::Clear => {
      engine.logout()?;
      println!("local data cleared");
      Ok(())
    }
  }
}

async fn refresh(engine: &Engine, remote: &HttpRemote, tables: Vec<Table>, force: bool) -> Result<()> {
  use futures::StreamExt;

  let mut layer = CacheLayer::new(Arc::clone(engine.storage()));
  if force {
    layer = layer.with_stale_time(chrono::Duration::zero());
  }

  let results: Vec<_> = futures::stream::iter(tables)
    .map(|table| {
      let layer = layer.clone();
      async move {
        let result = layer.fetch_table(table, || remote.select(table, None)).await;
        (table, result)
      }
    })
    .buffer_unordered(4)
    .collect()
    .await;

  let mut failed = 0;
  for (table, result) in results {
    match result {
      Ok(result) => {
        let source = match result.source {
          CacheSource::Network => "remote",
          CacheSource::CacheFresh => "fresh cache",
          CacheSource::Offline => "cache (offline)",
        };
        println!("{:<15} {} record(s) from {}", table, result.data.len(), source);
      }
      Err(e) => {
        failed += 1;
        eprintln!("{:<15} failed: {}", table, e);
      }
    }
  }

  if failed > 0 {
    return Err(eyre!("Failed to refresh {} table(s)", failed));
  }
  Ok(())
}

fn status(engine: &Engine) -> Result<()> {
  let online = if engine.connectivity().is_online() {
    "online"
  } else {
    "offline"
  };
  println!("{}, {} pending operation(s)", online, engine.pending_count()?);

  for table in Table::ALL {
    let Some(meta) = engine.storage().get_cache_meta(table)? else {
      continue;
    };
    let synced = meta
      .last_sync_at()
      .map(|at| at.to_rfc3339())
      .unwrap_or_else(|| "unknown".to_string());
    println!(
      "  {:<15} synced {}  etag {}",
      table,
      synced,
      meta.etag.as_deref().unwrap_or("-")
    );
  }
  Ok(())
}

async fn watch(engine: &Engine, remote: &HttpRemote, config: &Config) -> Result<()> {
  let probe = engine
    .connectivity()
    .spawn_probe(remote.clone(), config.sync.probe_interval());
  let mut events = engine.subscribe();
  engine.start_background_sync(config.sync.interval());
  info!("watching, interval {:?}", config.sync.interval());
  println!("syncing every {:?}, ctrl-c to stop", config.sync.interval());

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(SyncEvent::Status { status, pending }) => println!("{} ({} pending)", status, pending),
        Ok(SyncEvent::Dropped(op)) => {
          println!("dropped #{} {} on {} after {} retries", op.id, op.operation, op.table, op.retries)
        }
        Err(RecvError::Lagged(skipped)) => println!("missed {} event(s)", skipped),
        Err(RecvError::Closed) => break,
      },
    }
  }

  probe.abort();
  engine.stop_background_sync();
  Ok(())
}

/// One-line rendering for tables with a typed model. Records that do not
/// fit the model fall back to JSON.
fn summarize(table: Table, record: &Record) -> Option<String> {
  fn typed<T: DeserializeOwned>(record: &Record) -> Option<T> {
    serde_json::from_value(serde_json::Value::Object(record.clone())).ok()
  }

  match table {
    Table::Profiles => typed::<Profile>(record).map(|p| match p.display_name {
      Some(name) => format!("{:<12} @{} ({})", p.id, p.username, name),
      None => format!("{:<12} @{}", p.id, p.username),
    }),
    Table::Posts => {
      typed::<Post>(record).map(|p| format!("{:<12} {}: {}", p.id, p.author_id, p.content))
    }
    Table::Messages => typed::<Message>(record).map(|m| {
      format!(
        "{:<12} [{}] {}: {}",
        m.id, m.conversation_id, m.sender_id, m.content
      )
    }),
    Table::PipelineItems => typed::<PipelineItem>(record).map(|i| {
      format!(
        "{:<12} [{}] {} #{}",
        i.id, i.pipeline_id, i.stage, i.position
      )
    }),
    _ => None,
  }
}

fn parse_record(json: &str) -> Result<Record> {
  match serde_json::from_str(json).map_err(|e| eyre!("Failed to parse record JSON: {}", e))? {
    serde_json::Value::Object(record) => Ok(record),
    other => Err(eyre!("Record must be a JSON object, got {}", other)),
  }
}
