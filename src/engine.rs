//! Single entry point tying storage, processor and trigger together.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::cache::{CacheStorage, Record, Table};
use crate::sync::{
  Connectivity, OperationKind, QueueStorage, RemoteApi, RetryPolicy, StatusListener,
  SyncEvent, SyncProcessor, SyncStatus, SyncSummary, SyncTrigger,
};

pub struct SyncEngine<S, R> {
  storage: Arc<S>,
  processor: Arc<SyncProcessor<S, R>>,
  trigger: SyncTrigger<S, R>,
  connectivity: Connectivity,
}

impl<S, R> SyncEngine<S, R>
where
  S: CacheStorage + QueueStorage + 'static,
  R: RemoteApi + 'static,
{
  pub fn new(storage: Arc<S>, remote: Arc<R>, connectivity: Connectivity, policy: RetryPolicy) -> Self {
    let processor = Arc::new(SyncProcessor::new(Arc::clone(&storage), remote, policy));
    let trigger = SyncTrigger::new(Arc::clone(&processor), connectivity.clone());
    Self {
      storage,
      processor,
      trigger,
      connectivity,
    }
  }

  /// Cache and queue storage, for reads and optimistic writes.
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Queue a mutation for the next pass.
  pub fn enqueue(&self, table: Table, operation: OperationKind, data: Record) -> Result<i64> {
    self.storage.add_to_sync_queue(table, operation, data)
  }

  pub fn sync_status(&self) -> SyncStatus {
    self.processor.status()
  }

  pub fn has_pending_ops(&self) -> Result<bool> {
    self.processor.has_pending_ops()
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.storage.get_pending_sync_count()
  }

  /// Status changes and dropped operations.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.processor.broadcaster().subscribe()
  }

  pub fn on_sync_status_change<F>(&self, callback: F) -> StatusListener
  where
    F: FnMut(SyncStatus, usize) + Send + 'static,
  {
    self.processor.broadcaster().on_sync_status_change(callback)
  }

  pub async fn force_sync(&self) -> Result<SyncSummary> {
    self.trigger.force_sync().await
  }

  pub fn start_background_sync(&self, interval: Duration) -> bool {
    self.trigger.start_background_sync(interval)
  }

  pub fn stop_background_sync(&self) {
    self.trigger.stop_background_sync()
  }

  /// Stop syncing and wipe every cached record, all metadata and the queue.
  pub fn logout(&self) -> Result<()> {
    self.trigger.stop_background_sync();
    self.storage.clear_all_data()?;
    info!("local data cleared on logout");
    Ok(())
  }
}
