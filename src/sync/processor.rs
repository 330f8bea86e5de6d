//! Drains the sync queue against the remote API.
//!
//! One pass takes a snapshot of the queue and replays it in enqueue order,
//! one operation at a time:
//!
//! - an operation that already failed `r` times waits `base_delay * 2^(r-1)`
//!   before its next attempt
//! - a success removes the operation
//! - a failure bumps its retry count, or removes it for good once the
//!   attempt count reaches `max_retries`
//!
//! A failed operation never stops the pass; only failing to read the queue
//! does. Operations enqueued while a pass runs wait for the next one.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::queue::{OperationKind, QueueStorage, SyncOperation};
use super::remote::RemoteApi;
use super::status::{StatusBroadcaster, SyncEvent, SyncStatus};

/// Retry ceiling and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Failed attempts after which an operation is dropped
  pub max_retries: u32,
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_delay: Duration::from_millis(1000),
    }
  }
}

impl RetryPolicy {
  /// Delay before attempting an operation that has failed `retries` times.
  pub fn backoff(&self, retries: u32) -> Duration {
    if retries == 0 {
      return Duration::ZERO;
    }
    let factor = 2u32.checked_pow(retries - 1).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor)
  }
}

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
  pub processed: usize,
  pub failed: usize,
}

pub struct SyncProcessor<S, R> {
  storage: Arc<S>,
  remote: Arc<R>,
  policy: RetryPolicy,
  status: Mutex<SyncStatus>,
  broadcaster: StatusBroadcaster,
}

impl<S: QueueStorage, R: RemoteApi> SyncProcessor<S, R> {
  pub fn new(storage: Arc<S>, remote: Arc<R>, policy: RetryPolicy) -> Self {
    Self {
      storage,
      remote,
      policy,
      status: Mutex::new(SyncStatus::Idle),
      broadcaster: StatusBroadcaster::default(),
    }
  }

  pub fn status(&self) -> SyncStatus {
    *self.status.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn broadcaster(&self) -> &StatusBroadcaster {
    &self.broadcaster
  }

  pub fn has_pending_ops(&self) -> Result<bool> {
    Ok(self.storage.get_pending_sync_count()? > 0)
  }

  /// Run one drain pass.
  ///
  /// Returns a zero summary without doing anything if a pass is already
  /// running. Failing to read the queue ends the pass early and is returned.
  /// A pass whose future is dropped part way ends in `Error`.
  pub async fn process_sync_queue(&self) -> Result<SyncSummary> {
    let Some(pass) = PassGuard::begin(self) else {
      debug!("sync pass already running");
      return Ok(SyncSummary::default());
    };
    self.notify(SyncStatus::Syncing);

    let result = self.drain().await;

    let status = match &result {
      Ok(summary) if summary.failed == 0 => SyncStatus::Idle,
      _ => SyncStatus::Error,
    };
    pass.finish(status);

    match &result {
      Ok(summary) => info!(processed = summary.processed, failed = summary.failed, "sync pass finished"),
      Err(e) => error!(error = %e, "sync pass aborted"),
    }
    result
  }

  fn set_status(&self, status: SyncStatus) {
    *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
  }

  fn notify(&self, status: SyncStatus) {
    let pending = self.storage.get_pending_sync_count().unwrap_or_else(|e| {
      warn!(error = %e, "could not count pending operations");
      0
    });
    self
      .broadcaster
      .publish(SyncEvent::Status { status, pending });
  }

  async fn drain(&self) -> Result<SyncSummary> {
    let ops = self.storage.get_pending_sync_ops()?;
    let mut summary = SyncSummary::default();
    if !ops.is_empty() {
      debug!(count = ops.len(), "draining sync queue");
    }

    for op in ops {
      let delay = self.policy.backoff(op.retries);
      if !delay.is_zero() {
        debug!(id = op.id, retries = op.retries, ?delay, "backing off");
        tokio::time::sleep(delay).await;
      }

      match self.dispatch(&op).await {
        Ok(()) => match self.storage.remove_sync_op(op.id) {
          Ok(()) => summary.processed += 1,
          Err(e) => {
            // Still queued, so the next pass sends it again
            summary.failed += 1;
            error!(id = op.id, table = %op.table, error = %e, "could not dequeue applied operation");
          }
        },
        Err(e) => {
          summary.failed += 1;
          let attempts = op.retries + 1;
          if attempts >= self.policy.max_retries {
            error!(
              id = op.id,
              table = %op.table,
              operation = %op.operation,
              attempts,
              error = %e,
              "dropping sync operation after final retry"
            );
            match self.storage.remove_sync_op(op.id) {
              Ok(()) => self.broadcaster.publish(SyncEvent::Dropped(op)),
              Err(e) => error!(id = op.id, error = %e, "could not drop sync operation"),
            }
          } else {
            warn!(
              id = op.id,
              table = %op.table,
              operation = %op.operation,
              attempts,
              error = %e,
              "sync operation failed"
            );
            if let Err(e) = self.storage.increment_sync_retry(op.id) {
              error!(id = op.id, error = %e, "could not record sync retry");
            }
          }
        }
      }
    }

    Ok(summary)
  }

  async fn dispatch(&self, op: &SyncOperation) -> Result<()> {
    match op.operation {
      OperationKind::Insert => self.remote.insert(op.table, &op.data).await,
      OperationKind::Update => {
        let id = op
          .record_id()
          .ok_or_else(|| eyre!("Update on {} has no record id", op.table))?;
        let mut fields = op.data.clone();
        fields.remove("id");
        self.remote.update(op.table, &id, &fields).await
      }
      OperationKind::Delete => {
        let id = op
          .record_id()
          .ok_or_else(|| eyre!("Delete on {} has no record id", op.table))?;
        self.remote.delete(op.table, &id).await
      }
    }
  }
}

/// Holds `Syncing` for the length of one pass.
///
/// Dropped without [`PassGuard::finish`] (the pass future was cancelled), it
/// moves the processor to `Error` so later passes are not locked out.
struct PassGuard<'a, S: QueueStorage, R: RemoteApi> {
  processor: &'a SyncProcessor<S, R>,
  finished: bool,
}

impl<'a, S: QueueStorage, R: RemoteApi> PassGuard<'a, S, R> {
  /// Enter `Syncing` unless already there.
  fn begin(processor: &'a SyncProcessor<S, R>) -> Option<Self> {
    let mut status = processor
      .status
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if *status == SyncStatus::Syncing {
      return None;
    }
    *status = SyncStatus::Syncing;
    Some(Self {
      processor,
      finished: false,
    })
  }

  fn finish(mut self, status: SyncStatus) {
    self.finished = true;
    self.processor.set_status(status);
    self.processor.notify(status);
  }
}

impl<S: QueueStorage, R: RemoteApi> Drop for PassGuard<'_, S, R> {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    warn!("sync pass cancelled");
    self.processor.set_status(SyncStatus::Error);
    self.processor.notify(SyncStatus::Error);
  }
}
