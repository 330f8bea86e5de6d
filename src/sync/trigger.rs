//! Decides when to run the sync processor.

use color_eyre::Result;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::sync::watch;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::connectivity::Connectivity;
use super::processor::{SyncProcessor, SyncSummary};
use super::queue::QueueStorage;
use super::remote::RemoteApi;

/// Runs drain passes on a timer and whenever connectivity comes back.
pub struct SyncTrigger<S, R> {
  processor: Arc<SyncProcessor<S, R>>,
  connectivity: Connectivity,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl<S, R> SyncTrigger<S, R>
where
  S: QueueStorage + 'static,
  R: RemoteApi + 'static,
{
  pub fn new(processor: Arc<SyncProcessor<S, R>>, connectivity: Connectivity) -> Self {
    Self {
      processor,
      connectivity,
      task: Mutex::new(None),
    }
  }

  #[cfg(test)]
  pub(crate) fn is_running(&self) -> bool {
    self
      .task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .is_some_and(|task| !task.is_finished())
  }

  /// Start the timer and the connectivity subscription.
  ///
  /// The first tick fires one `interval` after start. Returns `false` and
  /// does nothing if already running. Must be called from within a tokio
  /// runtime.
  pub fn start_background_sync(&self, interval: Duration) -> bool {
    let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
    if task.as_ref().is_some_and(|t| !t.is_finished()) {
      debug!("background sync already running");
      return false;
    }

    // Subscribe, take the baseline and arm the timer before spawning, so a
    // transition landing before the task's first poll still counts as an edge
    let mut online_rx = self.connectivity.subscribe();
    let was_online = *online_rx.borrow_and_update();
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let processor = Arc::clone(&self.processor);
    let connectivity = self.connectivity.clone();
    *task = Some(tokio::spawn(run_loop(
      processor,
      connectivity,
      ticker,
      online_rx,
      was_online,
    )));
    info!(?interval, "background sync started");
    true
  }

  /// Stop the timer and the subscription. A pass already running finishes.
  pub fn stop_background_sync(&self) {
    let task = self
      .task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(task) = task {
      task.abort();
      info!("background sync stopped");
    }
  }

  /// Sync right now if online; offline is a zero summary, not an error.
  pub async fn force_sync(&self) -> Result<SyncSummary> {
    if !self.connectivity.is_online() {
      debug!("offline, skipping forced sync");
      return Ok(SyncSummary::default());
    }
    self.processor.process_sync_queue().await
  }
}

impl<S, R> Drop for SyncTrigger<S, R> {
  fn drop(&mut self) {
    if let Some(task) = self
      .task
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      task.abort();
    }
  }
}

async fn run_loop<S, R>(
  processor: Arc<SyncProcessor<S, R>>,
  connectivity: Connectivity,
  mut ticker: Interval,
  mut online_rx: watch::Receiver<bool>,
  mut was_online: bool,
) where
  S: QueueStorage + 'static,
  R: RemoteApi + 'static,
{
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        if connectivity.is_online() {
          spawn_pass(&processor, "timer");
        }
      }
      changed = online_rx.changed() => {
        if changed.is_err() {
          break;
        }
        // watch keeps only the latest value: an online/offline/online flap
        // between two polls reads as online/online and triggers nothing
        let online = *online_rx.borrow_and_update();
        if online && !was_online {
          spawn_pass(&processor, "back online");
        }
        was_online = online;
      }
    }
  }
}

/// Run a pass on its own task so stopping the loop never cuts it short.
fn spawn_pass<S, R>(processor: &Arc<SyncProcessor<S, R>>, reason: &'static str)
where
  S: QueueStorage + 'static,
  R: RemoteApi + 'static,
{
  let processor = Arc::clone(processor);
  tokio::spawn(async move {
    debug!(reason, "triggering sync pass");
    if let Err(e) = processor.process_sync_queue().await {
      warn!(reason, error = %e, "background sync pass failed");
    }
  });
}
