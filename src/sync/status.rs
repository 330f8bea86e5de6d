//! Fan-out of processor state changes to any number of subscribers.

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use super::queue::SyncOperation;

/// State of the sync processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  #[default]
  Idle,
  Syncing,
  /// The last pass had at least one failed operation
  Error,
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(match self {
      SyncStatus::Idle => "idle",
      SyncStatus::Syncing => "syncing",
      SyncStatus::Error => "error",
    })
  }
}

/// Notification published by the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// The processor changed state; `pending` is the queue length at that moment
  Status { status: SyncStatus, pending: usize },
  /// An operation exhausted its retries and was removed from the queue
  Dropped(SyncOperation),
}

/// Broadcast channel for [`SyncEvent`]s.
///
/// Every subscriber receives every event it has room for; a subscriber that
/// falls more than `capacity` events behind skips the oldest ones.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
  tx: broadcast::Sender<SyncEvent>,
}

impl StatusBroadcaster {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  /// Receive all future events. Dropping the receiver unsubscribes.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  /// Publish to the current subscribers. Having none is fine.
  pub fn publish(&self, event: SyncEvent) {
    let _ = self.tx.send(event);
  }

  #[cfg(test)]
  pub(crate) fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Call `callback(status, pending)` on every status change until the
  /// returned listener is dropped or unsubscribed.
  ///
  /// Must be called from within a tokio runtime.
  pub fn on_sync_status_change<F>(&self, mut callback: F) -> StatusListener
  where
    F: FnMut(SyncStatus, usize) + Send + 'static,
  {
    let mut rx = self.subscribe();
    let handle = tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(SyncEvent::Status { status, pending }) => callback(status, pending),
          Ok(SyncEvent::Dropped(_)) => {}
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "status listener fell behind");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    StatusListener { handle }
  }
}

impl Default for StatusBroadcaster {
  fn default() -> Self {
    Self::new(64)
  }
}

/// Registration returned by [`StatusBroadcaster::on_sync_status_change`].
pub struct StatusListener {
  handle: JoinHandle<()>,
}

impl StatusListener {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for StatusListener {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};
  use std::time::Duration;

  #[tokio::test]
  async fn test_every_subscriber_gets_every_event() {
    let broadcaster = StatusBroadcaster::default();
    let mut a = broadcaster.subscribe();
    let mut b = broadcaster.subscribe();

    broadcaster.publish(SyncEvent::Status {
      status: SyncStatus::Syncing,
      pending: 2,
    });
    broadcaster.publish(SyncEvent::Status {
      status: SyncStatus::Idle,
      pending: 0,
    });

    for rx in [&mut a, &mut b] {
      assert_eq!(
        rx.recv().await.unwrap(),
        SyncEvent::Status {
          status: SyncStatus::Syncing,
          pending: 2
        }
      );
      assert_eq!(
        rx.recv().await.unwrap(),
        SyncEvent::Status {
          status: SyncStatus::Idle,
          pending: 0
        }
      );
    }
  }

  #[tokio::test]
  async fn test_publish_without_subscribers_is_fine() {
    let broadcaster = StatusBroadcaster::default();
    broadcaster.publish(SyncEvent::Status {
      status: SyncStatus::Error,
      pending: 1,
    });
    assert_eq!(broadcaster.subscriber_count(), 0);
  }

  #[tokio::test]
  async fn test_callback_listener_and_unsubscribe() {
    let broadcaster = StatusBroadcaster::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let listener = broadcaster.on_sync_status_change(move |status, pending| {
      sink.lock().unwrap().push((status, pending));
    });
    assert_eq!(broadcaster.subscriber_count(), 1);

    broadcaster.publish(SyncEvent::Status {
      status: SyncStatus::Syncing,
      pending: 1,
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock().unwrap(), vec![(SyncStatus::Syncing, 1)]);

    listener.unsubscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broadcaster.subscriber_count(), 0);

    broadcaster.publish(SyncEvent::Status {
      status: SyncStatus::Idle,
      pending: 0,
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
  }
}
