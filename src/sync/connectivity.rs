//! Online/offline signal shared between the app and the sync trigger.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::remote::HttpRemote;

/// Current reachability plus a subscribable transition event.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Subscribers are only woken on an actual change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "connectivity changed");
    }
  }

  /// Watch for transitions.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Keep the signal current by pinging `remote` every `period`.
  pub fn spawn_probe(&self, remote: HttpRemote, period: Duration) -> JoinHandle<()> {
    let connectivity = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      loop {
        ticker.tick().await;
        connectivity.set_online(remote.ping().await);
      }
    })
  }
}
