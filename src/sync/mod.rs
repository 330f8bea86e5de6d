//! Offline mutation queue and the machinery that replays it.

mod connectivity;
mod processor;
mod queue;
mod remote;
mod status;
mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use connectivity::Connectivity;
pub use processor::{RetryPolicy, SyncProcessor, SyncSummary};
pub use queue::{OperationKind, QueueStorage, SyncOperation};
pub use remote::{HttpRemote, RemoteApi};
pub use status::{StatusBroadcaster, StatusListener, SyncEvent, SyncStatus};
pub use trigger::SyncTrigger;
