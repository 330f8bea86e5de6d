//! In-memory remote used by the sync tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::remote::RemoteApi;
use crate::cache::{record_id, Record, Table};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  Insert(Table, Record),
  Update(Table, String, Record),
  Delete(Table, String),
}

impl Call {
  pub fn record_id(&self) -> Option<String> {
    match self {
      Call::Insert(_, record) => record_id(record),
      Call::Update(_, id, _) | Call::Delete(_, id) => Some(id.clone()),
    }
  }
}

/// Records every call in order; fails on demand.
#[derive(Default)]
pub struct FakeRemote {
  calls: Mutex<Vec<Call>>,
  fail_all: AtomicBool,
  failing_ids: Mutex<HashSet<String>>,
  delay: Mutex<Duration>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_fail_all(&self, fail: bool) {
    self.fail_all.store(fail, Ordering::SeqCst);
  }

  pub fn fail_record(&self, id: &str) {
    self.failing_ids.lock().unwrap().insert(id.to_string());
  }

  /// Make every call take `delay` before answering.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = delay;
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_ids(&self) -> Vec<String> {
    self.calls().iter().filter_map(Call::record_id).collect()
  }

  async fn handle(&self, call: Call) -> Result<()> {
    let delay = *self.delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let id = call.record_id();
    self.calls.lock().unwrap().push(call);

    let fail = self.fail_all.load(Ordering::SeqCst)
      || id.is_some_and(|id| self.failing_ids.lock().unwrap().contains(&id));
    if fail {
      return Err(eyre!("remote unavailable"));
    }
    Ok(())
  }
}

impl RemoteApi for FakeRemote {
  async fn insert(&self, table: Table, record: &Record) -> Result<()> {
    self.handle(Call::Insert(table, record.clone())).await
  }

  async fn update(&self, table: Table, id: &str, fields: &Record) -> Result<()> {
    self
      .handle(Call::Update(table, id.to_string(), fields.clone()))
      .await
  }

  async fn delete(&self, table: Table, id: &str) -> Result<()> {
    self.handle(Call::Delete(table, id.to_string())).await
  }
}
