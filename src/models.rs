//! Typed shapes of the records the application caches most.
//!
//! Unknown fields are kept in `extra` so a typed read never loses data the
//! server sent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{Cacheable, Table};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  pub id: String,
  pub username: String,
  pub display_name: Option<String>,
  pub avatar_url: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
  pub id: String,
  pub author_id: String,
  pub content: String,
  pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: String,
  pub conversation_id: String,
  pub sender_id: String,
  pub content: String,
  pub created_at: Option<String>,
}

/// A card on a pipeline board (e.g. a contact moving through stages)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineItem {
  pub id: String,
  pub pipeline_id: String,
  pub stage: String,
  pub position: i64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Cacheable for Profile {
  fn table() -> Table {
    Table::Profiles
  }

  fn cache_key(&self) -> String {
    self.id.clone()
  }
}

impl Cacheable for Post {
  fn table() -> Table {
    Table::Posts
  }

  fn cache_key(&self) -> String {
    self.id.clone()
  }
}

impl Cacheable for Message {
  fn table() -> Table {
    Table::Messages
  }

  fn cache_key(&self) -> String {
    self.id.clone()
  }
}

impl Cacheable for PipelineItem {
  fn table() -> Table {
    Table::PipelineItems
  }

  fn cache_key(&self) -> String {
    self.id.clone()
  }
}
