//! The closed set of cacheable entity tables.

use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An entity table known to the cache and the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
  Profiles,
  Posts,
  Comments,
  Conversations,
  Messages,
  Notifications,
  Pipelines,
  PipelineItems,
}

impl Table {
  /// Every table, in schema order. Used when wiping all cached data.
  pub const ALL: [Table; 8] = [
    Table::Profiles,
    Table::Posts,
    Table::Comments,
    Table::Conversations,
    Table::Messages,
    Table::Notifications,
    Table::Pipelines,
    Table::PipelineItems,
  ];

  /// Name used both in local storage and on the remote API.
  pub fn name(self) -> &'static str {
    match self {
      Table::Profiles => "profiles",
      Table::Posts => "posts",
      Table::Comments => "comments",
      Table::Conversations => "conversations",
      Table::Messages => "messages",
      Table::Notifications => "notifications",
      Table::Pipelines => "pipelines",
      Table::PipelineItems => "pipeline_items",
    }
  }

  /// Record field that groups entries under a parent, for tables that
  /// support "all entries belonging to X" lookups.
  pub fn group_field(self) -> Option<&'static str> {
    match self {
      Table::Messages => Some("conversation_id"),
      Table::PipelineItems => Some("pipeline_id"),
      _ => None,
    }
  }
}

impl fmt::Display for Table {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.name())
  }
}

impl FromStr for Table {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Table::ALL
      .into_iter()
      .find(|t| t.name() == s)
      .ok_or_else(|| eyre!("Unknown table: {}", s))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_name_parses_back() {
    for table in Table::ALL {
      assert_eq!(table.name().parse::<Table>().unwrap(), table);
    }
  }

  #[test]
  fn test_unknown_table_is_rejected() {
    assert!("pipeline-items".parse::<Table>().is_err());
  }

  #[test]
  fn test_only_grouped_tables_have_group_field() {
    let grouped: Vec<_> = Table::ALL
      .into_iter()
      .filter(|t| t.group_field().is_some())
      .collect();
    assert_eq!(grouped, vec![Table::Messages, Table::PipelineItems]);
  }
}
