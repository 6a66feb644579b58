use argos_core::event::StreamAppend;
use serde::{Deserialize, Serialize};

pub type NodeId = u64;

/// Position of an entry: index and the term it was created in.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogId {
  pub index: u64,
  pub term:  u64,
}

impl LogId {
  pub fn new(index: u64, term: u64) -> Self { Self { index, term } }

  /// Whether a log ending here is at least as up to date as one ending at
  /// `other`: later last term wins, then the longer log.
  pub fn is_up_to_date_with(&self, other: &LogId) -> bool {
    (self.term, self.index) >= (other.term, other.index)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EntryPayload {
  /// Appended by every new leader so earlier terms can commit.
  Noop,
  /// One command's worth of stream appends, applied atomically.
  Batch(Vec<StreamAppend>),
}

/// A single entry in the replicated log. Indices start at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub index:   u64,
  pub term:    u64,
  pub payload: EntryPayload,
}

impl LogEntry {
  pub fn new(index: u64, term: u64, payload: EntryPayload) -> Self { Self { index, term, payload } }

  pub fn log_id(&self) -> LogId { LogId::new(self.index, self.term) }
}

/// Persisted before answering any RPC that changes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
  pub current_term: u64,
  pub voted_for:    Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Follower,
  Candidate,
  Leader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
  pub node_id:        NodeId,
  pub role:           Role,
  pub term:           u64,
  pub leader:         Option<NodeId>,
  pub commit_index:   u64,
  pub last_applied:   u64,
  pub last_log_index: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn up_to_date_compares_term_before_index() {
    let short_new = LogId::new(3, 5);
    let long_old = LogId::new(10, 4);
    assert!(short_new.is_up_to_date_with(&long_old));
    assert!(!long_old.is_up_to_date_with(&short_new));
    assert!(long_old.is_up_to_date_with(&LogId::new(9, 4)));
    assert!(LogId::default().is_up_to_date_with(&LogId::default()));
  }
}
