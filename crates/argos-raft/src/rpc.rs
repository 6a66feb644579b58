//! Peer-to-peer messages.

use serde::{Deserialize, Serialize};

use crate::types::{LogEntry, NodeId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
  pub term:           u64,
  pub candidate_id:   NodeId,
  pub last_log_index: u64,
  pub last_log_term:  u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
  pub term:         u64,
  pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
  pub term:           u64,
  pub leader_id:      NodeId,
  pub prev_log_index: u64,
  pub prev_log_term:  u64,
  pub entries:        Vec<LogEntry>,
  pub leader_commit:  u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
  pub term:           u64,
  pub success:        bool,
  /// On success, the last index known to match the leader.
  pub match_index:    u64,
  /// On rejection, where the leader should retry from.
  pub conflict_index: u64,
  /// On rejection, the follower's term at `prev_log_index`, if it has one.
  pub conflict_term:  Option<u64>,
}

impl AppendResponse {
  pub(crate) fn accepted(term: u64, match_index: u64) -> Self {
    Self { term, success: true, match_index, conflict_index: 0, conflict_term: None }
  }

  pub(crate) fn rejected(term: u64, conflict_index: u64, conflict_term: Option<u64>) -> Self {
    Self { term, success: false, match_index: 0, conflict_index, conflict_term }
  }
}
