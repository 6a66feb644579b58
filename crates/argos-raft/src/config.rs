use std::time::Duration;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Consensus timings as they appear in the server's config file, in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftTimings {
  pub election_timeout_min_ms: u64,
  pub election_timeout_max_ms: u64,
  pub heartbeat_interval_ms:   u64,
  pub tick_interval_ms:        u64,
  pub max_append_entries:      usize,
}

impl Default for RaftTimings {
  fn default() -> Self {
    Self {
      election_timeout_min_ms: 150,
      election_timeout_max_ms: 300,
      heartbeat_interval_ms:   50,
      tick_interval_ms:        10,
      max_append_entries:      64,
    }
  }
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
  pub node_id:              NodeId,
  /// Every other voting member.
  pub peers:                Vec<NodeId>,
  pub election_timeout_min: Duration,
  pub election_timeout_max: Duration,
  pub heartbeat_interval:   Duration,
  pub tick_interval:        Duration,
  pub max_append_entries:   usize,
}

impl RaftConfig {
  pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
    Self::with_timings(node_id, peers, &RaftTimings::default())
  }

  pub fn with_timings(node_id: NodeId, peers: Vec<NodeId>, timings: &RaftTimings) -> Self {
    let min = timings.election_timeout_min_ms.max(1);
    let max = timings.election_timeout_max_ms.max(min + 1);
    Self {
      node_id,
      peers: peers.into_iter().filter(|p| *p != node_id).collect(),
      election_timeout_min: Duration::from_millis(min),
      election_timeout_max: Duration::from_millis(max),
      heartbeat_interval: Duration::from_millis(timings.heartbeat_interval_ms.max(1)),
      tick_interval: Duration::from_millis(timings.tick_interval_ms.max(1)),
      max_append_entries: timings.max_append_entries.max(1),
    }
  }

  /// Votes needed to win, counting our own.
  pub fn quorum(&self) -> usize { (self.peers.len() + 1) / 2 + 1 }

  /// A fresh timeout in `[min, max)`.
  pub fn random_election_timeout(&self) -> Duration {
    let min = self.election_timeout_min.as_millis() as u64;
    let span = (self.election_timeout_max.as_millis() as u64).saturating_sub(min).max(1);
    Duration::from_millis(min + OsRng.next_u64() % span)
  }
}
