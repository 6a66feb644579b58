use std::time::Duration;

use argos_rules::{priority::PriorityWeights, solver::SoftWeights};
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for transient command failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub initial_ms:   u64,
  pub factor:       f64,
  pub max_ms:       u64,
  /// Total attempts, the first included.
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self { Self { initial_ms: 20, factor: 2.0, max_ms: 1_000, max_attempts: 5 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Upper bound on acquiring one command's whole lock set.
  pub lock_timeout_ms:   u64,
  /// A lease held longer than this is revoked.
  pub lease_ttl_ms:      u64,
  /// Default commit deadline for commands that do not carry one.
  pub commit_timeout_ms: u64,
  /// Events past the last snapshot before a stream is due another one.
  pub snapshot_every:    u64,
  pub retry:             RetryPolicy,
  pub priority:          PriorityWeights,
  pub weights:           SoftWeights,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      lock_timeout_ms:   2_000,
      lease_ttl_ms:      10_000,
      commit_timeout_ms: 5_000,
      snapshot_every:    50,
      retry:             RetryPolicy::default(),
      priority:          PriorityWeights::default(),
      weights:           SoftWeights::default(),
    }
  }
}

impl EngineConfig {
  pub fn lock_timeout(&self) -> Duration { Duration::from_millis(self.lock_timeout_ms) }

  pub fn lease_ttl(&self) -> Duration { Duration::from_millis(self.lease_ttl_ms) }

  pub fn commit_timeout(&self) -> Duration { Duration::from_millis(self.commit_timeout_ms) }
}
