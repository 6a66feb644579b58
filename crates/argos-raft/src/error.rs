use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum RaftError {
  #[error("not the leader (leader hint: {leader_hint:?})")]
  NotLeader { leader_hint: Option<NodeId> },

  #[error("deadline elapsed before the entry was applied")]
  Timeout,

  #[error("leadership lost before the entry committed")]
  LeadershipLost,

  #[error("corrupt log at index {index}: {reason}")]
  CorruptLog { index: u64, reason: String },

  #[error("storage error: {0}")]
  Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("node is shut down")]
  Shutdown,
}

impl RaftError {
  pub(crate) fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Storage(Box::new(err))
  }

  /// Worth retrying against this node or the hinted leader.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::NotLeader { .. } | Self::Timeout | Self::LeadershipLost)
  }
}

pub type Result<T, E = RaftError> = std::result::Result<T, E>;
