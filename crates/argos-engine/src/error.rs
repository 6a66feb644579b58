//! Error types for `argos-engine`.

use argos_core::{
  store::StoreError,
  stream::{StreamId, VersionConflict},
};
use argos_raft::{NodeId, RaftError};
use argos_rules::RoomConflict;
use thiserror::Error;

use crate::lock::LockError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the event log and its state machine.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  VersionConflict(#[from] VersionConflict),

  #[error(transparent)]
  Core(#[from] argos_core::Error),

  #[error("store error: {0}")]
  Store(#[source] BoxError),
}

impl Error {
  /// Keep a version conflict recognisable; box anything else.
  pub fn store<E: StoreError>(err: E) -> Self {
    match err.version_conflict() {
      Some(conflict) => Self::VersionConflict(conflict.clone()),
      None => Self::Store(Box::new(err)),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a submitted command can end in besides success.
#[derive(Debug, Error)]
pub enum CommandError {
  /// The stream moved on between decision and commit.
  #[error(transparent)]
  VersionConflict(#[from] VersionConflict),

  #[error(transparent)]
  LockTimeout(#[from] LockError),

  #[error("rejected by {policy}: {reason}")]
  PolicyRejected { policy: String, reason: String },

  #[error("no room satisfies the hard constraints")]
  Conflict(Vec<RoomConflict>),

  /// No commit was possible; nothing was written.
  #[error("unavailable: {reason}")]
  Unavailable { reason: String, leader_hint: Option<NodeId> },

  #[error("corrupt log at index {index}: {reason}")]
  CorruptLog { index: u64, reason: String },

  #[error("{0} not found")]
  NotFound(StreamId),

  #[error("invalid command: {0}")]
  Invalid(String),

  #[error("internal error: {0}")]
  Internal(#[source] BoxError),
}

impl CommandError {
  pub fn invalid(reason: impl Into<String>) -> Self { Self::Invalid(reason.into()) }

  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::VersionConflict(_) | Self::LockTimeout(_) | Self::Unavailable { .. })
  }

  /// Another node leads; retrying here cannot help.
  pub fn is_redirect(&self) -> bool {
    matches!(self, Self::Unavailable { leader_hint: Some(_), .. })
  }
}

impl From<Error> for CommandError {
  fn from(err: Error) -> Self {
    match err {
      Error::VersionConflict(conflict) => Self::VersionConflict(conflict),
      other => Self::Internal(Box::new(other)),
    }
  }
}

impl From<RaftError> for CommandError {
  fn from(err: RaftError) -> Self {
    match err {
      RaftError::NotLeader { leader_hint } => {
        Self::Unavailable { reason: "this node is not the leader".into(), leader_hint }
      }
      RaftError::Timeout => {
        Self::Unavailable { reason: "commit deadline elapsed".into(), leader_hint: None }
      }
      RaftError::LeadershipLost => {
        Self::Unavailable { reason: "leadership changed before commit".into(), leader_hint: None }
      }
      RaftError::Shutdown => {
        Self::Unavailable { reason: "node is shutting down".into(), leader_hint: None }
      }
      RaftError::CorruptLog { index, reason } => Self::CorruptLog { index, reason },
      RaftError::Storage(source) => Self::Internal(source),
    }
  }
}

impl From<argos_rules::Error> for CommandError {
  fn from(err: argos_rules::Error) -> Self {
    match err {
      argos_rules::Error::SectionNotOpen(id) => Self::NotFound(StreamId::section(id)),
      argos_rules::Error::Conflict(conflicts) => Self::Conflict(conflicts),
      argos_rules::Error::InvalidSlot(err) => Self::Invalid(err.to_string()),
    }
  }
}
