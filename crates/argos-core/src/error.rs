//! Error types for `argos-core`.

use thiserror::Error;

use crate::stream::{StreamId, VersionConflict};

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  VersionConflict(#[from] VersionConflict),

  #[error("stream {stream_id} is corrupt: expected version {expected}, found {found}")]
  VersionGap {
    stream_id: StreamId,
    expected:  u64,
    found:     u64,
  },

  #[error("invalid stream id: {0:?}")]
  InvalidStreamId(String),

  #[error("unknown entity kind: {0:?}")]
  UnknownEntityKind(String),

  #[error("invalid time slot: {0}")]
  InvalidTimeSlot(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
