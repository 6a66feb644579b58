//! Error types for the Argos decision layer.

use thiserror::Error;

use crate::solver::RoomConflict;

#[derive(Debug, Error)]
pub enum Error {
  #[error("section {0} has not been opened")]
  SectionNotOpen(String),

  #[error("no candidate room satisfies the hard constraints ({} checked)", .0.len())]
  Conflict(Vec<RoomConflict>),

  #[error(transparent)]
  InvalidSlot(#[from] argos_core::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
