//! Error type for `argos-store-sqlite`.

use argos_core::{store::StoreError, stream::VersionConflict};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] argos_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error(transparent)]
  VersionConflict(#[from] VersionConflict),
}

impl StoreError for Error {
  fn version_conflict(&self) -> Option<&VersionConflict> {
    match self {
      Self::VersionConflict(conflict) => Some(conflict),
      Self::Core(argos_core::Error::VersionConflict(conflict)) => Some(conflict),
      _ => None,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
