//! API error type and [`axum::response::IntoResponse`] implementation.

use argos_engine::CommandError;
use argos_raft::RaftError;
use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("authentication required")]
  Unauthorized,

  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error(transparent)]
  Command(#[from] CommandError),

  #[error(transparent)]
  Raft(#[from] RaftError),
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      Self::Unauthorized => StatusCode::UNAUTHORIZED,
      Self::Forbidden(_) => StatusCode::FORBIDDEN,
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Command(err) => match err {
        CommandError::Invalid(_) => StatusCode::BAD_REQUEST,
        CommandError::NotFound(_) => StatusCode::NOT_FOUND,
        CommandError::VersionConflict(_) | CommandError::Conflict(_) => StatusCode::CONFLICT,
        CommandError::PolicyRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CommandError::LockTimeout(_) | CommandError::Unavailable { .. } => {
          StatusCode::SERVICE_UNAVAILABLE
        }
        CommandError::CorruptLog { .. } | CommandError::Internal(_) => {
          StatusCode::INTERNAL_SERVER_ERROR
        }
      },
      Self::Raft(err) => match err {
        RaftError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
      },
    }
  }

  fn body(&self) -> Value {
    let mut body = json!({ "error": self.to_string() });
    if let Self::Command(err) = self {
      match err {
        CommandError::PolicyRejected { policy, reason } => {
          body["policy"] = json!(policy);
          body["reason"] = json!(reason);
        }
        CommandError::Conflict(conflicts) => body["conflicts"] = json!(conflicts),
        CommandError::Unavailable { leader_hint, .. } => body["leader_hint"] = json!(leader_hint),
        _ => {}
      }
    }
    body
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      tracing::warn!(%status, error = %self, "request failed");
    }
    (status, Json(self.body())).into_response()
  }
}
