//! `POST /commands`: the only write endpoint.
//!
//! Body: `{"command": {"type": "enroll", ...}, "correlation_id"?: uuid, "deadline_ms"?: n}`.
//! Returns the committed outcome with its log index.

use std::time::Duration;

use argos_engine::{Command, CommandEnvelope, Committed, Store};
use argos_raft::Transport;
use axum::{Json, extract::State};
use serde::Deserialize;
use uuid::Uuid;

use crate::{AppState, Caller, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct CommandBody {
  pub command:        Command,
  pub correlation_id: Option<Uuid>,
  /// Overrides the configured commit timeout.
  pub deadline_ms:    Option<u64>,
}

pub async fn submit<S: Store, T: Transport>(
  State(state): State<AppState<S, T>>,
  Caller(principal): Caller,
  Json(body): Json<CommandBody>,
) -> Result<Json<Committed>, ApiError> {
  let required = body.command.required_capability();
  if !principal.can(required) {
    return Err(ApiError::Forbidden(format!(
      "{} requires the {required:?} capability",
      body.command.name()
    )));
  }

  let timeout = body
    .deadline_ms
    .map(Duration::from_millis)
    .unwrap_or_else(|| state.coordinator.config().commit_timeout());
  let mut envelope = CommandEnvelope::new(principal, body.command, timeout);
  if let Some(correlation_id) = body.correlation_id {
    envelope = envelope.correlated(correlation_id);
  }

  Ok(Json(state.coordinator.submit(envelope).await?))
}
