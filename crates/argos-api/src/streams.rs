//! Read endpoints. Served from local state without consensus.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/streams/{kind}/{id}` | Replayed state |
//! | `GET`  | `/streams/{kind}/{id}/events` | `?from=` version (default 1), `?limit=` (default 100, max 1000) |

use argos_core::{
  event::Event,
  state::StreamState,
  stream::{EntityKind, StreamId},
};
use argos_engine::Store;
use argos_raft::Transport;
use axum::{
  Json,
  extract::{Path, Query, State},
};
use serde::Deserialize;

use crate::{AppState, error::ApiError};

const MAX_LIMIT: usize = 1000;

fn stream_id(kind: &str, id: String) -> Result<StreamId, ApiError> {
  let kind: EntityKind = kind.parse().map_err(|e: argos_core::Error| ApiError::BadRequest(e.to_string()))?;
  Ok(StreamId::new(kind, id))
}

/// `GET /streams/{kind}/{id}`
pub async fn state<S: Store, T: Transport>(
  State(state): State<AppState<S, T>>,
  Path((kind, id)): Path<(String, String)>,
) -> Result<Json<StreamState>, ApiError> {
  let stream_id = stream_id(&kind, id)?;
  Ok(Json(state.coordinator.query(&stream_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct EventParams {
  #[serde(default)]
  pub from:  Option<u64>,
  #[serde(default)]
  pub limit: Option<usize>,
}

/// `GET /streams/{kind}/{id}/events[?from=n][&limit=n]`
pub async fn events<S: Store, T: Transport>(
  State(state): State<AppState<S, T>>,
  Path((kind, id)): Path<(String, String)>,
  Query(params): Query<EventParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
  let stream_id = stream_id(&kind, id)?;
  let limit = params.limit.unwrap_or(100).clamp(1, MAX_LIMIT);
  let events = state
    .coordinator
    .events(stream_id, params.from.unwrap_or(1), limit)
    .await?;
  Ok(Json(events))
}
