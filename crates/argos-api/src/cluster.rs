//! Node status and the consensus RPC endpoints.

use argos_engine::Store;
use argos_raft::{AppendRequest, AppendResponse, NodeStatus, Transport, VoteRequest, VoteResponse};
use axum::{
  Json,
  extract::State,
  http::HeaderMap,
};

use crate::{AppState, CLUSTER_TOKEN_HEADER, error::ApiError};

/// `GET /status`
pub async fn status<S: Store, T: Transport>(State(state): State<AppState<S, T>>) -> Json<NodeStatus> {
  Json(state.coordinator.status().await)
}

fn check_token<S: Store, T: Transport>(
  state: &AppState<S, T>,
  headers: &HeaderMap,
) -> Result<(), ApiError> {
  let Some(expected) = &state.cluster_token else { return Ok(()) };
  let presented = headers
    .get(CLUSTER_TOKEN_HEADER)
    .and_then(|v| v.to_str().ok())
    .ok_or(ApiError::Unauthorized)?;
  if presented != expected.as_ref() {
    return Err(ApiError::Forbidden("cluster token mismatch".into()));
  }
  Ok(())
}

/// `POST /raft/vote`
pub async fn vote<S: Store, T: Transport>(
  State(state): State<AppState<S, T>>,
  headers: HeaderMap,
  Json(request): Json<VoteRequest>,
) -> Result<Json<VoteResponse>, ApiError> {
  check_token(&state, &headers)?;
  Ok(Json(state.coordinator.raft().handle_vote(request).await?))
}

/// `POST /raft/append`
pub async fn append<S: Store, T: Transport>(
  State(state): State<AppState<S, T>>,
  headers: HeaderMap,
  Json(request): Json<AppendRequest>,
) -> Result<Json<AppendResponse>, ApiError> {
  check_token(&state, &headers)?;
  Ok(Json(state.coordinator.raft().handle_append(request).await?))
}
