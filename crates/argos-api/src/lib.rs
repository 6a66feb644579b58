//! JSON-over-HTTP adapter for the Argos core.
//!
//! Two routers share one [`AppState`]:
//!
//! - [`api_router`] serves clients. Handlers expect the caller's
//!   [`Principal`] as a request extension, put there by whatever
//!   authentication layer the server mounts in front of it.
//! - [`peer_router`] serves consensus RPCs from other nodes, guarded by the
//!   shared cluster token.
//!
//! [`HttpTransport`] is the client side of the peer routes.
//!
//! # Mounting
//!
//! ```rust,ignore
//! let app = argos_api::api_router(state.clone())
//!   .layer(auth_layer)
//!   .merge(argos_api::peer_router(state));
//! ```

pub mod cluster;
pub mod commands;
pub mod error;
pub mod streams;
pub mod transport;

use std::sync::Arc;

use argos_core::principal::Principal;
use argos_engine::{CommandCoordinator, Store};
use argos_raft::Transport;
use axum::{
  Router,
  extract::FromRequestParts,
  http::request::Parts,
  routing::{get, post},
};

pub use error::ApiError;
pub use transport::HttpTransport;

/// Header carrying the shared secret on peer RPCs.
pub const CLUSTER_TOKEN_HEADER: &str = "x-argos-cluster-token";

// ─── Application state ───────────────────────────────────────────────────────

pub struct AppState<S: Store, T: Transport> {
  pub coordinator:   Arc<CommandCoordinator<S, T>>,
  /// Peer RPCs must present this token when set.
  pub cluster_token: Option<Arc<str>>,
}

impl<S: Store, T: Transport> Clone for AppState<S, T> {
  fn clone(&self) -> Self {
    Self {
      coordinator:   Arc::clone(&self.coordinator),
      cluster_token: self.cluster_token.clone(),
    }
  }
}

impl<S: Store, T: Transport> AppState<S, T> {
  pub fn new(coordinator: Arc<CommandCoordinator<S, T>>, cluster_token: Option<String>) -> Self {
    Self { coordinator, cluster_token: cluster_token.map(Arc::from) }
  }
}

// ─── Caller ──────────────────────────────────────────────────────────────────

/// The authenticated principal of the request.
pub struct Caller(pub Principal);

impl<St: Send + Sync> FromRequestParts<St> for Caller {
  type Rejection = ApiError;

  async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
    parts
      .extensions
      .get::<Principal>()
      .cloned()
      .map(Caller)
      .ok_or(ApiError::Unauthorized)
  }
}

// ─── Routers ─────────────────────────────────────────────────────────────────

/// Client-facing routes.
pub fn api_router<S: Store, T: Transport>(state: AppState<S, T>) -> Router<()> {
  Router::new()
    .route("/commands", post(commands::submit::<S, T>))
    .route("/streams/{kind}/{id}", get(streams::state::<S, T>))
    .route("/streams/{kind}/{id}/events", get(streams::events::<S, T>))
    .route("/status", get(cluster::status::<S, T>))
    .with_state(state)
}

/// Consensus RPCs from peers.
pub fn peer_router<S: Store, T: Transport>(state: AppState<S, T>) -> Router<()> {
  Router::new()
    .route("/raft/vote", post(cluster::vote::<S, T>))
    .route("/raft/append", post(cluster::append::<S, T>))
    .with_state(state)
}
