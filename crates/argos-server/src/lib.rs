//! Wiring for the `argosd` binary: configuration, authentication, the
//! combined router and the background sweep driver.

pub mod auth;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use argos_api::AppState;
use argos_core::principal::Capability;
use argos_engine::{
  CommandCoordinator, EngineConfig, Store,
  sweep::{promotion_sweep, snapshot_sweep},
};
use argos_raft::{NodeId, RaftTimings, Transport};
use axum::{Router, middleware};
use config::{ConfigError, Environment, Source};
use serde::Deserialize;
use tokio::{
  task::JoinHandle,
  time::{MissedTickBehavior, interval},
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use auth::{AuthConfig, require_auth};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Another voting member of the cluster.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PeerConfig {
  pub id:  NodeId,
  /// Base URL of the peer's HTTP listener, e.g. `http://10.0.0.2:7070`.
  pub url: String,
}

/// Runtime server configuration, deserialised from `argos.toml` and
/// `ARGOS_`-prefixed environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:                String,
  #[serde(default = "default_port")]
  pub port:                u16,
  #[serde(default = "default_node_id")]
  pub node_id:             NodeId,
  /// Empty for a single-node cluster.
  #[serde(default)]
  pub peers:               Vec<PeerConfig>,
  pub store_path:          PathBuf,
  /// Shared secret peers present on consensus RPCs.
  #[serde(default)]
  pub cluster_token:       Option<String>,
  pub auth_username:       String,
  pub auth_password_hash:  String,
  #[serde(default = "default_capabilities")]
  pub auth_capabilities:   Vec<Capability>,
  #[serde(default = "default_sweep_interval")]
  pub sweep_interval_secs: u64,
  #[serde(default)]
  pub raft:                RaftTimings,
  #[serde(default)]
  pub engine:              EngineConfig,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 7070 }
fn default_node_id() -> NodeId { 1 }
fn default_capabilities() -> Vec<Capability> { Capability::ALL.to_vec() }
fn default_sweep_interval() -> u64 { 30 }

impl ServerConfig {
  /// Layer the TOML file at `path` (optional) under the environment.
  pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    Self::from_source(config::File::from(path.into()).required(false))
  }

  /// Nested keys use a double underscore, e.g. `ARGOS_ENGINE__LOCK_TIMEOUT_MS`.
  pub fn from_source(file: impl Source + Send + Sync + 'static) -> Result<Self, ConfigError> {
    config::Config::builder()
      .add_source(file)
      .add_source(
        Environment::with_prefix("ARGOS")
          .prefix_separator("_")
          .separator("__"),
      )
      .build()?
      .try_deserialize()
  }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

  /// Every voting member, this node included.
  pub fn members(&self) -> Vec<NodeId> {
    let mut members: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
    members.push(self.node_id);
    members.sort_unstable();
    members.dedup();
    members
  }

  pub fn peer_urls(&self) -> BTreeMap<NodeId, String> {
    self
      .peers
      .iter()
      .filter(|p| p.id != self.node_id)
      .map(|p| (p.id, p.url.clone()))
      .collect()
  }

  pub fn sweep_interval(&self) -> Duration { Duration::from_secs(self.sweep_interval_secs.max(1)) }

  pub fn auth(&self) -> AuthConfig {
    AuthConfig {
      username:      self.auth_username.clone(),
      password_hash: self.auth_password_hash.clone(),
      capabilities:  self.auth_capabilities.clone(),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Client routes behind Basic auth, peer routes behind the cluster token,
/// both traced.
pub fn router<S: Store, T: Transport>(state: AppState<S, T>, auth: Arc<AuthConfig>) -> Router {
  argos_api::api_router(state.clone())
    .layer(middleware::from_fn_with_state(auth, require_auth))
    .merge(argos_api::peer_router(state))
    .layer(TraceLayer::new_for_http())
}

// ─── Sweeps ───────────────────────────────────────────────────────────────────

/// Run the snapshot and promotion sweeps every `every` until aborted.
pub fn spawn_sweeps<S: Store, T: Transport>(
  coordinator: Arc<CommandCoordinator<S, T>>,
  every: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      ticker.tick().await;
      snapshot_sweep(coordinator.log()).await;
      let timeout = coordinator.config().commit_timeout();
      if let Err(err) = promotion_sweep(&coordinator, timeout).await {
        warn!(error = %err, "promotion sweep failed");
      }
    }
  })
}
