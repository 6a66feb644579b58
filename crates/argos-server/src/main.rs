//! argosd server binary.
//!
//! Reads `argos.toml` (or the path specified with `--config`), opens the
//! node's SQLite store, joins the cluster described by `peers` and serves
//! the client and peer routes over HTTP.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for `auth_password_hash` in argos.toml:
//!
//! ```
//! cargo run -p argos-server --bin argosd -- --hash-password
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use argos_api::{AppState, HttpTransport};
use argos_engine::CommandCoordinator;
use argos_raft::RaftConfig;
use argos_server::ServerConfig;
use argos_store_sqlite::SqliteStore;
use clap::Parser;
use rand_core::OsRng;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Argos transactional core node")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "argos.toml")]
  config: PathBuf,

  /// Print the argon2 hash for a password entered on stdin and exit.
  #[arg(long)]
  hash_password: bool,

  /// Discard the local consensus log and re-replicate from the leader.
  #[arg(long)]
  resync: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Helper mode: hash a password and exit.
  if cli.hash_password {
    let password = rpassword_or_stdin()?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
      .to_string();
    println!("{hash}");
    return Ok(());
  }

  let server_cfg = ServerConfig::load(&cli.config).context("failed to load ServerConfig")?;

  // Expand `~` in store path.
  let store_path = expand_tilde(&server_cfg.store_path);

  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  // Peer RPCs must finish well inside an election timeout.
  let rpc_timeout = Duration::from_millis(server_cfg.raft.election_timeout_min_ms.max(50));
  let transport = HttpTransport::new(
    server_cfg.peer_urls(),
    server_cfg.cluster_token.clone(),
    rpc_timeout,
  )
  .context("failed to build peer transport")?;

  let raft_cfg = RaftConfig::with_timings(server_cfg.node_id, server_cfg.members(), &server_cfg.raft);
  let coordinator = CommandCoordinator::start(
    server_cfg.engine.clone(),
    raft_cfg,
    store,
    transport,
    cli.resync,
  )
  .await
  .context("failed to start node")?;
  let coordinator = Arc::new(coordinator);

  let sweeps = argos_server::spawn_sweeps(Arc::clone(&coordinator), server_cfg.sweep_interval());

  let state = AppState::new(Arc::clone(&coordinator), server_cfg.cluster_token.clone());
  let app = argos_server::router(state, Arc::new(server_cfg.auth()));
  let address = server_cfg.address();

  tracing::info!(node = server_cfg.node_id, "Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  sweeps.abort();
  coordinator.shutdown().await;
  tracing::info!("node stopped");

  Ok(())
}

async fn shutdown_signal() {
  if let Err(err) = tokio::signal::ctrl_c().await {
    tracing::error!(error = %err, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
}

/// Read a password from stdin (no echo).
fn rpassword_or_stdin() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  Ok(
    line
      .trim_end_matches('\n')
      .trim_end_matches('\r')
      .to_string(),
  )
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
