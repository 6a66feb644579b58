//! SQLite backend for the Argos core.
//!
//! One database file holds the event streams, their snapshots and the
//! node's consensus state. Wraps [`tokio_rusqlite`] so all database access
//! runs on a dedicated thread without blocking the async runtime.

mod encode;
mod raft;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
