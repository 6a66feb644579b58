//! Leader-based log replication for the Argos core.
//!
//! A [`RaftNode`] holds one replica of the command log. Only the leader
//! accepts proposals; an entry is committed once a majority stores it, and
//! every node then feeds committed entries, in index order, to its
//! [`StateMachine`]. Persistence and networking are behind the
//! [`RaftStorage`] and [`Transport`] traits so the same node runs over SQLite
//! and HTTP in production and over memory in tests.

#![allow(async_fn_in_trait)]

pub mod config;
pub mod error;
pub mod local;
pub mod machine;
pub mod node;
pub mod rpc;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::{RaftConfig, RaftTimings};
pub use error::{RaftError, Result};
pub use local::{LocalNetwork, LocalTransport};
pub use machine::StateMachine;
pub use node::{Applied, RaftNode};
pub use rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
pub use storage::{LogIntegrity, MemoryStorage, RaftStorage};
pub use transport::{Transport, TransportError};
pub use types::{EntryPayload, HardState, LogEntry, LogId, NodeId, NodeStatus, Role};

#[cfg(test)]
mod tests;
