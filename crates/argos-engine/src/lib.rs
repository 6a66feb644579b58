//! The Argos command path: event log, lock manager and the coordinator that
//! ties them to the replicated log and the decision rules.
//!
//! ```text
//!   submit ─► read barrier ─► locks (kind, id order) ─► PolicyEngine / ConstraintSolver
//!                                                         │
//!        outcome ◄── EventLog::append_batch ◄── apply ◄── propose (raft)
//! ```

pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_log;
pub mod lock;
pub mod machine;
pub mod retry;
pub mod sweep;

pub use command::{Command, CommandEnvelope, Committed, Outcome};
pub use config::{EngineConfig, RetryPolicy};
pub use coordinator::{CommandCoordinator, Node, Store};
pub use error::{CommandError, Error, Result};
pub use event_log::{EventLog, Subscriber};
pub use lock::{Lease, Leases, LockError, LockManager, LockMode, LockSet};
pub use machine::EventLogMachine;

#[cfg(test)]
mod tests;
