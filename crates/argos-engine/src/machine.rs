use std::sync::Arc;

use argos_core::{event::Event, store::SnapshotStore, stream::VersionConflict};
use argos_raft::{EntryPayload, LogEntry, StateMachine};
use tracing::debug;

use crate::{
  error::{Error, Result},
  event_log::EventLog,
};

/// Applies committed log entries to the event log.
///
/// A batch whose expected versions no longer hold is rejected the same way
/// on every replica; the rejection is the entry's output, not an apply
/// failure, so the applier moves on.
pub struct EventLogMachine<S> {
  log: Arc<EventLog<S>>,
}

impl<S> EventLogMachine<S> {
  pub fn new(log: Arc<EventLog<S>>) -> Self { Self { log } }
}

impl<S: SnapshotStore + 'static> StateMachine for EventLogMachine<S> {
  type Error = Error;
  type Output = Result<Vec<Event>, VersionConflict>;

  async fn apply(&self, entry: LogEntry) -> Result<Self::Output> {
    let index = entry.index;
    match entry.payload {
      EntryPayload::Noop => Ok(Ok(Vec::new())),
      EntryPayload::Batch(batch) => match self.log.append_batch(batch).await {
        Ok(events) => Ok(Ok(events)),
        Err(Error::VersionConflict(conflict)) => {
          debug!(index, %conflict, "committed batch is stale");
          Ok(Err(conflict))
        }
        Err(err) => Err(err),
      },
    }
  }
}
