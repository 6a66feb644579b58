//! Background jobs. They are scheduled by whoever hosts the engine and go
//! through the same paths as foreground work.

use std::time::Duration;

use argos_core::{
  principal::Principal,
  store::SnapshotStore,
  stream::{EntityKind, StreamId},
};
use argos_raft::{Role, Transport};
use tracing::{debug, warn};

use crate::{
  command::{Command, CommandEnvelope, Outcome},
  coordinator::{CommandCoordinator, Store},
  error::CommandError,
  event_log::EventLog,
};

/// Snapshot every stream the log has marked eligible. Returns how many
/// snapshots were written. A stream that fails stays eligible for the next
/// sweep.
pub async fn snapshot_sweep<S: SnapshotStore + 'static>(log: &EventLog<S>) -> usize {
  let mut written = 0;
  for stream_id in log.take_snapshot_candidates() {
    match log.snapshot(&stream_id).await {
      Ok(true) => written += 1,
      Ok(false) => {}
      Err(err) => {
        warn!(stream = %stream_id, %err, "snapshot failed");
        log.mark_for_snapshot(stream_id);
      }
    }
  }
  if written > 0 {
    debug!(written, "snapshot sweep");
  }
  written
}

/// On the leader, submit `PromoteWaitlist` for every section with a free
/// seat and a non-empty waitlist. Returns the sections that changed.
pub async fn promotion_sweep<S: Store, T: Transport>(
  coordinator: &CommandCoordinator<S, T>,
  timeout: Duration,
) -> std::result::Result<Vec<StreamId>, CommandError> {
  if coordinator.status().await.role != Role::Leader {
    return Ok(Vec::new());
  }

  let mut changed = Vec::new();
  for stream_id in coordinator.log().streams(Some(EntityKind::Section)).await? {
    let state = coordinator.log().replay(&stream_id).await?;
    if !state.into_section().is_some_and(|roster| roster.needs_promotion()) {
      continue;
    }

    let command = Command::PromoteWaitlist { section_id: stream_id.id().to_owned() };
    match coordinator
      .submit(CommandEnvelope::new(Principal::system(), command, timeout))
      .await
    {
      Ok(committed) => {
        if let Outcome::Promoted { promoted, removed } = &committed.outcome
          && (!promoted.is_empty() || !removed.is_empty())
        {
          changed.push(stream_id);
        }
      }
      Err(err) => warn!(section = %stream_id, %err, "promotion sweep skipped section"),
    }
  }
  Ok(changed)
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use argos_core::{
    academic::Grade,
    event::{Event, EventPayload, NewEvent, StreamAppend},
    store::{EventStore, Snapshot},
  };
  use argos_store_sqlite::{Error as SqliteError, SqliteStore};

  use super::*;

  /// Refuses every snapshot of one stream.
  struct SnapshotFails {
    inner:  SqliteStore,
    broken: StreamId,
  }

  impl EventStore for SnapshotFails {
    type Error = SqliteError;

    async fn append(&self, batch: Vec<StreamAppend>) -> Result<Vec<Event>, SqliteError> {
      EventStore::append(&self.inner, batch).await
    }

    async fn read(
      &self,
      stream_id: StreamId,
      from_version: u64,
      limit: usize,
    ) -> Result<Vec<Event>, SqliteError> {
      self.inner.read(stream_id, from_version, limit).await
    }

    async fn head_version(&self, stream_id: StreamId) -> Result<u64, SqliteError> {
      self.inner.head_version(stream_id).await
    }

    async fn streams(&self, kind: Option<EntityKind>) -> Result<Vec<StreamId>, SqliteError> {
      self.inner.streams(kind).await
    }
  }

  impl SnapshotStore for SnapshotFails {
    async fn load_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>, SqliteError> {
      self.inner.load_snapshot(stream_id).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<bool, SqliteError> {
      if snapshot.stream_id == self.broken {
        return Err(SqliteError::DateParse("disk on fire".into()));
      }
      self.inner.save_snapshot(snapshot).await
    }
  }

  fn completed(course: &str) -> NewEvent {
    NewEvent::new(EventPayload::CourseCompleted { course_id: course.into(), grade: Grade::A })
  }

  #[tokio::test]
  async fn failed_snapshot_stays_eligible() {
    let broken = StreamId::student("b");
    let store = SnapshotFails {
      inner:  SqliteStore::open_in_memory().await.unwrap(),
      broken: broken.clone(),
    };
    let log = EventLog::new(Arc::new(store), 1);
    for student in ["a", "b", "c"] {
      log.append(StreamId::student(student), 0, completed("CS101")).await.unwrap();
    }

    assert_eq!(snapshot_sweep(&log).await, 2);
    assert_eq!(log.take_snapshot_candidates(), [broken]);
  }
}
