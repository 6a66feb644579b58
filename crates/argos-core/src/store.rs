//! The `EventStore` / `SnapshotStore` traits and the lazy [`EventReader`].
//!
//! The traits are implemented by storage backends (e.g. `argos-store-sqlite`).
//! The event log in `argos-engine` depends on this abstraction, not on any
//! concrete backend.

use std::{collections::VecDeque, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  event::{Event, StreamAppend},
  state::StreamState,
  stream::{EntityKind, StreamId, VersionConflict},
};

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Materialised state of a stream as of `version`.
///
/// Valid only while every event up to `version` is durably committed.
/// Snapshots are superseded wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub stream_id: StreamId,
  pub version:   u64,
  pub state:     StreamState,
  pub taken_at:  DateTime<Utc>,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Lets generic code recognise an optimistic-concurrency failure inside any
/// backend's error type.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  fn version_conflict(&self) -> Option<&VersionConflict>;
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Abstraction over an append-only, per-stream event store.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait EventStore: Send + Sync {
  type Error: StoreError;

  /// Append a batch atomically: every stream's `expected_version` is checked
  /// before anything is written, and either all events commit or none do.
  ///
  /// A stream whose events are already present (same event ids at the
  /// expected versions) is skipped and contributes nothing to the returned
  /// list, so re-applying a batch is harmless.
  fn append(
    &self,
    batch: Vec<StreamAppend>,
  ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + '_;

  /// Up to `limit` events of `stream_id` starting at `from_version`, in
  /// version order.
  fn read(
    &self,
    stream_id: StreamId,
    from_version: u64,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + '_;

  /// Version of the last committed event; 0 for an empty stream.
  fn head_version(
    &self,
    stream_id: StreamId,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Every stream with at least one event, optionally of one kind.
  fn streams(
    &self,
    kind: Option<EntityKind>,
  ) -> impl Future<Output = Result<Vec<StreamId>, Self::Error>> + Send + '_;
}

/// Snapshot persistence, sharing the event store's error type.
pub trait SnapshotStore: EventStore {
  fn load_snapshot(
    &self,
    stream_id: StreamId,
  ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + '_;

  /// Store `snapshot` unless an equal or newer one exists. Refuses (returns
  /// `false`) a snapshot beyond the stream's committed head.
  fn save_snapshot(
    &self,
    snapshot: Snapshot,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;
}

// ─── EventReader ─────────────────────────────────────────────────────────────

/// Lazy, restartable, finite iteration over one stream.
///
/// Pages are fetched on demand. The head observed on the first fetch bounds
/// the sequence, so concurrent appends cannot make it endless.
pub struct EventReader<S> {
  store:        Arc<S>,
  stream_id:    StreamId,
  next_version: u64,
  until:        Option<u64>,
  page_size:    usize,
  buffer:       VecDeque<Event>,
}

impl<S: EventStore> EventReader<S> {
  pub const DEFAULT_PAGE_SIZE: usize = 256;

  pub fn new(store: Arc<S>, stream_id: StreamId, from_version: u64) -> Self {
    Self {
      store,
      stream_id,
      next_version: from_version.max(1),
      until: None,
      page_size: Self::DEFAULT_PAGE_SIZE,
      buffer: VecDeque::new(),
    }
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn stream_id(&self) -> &StreamId { &self.stream_id }

  /// Version of the next event to be yielded.
  pub fn position(&self) -> u64 { self.next_version }

  /// Rewind (or skip ahead) to `from_version`; the bound is re-read lazily.
  pub fn restart(&mut self, from_version: u64) {
    self.next_version = from_version.max(1);
    self.until = None;
    self.buffer.clear();
  }

  pub async fn next(&mut self) -> Result<Option<Event>, S::Error> {
    if self.buffer.is_empty() {
      self.fill().await?;
    }
    Ok(self.buffer.pop_front().inspect(|event| {
      self.next_version = event.version + 1;
    }))
  }

  async fn fill(&mut self) -> Result<(), S::Error> {
    let until = match self.until {
      Some(until) => until,
      None => {
        let head = self.store.head_version(self.stream_id.clone()).await?;
        *self.until.insert(head)
      }
    };
    if self.next_version > until {
      return Ok(());
    }

    let remaining = (until - self.next_version + 1) as usize;
    let page = self
      .store
      .read(self.stream_id.clone(), self.next_version, self.page_size.min(remaining))
      .await?;
    self.buffer.extend(page.into_iter().filter(|e| e.version <= until));
    Ok(())
  }

  /// Drain the remainder of the sequence.
  pub async fn collect(mut self) -> Result<Vec<Event>, S::Error> {
    let mut events = Vec::new();
    while let Some(event) = self.next().await? {
      events.push(event);
    }
    Ok(events)
  }
}
