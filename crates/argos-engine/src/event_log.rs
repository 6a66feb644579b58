//! The event log: optimistic appends, replay and snapshots over any
//! [`SnapshotStore`], plus in-order delivery to subscribers.

use std::{
  collections::{BTreeSet, HashMap},
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{Arc, Mutex, PoisonError},
};

use argos_core::{
  event::{Event, NewEvent, StreamAppend},
  state::StreamState,
  store::{EventReader, EventStore, Snapshot, SnapshotStore},
  stream::{EntityKind, StreamId},
};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{BoxError, Error, Result};

// ─── Subscribers ─────────────────────────────────────────────────────────────

/// Receives every committed event once, in commit order.
///
/// Runs on its own task: a slow subscriber delays nobody but itself, and a
/// failing one is logged and keeps receiving later events.
pub trait Subscriber: Send + Sync + 'static {
  fn on_event(&self, event: &Event) -> Result<(), BoxError>;
}

impl<F> Subscriber for F
where
  F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
{
  fn on_event(&self, event: &Event) -> Result<(), BoxError> { self(event) }
}

struct Subscription {
  name: String,
  tx:   mpsc::UnboundedSender<Event>,
}

fn deliver(name: &str, subscriber: &dyn Subscriber, event: &Event) {
  match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event))) {
    Ok(Ok(())) => {}
    Ok(Err(err)) => warn!(
      subscriber = name,
      stream = %event.stream_id,
      version = event.version,
      %err,
      "subscriber failed"
    ),
    Err(_) => warn!(
      subscriber = name,
      stream = %event.stream_id,
      version = event.version,
      "subscriber panicked"
    ),
  }
}

// ─── EventLog ────────────────────────────────────────────────────────────────

pub struct EventLog<S> {
  store:          Arc<S>,
  /// Held across store append and notification so subscribers observe
  /// commit order.
  append_gate:    tokio::sync::Mutex<()>,
  subscribers:    Mutex<Vec<Subscription>>,
  snapshot_every: u64,
  /// Version of the newest stored snapshot per stream, filled lazily.
  snapshots:      Mutex<HashMap<StreamId, u64>>,
  eligible:       Mutex<BTreeSet<StreamId>>,
}

impl<S: SnapshotStore + 'static> EventLog<S> {
  /// `snapshot_every` of 0 disables snapshot eligibility tracking.
  pub fn new(store: Arc<S>, snapshot_every: u64) -> Self {
    Self {
      store,
      append_gate: tokio::sync::Mutex::new(()),
      subscribers: Mutex::new(Vec::new()),
      snapshot_every,
      snapshots: Mutex::new(HashMap::new()),
      eligible: Mutex::new(BTreeSet::new()),
    }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  // ─── Writes ────────────────────────────────────────────────────────────────

  /// Append one event, returning the version it was committed at.
  pub async fn append(&self, stream_id: StreamId, expected_version: u64, event: NewEvent) -> Result<u64> {
    let append = StreamAppend::new(stream_id, expected_version).with(event);
    let version = append.final_version();
    self.append_batch(vec![append]).await?;
    Ok(version)
  }

  /// Append every stream of `batch` atomically. Returns the events actually
  /// written; a batch already present is skipped and returns nothing.
  pub async fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<Event>> {
    let _gate = self.append_gate.lock().await;

    let written = EventStore::append(&*self.store, batch).await.map_err(Error::store)?;
    if written.is_empty() {
      return Ok(written);
    }

    for event in &written {
      debug!(stream = %event.stream_id, version = event.version, kind = event.payload.discriminant(), "appended event");
    }
    self.notify(&written);
    self.track_eligibility(&written).await?;
    Ok(written)
  }

  fn notify(&self, events: &[Event]) {
    let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|sub| {
      let open = events.iter().all(|event| sub.tx.send(event.clone()).is_ok());
      if !open {
        warn!(subscriber = %sub.name, "subscriber task is gone, unsubscribing");
      }
      open
    });
  }

  async fn track_eligibility(&self, events: &[Event]) -> Result<()> {
    if self.snapshot_every == 0 {
      return Ok(());
    }

    let mut heads: HashMap<&StreamId, u64> = HashMap::new();
    for event in events {
      let head = heads.entry(&event.stream_id).or_default();
      *head = (*head).max(event.version);
    }

    for (stream_id, head) in heads {
      let snapshot_version = self.snapshot_version(stream_id).await?;
      if head.saturating_sub(snapshot_version) >= self.snapshot_every {
        self.eligible.lock().unwrap_or_else(PoisonError::into_inner).insert(stream_id.clone());
      }
    }
    Ok(())
  }

  async fn snapshot_version(&self, stream_id: &StreamId) -> Result<u64> {
    let cached = self
      .snapshots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(stream_id)
      .copied();
    if let Some(version) = cached {
      return Ok(version);
    }

    let stored = self
      .store
      .load_snapshot(stream_id.clone())
      .await
      .map_err(Error::store)?
      .map_or(0, |s| s.version);
    self.remember_snapshot(stream_id, stored);
    Ok(stored)
  }

  fn remember_snapshot(&self, stream_id: &StreamId, version: u64) {
    let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
    let known = snapshots.entry(stream_id.clone()).or_default();
    *known = (*known).max(version);
  }

  // ─── Reads ─────────────────────────────────────────────────────────────────

  /// Lazy iteration over `stream_id` starting at `from_version`.
  pub fn read(&self, stream_id: StreamId, from_version: u64) -> EventReader<S> {
    EventReader::new(Arc::clone(&self.store), stream_id, from_version)
  }

  /// One page of events, for callers that page themselves.
  pub async fn events(&self, stream_id: StreamId, from_version: u64, limit: usize) -> Result<Vec<Event>> {
    self
      .store
      .read(stream_id, from_version.max(1), limit)
      .await
      .map_err(Error::store)
  }

  pub async fn head_version(&self, stream_id: StreamId) -> Result<u64> {
    self.store.head_version(stream_id).await.map_err(Error::store)
  }

  pub async fn streams(&self, kind: Option<EntityKind>) -> Result<Vec<StreamId>> {
    self.store.streams(kind).await.map_err(Error::store)
  }

  /// Current state of `stream_id`: the newest snapshot, if any, with every
  /// later event folded in.
  pub async fn replay(&self, stream_id: &StreamId) -> Result<StreamState> {
    let state = match self.store.load_snapshot(stream_id.clone()).await.map_err(Error::store)? {
      Some(snapshot) => {
        self.remember_snapshot(stream_id, snapshot.version);
        snapshot.state
      }
      None => StreamState::empty(stream_id),
    };
    self.fold(stream_id, state).await
  }

  /// Replay from the first event, ignoring snapshots.
  pub async fn replay_from_scratch(&self, stream_id: &StreamId) -> Result<StreamState> {
    self.fold(stream_id, StreamState::empty(stream_id)).await
  }

  async fn fold(&self, stream_id: &StreamId, mut state: StreamState) -> Result<StreamState> {
    let mut reader = self.read(stream_id.clone(), state.version() + 1);
    while let Some(event) = reader.next().await.map_err(Error::store)? {
      let expected = state.version() + 1;
      if event.version != expected {
        return Err(
          argos_core::Error::VersionGap {
            stream_id: stream_id.clone(),
            expected,
            found: event.version,
          }
          .into(),
        );
      }
      state.apply(&event);
    }
    Ok(state)
  }

  // ─── Snapshots ─────────────────────────────────────────────────────────────

  /// Store the current state of `stream_id`. Returns `false` when nothing
  /// newer than the stored snapshot exists.
  pub async fn snapshot(&self, stream_id: &StreamId) -> Result<bool> {
    let state = self.replay(stream_id).await?;
    let version = state.version();
    if version == 0 {
      return Ok(false);
    }

    let saved = self
      .store
      .save_snapshot(Snapshot {
        stream_id: stream_id.clone(),
        version,
        state,
        taken_at: Utc::now(),
      })
      .await
      .map_err(Error::store)?;

    if saved {
      self.remember_snapshot(stream_id, version);
      debug!(stream = %stream_id, version, "snapshot saved");
    }
    self.eligible.lock().unwrap_or_else(PoisonError::into_inner).remove(stream_id);
    Ok(saved)
  }

  /// Put `stream_id` back in the eligible set.
  pub fn mark_for_snapshot(&self, stream_id: StreamId) {
    self.eligible.lock().unwrap_or_else(PoisonError::into_inner).insert(stream_id);
  }

  /// Streams that have grown `snapshot_every` events past their snapshot,
  /// removed from the eligible set.
  pub fn take_snapshot_candidates(&self) -> Vec<StreamId> {
    let mut eligible = self.eligible.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut *eligible).into_iter().collect()
  }

  // ─── Subscriptions ─────────────────────────────────────────────────────────

  /// Deliver every event committed from now on to `subscriber`.
  pub fn subscribe(&self, name: impl Into<String>, subscriber: impl Subscriber) {
    let name = name.into();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let task_name = name.clone();
    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        deliver(&task_name, &subscriber, &event);
      }
    });

    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Subscription { name, tx });
  }
}
