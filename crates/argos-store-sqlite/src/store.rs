//! [`SqliteStore`]: the SQLite implementation of [`EventStore`] and
//! [`SnapshotStore`].

use std::path::Path;

use argos_core::{
  event::{Event, StreamAppend},
  store::{EventStore, Snapshot, SnapshotStore},
  stream::{EntityKind, StreamId, VersionConflict},
};
use rusqlite::OptionalExtension as _;
use tracing::debug;

use crate::{
  Result,
  encode::{EventRow, RawEvent, RawSnapshot, encode_dt},
  error::Error,
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Event streams, snapshots and consensus state in a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

/// One stream's share of a batch, encoded before entering the connection
/// thread.
struct EncodedAppend {
  stream_id: String,
  expected:  i64,
  rows:      Vec<EventRow>,
}

/// What the transaction decided for one stream.
enum AppendCheck {
  Write,
  AlreadyPresent,
  Conflict { actual: i64 },
}

fn check_append(
  tx: &rusqlite::Transaction<'_>,
  append: &EncodedAppend,
) -> rusqlite::Result<AppendCheck> {
  let head: i64 = tx.query_row(
    "SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = ?1",
    rusqlite::params![append.stream_id],
    |r| r.get(0),
  )?;
  if head == append.expected {
    return Ok(AppendCheck::Write);
  }

  let count = append.rows.len() as i64;
  if count > 0 && head >= append.expected + count {
    let mut stmt = tx.prepare(
      "SELECT event_id FROM events
       WHERE stream_id = ?1 AND version > ?2 AND version <= ?3
       ORDER BY version",
    )?;
    let stored: Vec<String> = stmt
      .query_map(
        rusqlite::params![append.stream_id, append.expected, append.expected + count],
        |r| r.get(0),
      )?
      .collect::<rusqlite::Result<_>>()?;
    let same = stored.len() == append.rows.len()
      && stored.iter().zip(&append.rows).all(|(id, row)| *id == row.event_id);
    if same {
      return Ok(AppendCheck::AlreadyPresent);
    }
  }
  Ok(AppendCheck::Conflict { actual: head })
}

fn insert_rows(tx: &rusqlite::Transaction<'_>, append: &EncodedAppend) -> rusqlite::Result<()> {
  let mut stmt = tx.prepare_cached(
    "INSERT INTO events (
       event_id, stream_id, version, event_type, payload_json,
       recorded_at, correlation_id, causation_id, actor
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
  )?;
  for row in &append.rows {
    stmt.execute(rusqlite::params![
      row.event_id,
      append.stream_id,
      row.version,
      row.event_type,
      row.payload_json,
      row.recorded_at,
      row.correlation_id,
      row.causation_id,
      row.actor,
    ])?;
  }
  Ok(())
}

// ─── EventStore impl ─────────────────────────────────────────────────────────

impl EventStore for SqliteStore {
  type Error = Error;

  async fn append(&self, batch: Vec<StreamAppend>) -> Result<Vec<Event>> {
    let encoded = batch
      .iter()
      .map(|append| {
        let rows = append
          .events
          .iter()
          .zip(append.expected_version + 1..)
          .map(|(event, version)| EventRow::encode(version, event))
          .collect::<Result<Vec<_>>>()?;
        Ok(EncodedAppend {
          stream_id: append.stream_id.to_string(),
          expected: append.expected_version as i64,
          rows,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    // Ok(Err(position)) reports a conflict at `batch[position]`.
    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut written = Vec::with_capacity(encoded.len());
        for (position, append) in encoded.iter().enumerate() {
          match check_append(&tx, append)? {
            AppendCheck::Write => {
              insert_rows(&tx, append)?;
              written.push(true);
            }
            AppendCheck::AlreadyPresent => written.push(false),
            AppendCheck::Conflict { actual } => return Ok(Err((position, actual))),
          }
        }
        tx.commit()?;
        Ok(Ok(written))
      })
      .await?;

    match outcome {
      Ok(written) => {
        let events: Vec<Event> = batch
          .into_iter()
          .zip(written)
          .filter(|(_, written)| *written)
          .flat_map(|(append, _)| append.into_events())
          .collect();
        debug!(events = events.len(), "appended batch");
        Ok(events)
      }
      Err((position, actual)) => {
        let append = &batch[position];
        Err(Error::VersionConflict(VersionConflict {
          stream_id: append.stream_id.clone(),
          expected:  append.expected_version,
          actual:    actual as u64,
        }))
      }
    }
  }

  async fn read(&self, stream_id: StreamId, from_version: u64, limit: usize) -> Result<Vec<Event>> {
    let stream = stream_id.to_string();
    let from = from_version as i64;
    let limit = limit.min(i64::MAX as usize) as i64;

    let raws: Vec<RawEvent> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {} FROM events WHERE stream_id = ?1 AND version >= ?2
           ORDER BY version LIMIT ?3",
          RawEvent::COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params![stream, from, limit], RawEvent::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEvent::into_event).collect()
  }

  async fn head_version(&self, stream_id: StreamId) -> Result<u64> {
    let stream = stream_id.to_string();
    let head: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = ?1",
          rusqlite::params![stream],
          |r| r.get(0),
        )?)
      })
      .await?;
    Ok(head as u64)
  }

  async fn streams(&self, kind: Option<EntityKind>) -> Result<Vec<StreamId>> {
    let prefix = kind.map(|k| format!("{}/", k.as_str()));
    let ids: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT stream_id FROM events
           WHERE ?1 IS NULL OR substr(stream_id, 1, length(?1)) = ?1
           ORDER BY stream_id",
        )?;
        let ids = stmt
          .query_map(rusqlite::params![prefix], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
      })
      .await?;

    let mut streams = ids
      .iter()
      .map(|id| id.parse::<StreamId>())
      .collect::<argos_core::Result<Vec<_>>>()?;
    streams.sort();
    Ok(streams)
  }
}

// ─── SnapshotStore impl ──────────────────────────────────────────────────────

impl SnapshotStore for SqliteStore {
  async fn load_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>> {
    let stream = stream_id.to_string();
    let raw: Option<RawSnapshot> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT stream_id, version, state_json, taken_at
               FROM snapshots WHERE stream_id = ?1",
              rusqlite::params![stream],
              |r| {
                Ok(RawSnapshot {
                  stream_id:  r.get(0)?,
                  version:    r.get(1)?,
                  state_json: r.get(2)?,
                  taken_at:   r.get(3)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawSnapshot::into_snapshot).transpose()
  }

  async fn save_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
    let stream = snapshot.stream_id.to_string();
    let version = snapshot.version as i64;
    let state_json = serde_json::to_string(&snapshot.state)?;
    let taken_at = encode_dt(snapshot.taken_at);

    let saved = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let head: i64 = tx.query_row(
          "SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = ?1",
          rusqlite::params![stream],
          |r| r.get(0),
        )?;
        let current: Option<i64> = tx
          .query_row(
            "SELECT version FROM snapshots WHERE stream_id = ?1",
            rusqlite::params![stream],
            |r| r.get(0),
          )
          .optional()?;

        if version > head || current.is_some_and(|v| v >= version) {
          return Ok(false);
        }

        tx.execute(
          "INSERT INTO snapshots (stream_id, version, state_json, taken_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (stream_id) DO UPDATE SET
             version = excluded.version,
             state_json = excluded.state_json,
             taken_at = excluded.taken_at",
          rusqlite::params![stream, version, state_json, taken_at],
        )?;
        tx.commit()?;
        Ok(true)
      })
      .await?;

    if saved {
      debug!(stream_id = %snapshot.stream_id, version = snapshot.version, "snapshot saved");
    }
    Ok(saved)
  }
}
