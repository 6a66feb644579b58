//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, UUIDs hyphenated lowercase strings,
//! stream ids `kind/id`. Versions, indices and terms are `u64` in Rust and
//! `INTEGER` (i64) in SQLite.

use argos_core::{
  event::{Event, EventPayload, NewEvent},
  state::StreamState,
  store::Snapshot,
};
use argos_raft::{EntryPayload, LogEntry};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Column values for one `events` row, ready to bind.
pub struct EventRow {
  pub event_id:       String,
  pub version:        i64,
  pub event_type:     &'static str,
  pub payload_json:   String,
  pub recorded_at:    String,
  pub correlation_id: String,
  pub causation_id:   Option<String>,
  pub actor:          Option<String>,
}

impl EventRow {
  pub fn encode(version: u64, event: &NewEvent) -> Result<Self> {
    Ok(Self {
      event_id:       encode_uuid(event.event_id),
      version:        version as i64,
      event_type:     event.payload.discriminant(),
      payload_json:   event.payload.to_json()?.to_string(),
      recorded_at:    encode_dt(event.recorded_at),
      correlation_id: encode_uuid(event.correlation_id),
      causation_id:   event.causation_id.map(encode_uuid),
      actor:          event.actor.clone(),
    })
  }
}

/// Raw strings read directly from an `events` row.
pub struct RawEvent {
  pub event_id:       String,
  pub stream_id:      String,
  pub version:        i64,
  pub event_type:     String,
  pub payload_json:   String,
  pub recorded_at:    String,
  pub correlation_id: String,
  pub causation_id:   Option<String>,
  pub actor:          Option<String>,
}

impl RawEvent {
  pub const COLUMNS: &'static str = "event_id, stream_id, version, event_type, payload_json, \
                                     recorded_at, correlation_id, causation_id, actor";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:       row.get(0)?,
      stream_id:      row.get(1)?,
      version:        row.get(2)?,
      event_type:     row.get(3)?,
      payload_json:   row.get(4)?,
      recorded_at:    row.get(5)?,
      correlation_id: row.get(6)?,
      causation_id:   row.get(7)?,
      actor:          row.get(8)?,
    })
  }

  pub fn into_event(self) -> Result<Event> {
    let data: serde_json::Value = serde_json::from_str(&self.payload_json)?;
    Ok(Event {
      event_id:       decode_uuid(&self.event_id)?,
      stream_id:      self.stream_id.parse()?,
      version:        self.version as u64,
      payload:        EventPayload::from_parts(&self.event_type, data)?,
      recorded_at:    decode_dt(&self.recorded_at)?,
      correlation_id: decode_uuid(&self.correlation_id)?,
      causation_id:   self.causation_id.as_deref().map(decode_uuid).transpose()?,
      actor:          self.actor,
    })
  }
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

pub struct RawSnapshot {
  pub stream_id:  String,
  pub version:    i64,
  pub state_json: String,
  pub taken_at:   String,
}

impl RawSnapshot {
  pub fn into_snapshot(self) -> Result<Snapshot> {
    let state: StreamState = serde_json::from_str(&self.state_json)?;
    Ok(Snapshot {
      stream_id: self.stream_id.parse()?,
      version: self.version as u64,
      state,
      taken_at: decode_dt(&self.taken_at)?,
    })
  }
}

// ─── Raft log ────────────────────────────────────────────────────────────────

pub fn checksum(index: u64, term: u64, payload_json: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(index.to_be_bytes());
  hasher.update(term.to_be_bytes());
  hasher.update(payload_json.as_bytes());
  hex::encode(hasher.finalize())
}

pub struct LogRow {
  pub log_index:    i64,
  pub term:         i64,
  pub payload_json: String,
  pub checksum:     String,
}

impl LogRow {
  pub fn encode(entry: &LogEntry) -> Result<Self> {
    let payload_json = serde_json::to_string(&entry.payload)?;
    Ok(Self {
      log_index: entry.index as i64,
      term: entry.term as i64,
      checksum: checksum(entry.index, entry.term, &payload_json),
      payload_json,
    })
  }

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      log_index:    row.get(0)?,
      term:         row.get(1)?,
      payload_json: row.get(2)?,
      checksum:     row.get(3)?,
    })
  }

  pub fn checksum_matches(&self) -> bool {
    checksum(self.log_index as u64, self.term as u64, &self.payload_json) == self.checksum
  }

  pub fn into_entry(self) -> Result<LogEntry> {
    let payload: EntryPayload = serde_json::from_str(&self.payload_json)?;
    Ok(LogEntry::new(self.log_index as u64, self.term as u64, payload))
  }
}
