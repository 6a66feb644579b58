//! Stream identity and optimistic-concurrency types.
//!
//! A stream is the event sequence of one aggregate. Its id is the pair
//! `(kind, id)`; the derived ordering of [`StreamId`] is the global lock
//! order used by every multi-entity command.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Error;

// ─── EntityKind ──────────────────────────────────────────────────────────────

/// The kinds of aggregate that own a stream.
///
/// Declaration order is significant: it is the first component of the global
/// lock order.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Section,
  Room,
  Lecturer,
  Student,
}

impl EntityKind {
  pub const ALL: [EntityKind; 4] = [
    EntityKind::Section,
    EntityKind::Room,
    EntityKind::Lecturer,
    EntityKind::Student,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Section => "section",
      Self::Room => "room",
      Self::Lecturer => "lecturer",
      Self::Student => "student",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    EntityKind::ALL
      .into_iter()
      .find(|k| k.as_str() == s)
      .ok_or_else(|| Error::UnknownEntityKind(s.to_owned()))
  }
}

// ─── StreamId ────────────────────────────────────────────────────────────────

/// Identity of one event stream, rendered as `kind/id` (e.g. `room/B-101`).
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
  kind: EntityKind,
  id:   String,
}

impl StreamId {
  pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
    Self { kind, id: id.into() }
  }

  pub fn section(id: impl Into<String>) -> Self { Self::new(EntityKind::Section, id) }

  pub fn room(id: impl Into<String>) -> Self { Self::new(EntityKind::Room, id) }

  pub fn lecturer(id: impl Into<String>) -> Self { Self::new(EntityKind::Lecturer, id) }

  pub fn student(id: impl Into<String>) -> Self { Self::new(EntityKind::Student, id) }

  pub fn kind(&self) -> EntityKind { self.kind }

  pub fn id(&self) -> &str { &self.id }
}

impl fmt::Display for StreamId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.kind, self.id)
  }
}

impl FromStr for StreamId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (kind, id) = s
      .split_once('/')
      .ok_or_else(|| Error::InvalidStreamId(s.to_owned()))?;
    if id.is_empty() {
      return Err(Error::InvalidStreamId(s.to_owned()));
    }
    Ok(Self::new(kind.parse()?, id))
  }
}

impl TryFrom<String> for StreamId {
  type Error = Error;

  fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<StreamId> for String {
  fn from(value: StreamId) -> Self { value.to_string() }
}

// ─── VersionConflict ─────────────────────────────────────────────────────────

/// An append named an `expected_version` that is not the stream's head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("version conflict on {stream_id}: expected {expected}, head is {actual}")]
pub struct VersionConflict {
  pub stream_id: StreamId,
  pub expected:  u64,
  pub actual:    u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stream_id_round_trips_through_display() {
    let id = StreamId::room("B-101");
    assert_eq!(id.to_string(), "room/B-101");
    assert_eq!("room/B-101".parse::<StreamId>().unwrap(), id);
  }

  #[test]
  fn stream_id_keeps_slashes_in_the_id_part() {
    let id: StreamId = "section/CS301/A".parse().unwrap();
    assert_eq!(id.kind(), EntityKind::Section);
    assert_eq!(id.id(), "CS301/A");
  }

  #[test]
  fn stream_id_rejects_unknown_kind_and_empty_id() {
    assert!(matches!(
      "course/CS301".parse::<StreamId>(),
      Err(Error::UnknownEntityKind(_))
    ));
    assert!(matches!(
      "room/".parse::<StreamId>(),
      Err(Error::InvalidStreamId(_))
    ));
    assert!(matches!(
      "room".parse::<StreamId>(),
      Err(Error::InvalidStreamId(_))
    ));
  }

  #[test]
  fn ordering_is_kind_then_id() {
    let mut ids = vec![
      StreamId::student("a"),
      StreamId::room("R2"),
      StreamId::section("z"),
      StreamId::room("R1"),
      StreamId::lecturer("l"),
    ];
    ids.sort();
    let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
    assert_eq!(rendered, [
      "section/z",
      "room/R1",
      "room/R2",
      "lecturer/l",
      "student/a"
    ]);
  }

  #[test]
  fn serializes_as_plain_string() {
    let json = serde_json::to_string(&StreamId::student("s-1")).unwrap();
    assert_eq!(json, "\"student/s-1\"");
    let back: StreamId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, StreamId::student("s-1"));
  }
}
