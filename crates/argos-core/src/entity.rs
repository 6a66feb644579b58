//! The shared entity header and the capability traits.
//!
//! Aggregate state types compose an [`Entity`] instead of inheriting from a
//! common base, and implement only the capabilities they actually have.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  academic::{Grade, GradeLevel},
  calendar::{Booking, TimeSlot},
  event::Event,
  stream::{EntityKind, StreamId},
};

/// Whether any event has been recorded for the entity yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
  #[default]
  New,
  Active,
}

/// Bookkeeping common to every aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
  pub id:         String,
  pub kind:       EntityKind,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
  /// Version of the last event folded into the aggregate.
  pub version:    u64,
  pub status:     EntityStatus,
  #[serde(default)]
  pub metadata:   BTreeMap<String, serde_json::Value>,
}

impl Entity {
  pub fn new(stream_id: &StreamId) -> Self {
    Self {
      id:         stream_id.id().to_owned(),
      kind:       stream_id.kind(),
      created_at: None,
      updated_at: None,
      version:    0,
      status:     EntityStatus::New,
      metadata:   BTreeMap::new(),
    }
  }

  pub fn stream_id(&self) -> StreamId { StreamId::new(self.kind, self.id.clone()) }

  /// Advance the header past `event`.
  pub fn touch(&mut self, event: &Event) {
    self.version = event.version;
    self.created_at.get_or_insert(event.recorded_at);
    self.updated_at = Some(event.recorded_at);
    self.status = EntityStatus::Active;
    if let Some(actor) = &event.actor {
      self
        .metadata
        .insert("last_actor".into(), serde_json::Value::String(actor.clone()));
    }
  }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// Something that can request a seat in a section.
pub trait Enrollable {
  fn student_id(&self) -> &str;

  fn gpa(&self) -> Option<f32>;

  fn grade_level(&self) -> GradeLevel;

  /// Best recorded grade for `course_id`, if the course was completed.
  fn grade_for(&self, course_id: &str) -> Option<Grade>;
}

/// Something with a capacity that sections can be booked into.
pub trait Bookable {
  fn resource_id(&self) -> &str;

  fn building(&self) -> &str;

  fn capacity(&self) -> u32;

  fn bookings(&self) -> &[Booking];

  /// Bookings that intersect `slot`.
  fn clashes<'a>(&'a self, slot: &'a TimeSlot) -> impl Iterator<Item = &'a Booking> + 'a {
    self.bookings().iter().filter(move |b| b.slot.overlaps(slot))
  }
}
