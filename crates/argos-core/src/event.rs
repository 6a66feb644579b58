//! Event types: the source of truth of the Argos core.
//!
//! An event is an immutable record appended to exactly one stream. Events are
//! never updated or deleted; all state is derived by folding them through the
//! reducer in [`crate::state`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Result,
  academic::{Enrollment, Grade, GradeLevel, SectionSpec, WaitlistEntry},
  calendar::{Assignment, Booking, RoomSpec, TimeSlot},
  stream::StreamId,
};

// ─── EventPayload ────────────────────────────────────────────────────────────

/// The typed payload of an event. The variant name serves as the
/// `event_type` discriminant stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
  // ── Section ─────────────────────────────────────────────────────────────
  SectionOpened(SectionSpec),
  Enrolled(Enrollment),
  Waitlisted(WaitlistEntry),
  Dropped {
    student_id: String,
  },
  WaitlistRemoved {
    student_id: String,
    reason:     String,
  },
  SectionScheduled(Assignment),
  SectionUnscheduled {
    room_id: String,
  },

  // ── Room and lecturer calendars ─────────────────────────────────────────
  RoomRegistered(RoomSpec),
  AvailabilityDeclared {
    windows: Vec<TimeSlot>,
  },
  Booked(Booking),
  BookingReleased {
    section_id: String,
  },

  // ── Student ─────────────────────────────────────────────────────────────
  StudentProfiled {
    gpa:         Option<f32>,
    grade_level: GradeLevel,
  },
  CourseCompleted {
    course_id: String,
    grade:     Grade,
  },
}

impl EventPayload {
  /// The discriminant string stored in the `event_type` column.
  /// Must match the `rename_all = "snake_case"` serde tags above.
  pub fn discriminant(&self) -> &'static str {
    match self {
      Self::SectionOpened(_) => "section_opened",
      Self::Enrolled(_) => "enrolled",
      Self::Waitlisted(_) => "waitlisted",
      Self::Dropped { .. } => "dropped",
      Self::WaitlistRemoved { .. } => "waitlist_removed",
      Self::SectionScheduled(_) => "section_scheduled",
      Self::SectionUnscheduled { .. } => "section_unscheduled",
      Self::RoomRegistered(_) => "room_registered",
      Self::AvailabilityDeclared { .. } => "availability_declared",
      Self::Booked(_) => "booked",
      Self::BookingReleased { .. } => "booking_released",
      Self::StudentProfiled { .. } => "student_profiled",
      Self::CourseCompleted { .. } => "course_completed",
    }
  }

  /// Serialise the inner payload (without the type tag) for the
  /// `payload_json` database column.
  pub fn to_json(&self) -> Result<serde_json::Value> {
    let full = serde_json::to_value(self)?;
    Ok(full.get("data").cloned().unwrap_or(serde_json::Value::Null))
  }

  /// Deserialise from the discriminant string and JSON payload stored in the
  /// database.
  pub fn from_parts(discriminant: &str, data: serde_json::Value) -> Result<Self> {
    let wrapped = serde_json::json!({ "type": discriminant, "data": data });
    Ok(serde_json::from_value(wrapped)?)
  }
}

// ─── NewEvent ────────────────────────────────────────────────────────────────

/// An event that has been decided but not yet given a stream version.
///
/// `event_id` and `recorded_at` are fixed by the proposer so that every
/// replica applying the same log entry stores an identical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
  pub event_id:       Uuid,
  pub payload:        EventPayload,
  pub recorded_at:    DateTime<Utc>,
  pub correlation_id: Uuid,
  pub causation_id:   Option<Uuid>,
  pub actor:          Option<String>,
}

impl NewEvent {
  /// Convenience constructor: fresh ids, stamped now, no actor.
  pub fn new(payload: EventPayload) -> Self {
    Self {
      event_id: Uuid::new_v4(),
      payload,
      recorded_at: Utc::now(),
      correlation_id: Uuid::new_v4(),
      causation_id: None,
      actor: None,
    }
  }

  pub fn correlated(mut self, correlation_id: Uuid, causation_id: Option<Uuid>) -> Self {
    self.correlation_id = correlation_id;
    self.causation_id = causation_id;
    self
  }

  pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
    self.actor = Some(actor.into());
    self
  }
}

// ─── Event ───────────────────────────────────────────────────────────────────

/// A committed event. Once written, no field is ever updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub event_id:       Uuid,
  pub stream_id:      StreamId,
  /// Position within the stream; the first event has version 1.
  pub version:        u64,
  pub payload:        EventPayload,
  pub recorded_at:    DateTime<Utc>,
  pub correlation_id: Uuid,
  pub causation_id:   Option<Uuid>,
  pub actor:          Option<String>,
}

impl Event {
  pub fn committed(stream_id: StreamId, version: u64, new: NewEvent) -> Self {
    Self {
      event_id: new.event_id,
      stream_id,
      version,
      payload: new.payload,
      recorded_at: new.recorded_at,
      correlation_id: new.correlation_id,
      causation_id: new.causation_id,
      actor: new.actor,
    }
  }
}

// ─── StreamAppend ────────────────────────────────────────────────────────────

/// Events destined for one stream, guarded by the head version they were
/// decided against. The unit of optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAppend {
  pub stream_id:        StreamId,
  pub expected_version: u64,
  pub events:           Vec<NewEvent>,
}

impl StreamAppend {
  pub fn new(stream_id: StreamId, expected_version: u64) -> Self {
    Self { stream_id, expected_version, events: Vec::new() }
  }

  pub fn with(mut self, event: NewEvent) -> Self {
    self.events.push(event);
    self
  }

  pub fn push(&mut self, event: NewEvent) { self.events.push(event); }

  /// The version the stream reaches once this append commits.
  pub fn final_version(&self) -> u64 { self.expected_version + self.events.len() as u64 }

  /// Assign versions, producing the events as they will be stored.
  pub fn into_events(self) -> Vec<Event> {
    let Self { stream_id, expected_version, events } = self;
    events
      .into_iter()
      .zip(expected_version + 1..)
      .map(|(new, version)| Event::committed(stream_id.clone(), version, new))
      .collect()
  }
}
