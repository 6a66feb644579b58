//! Scheduling-side domain types: weekly time slots, rooms and bookings.

use std::collections::BTreeSet;

use chrono::{NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── TimeSlot ────────────────────────────────────────────────────────────────

/// A weekly recurring interval `[start, end)` on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
  pub day:   Weekday,
  pub start: NaiveTime,
  pub end:   NaiveTime,
}

impl TimeSlot {
  pub fn new(day: Weekday, start: NaiveTime, end: NaiveTime) -> Result<Self> {
    let slot = Self { day, start, end };
    slot.validate()?;
    Ok(slot)
  }

  /// Slots arriving over the wire bypass [`TimeSlot::new`].
  pub fn validate(&self) -> Result<()> {
    if self.start >= self.end {
      return Err(Error::InvalidTimeSlot(format!(
        "{} {}-{} ends before it starts",
        self.day, self.start, self.end
      )));
    }
    Ok(())
  }

  /// Half-open intersection: back-to-back slots do not overlap.
  pub fn overlaps(&self, other: &TimeSlot) -> bool {
    self.day == other.day && self.start < other.end && other.start < self.end
  }

  pub fn contains(&self, other: &TimeSlot) -> bool {
    self.day == other.day && self.start <= other.start && other.end <= self.end
  }

  pub fn duration(&self) -> TimeDelta { self.end - self.start }

  /// Idle time between two non-overlapping slots on the same day.
  pub fn gap_to(&self, other: &TimeSlot) -> Option<TimeDelta> {
    if self.day != other.day || self.overlaps(other) {
      return None;
    }
    if self.end <= other.start {
      Some(other.start - self.end)
    } else {
      Some(self.start - other.end)
    }
  }
}

// ─── Rooms ───────────────────────────────────────────────────────────────────

/// A bookable room as registered with the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSpec {
  pub room_id:   String,
  pub building:  String,
  pub capacity:  u32,
  #[serde(default)]
  pub room_type: Option<String>,
  #[serde(default)]
  pub equipment: BTreeSet<String>,
}

/// What a section would like from its room. Never blocks an assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPreference {
  #[serde(default)]
  pub room_type: Option<String>,
  #[serde(default)]
  pub equipment: BTreeSet<String>,
  #[serde(default)]
  pub building:  Option<String>,
}

impl RoomPreference {
  pub fn is_empty(&self) -> bool {
    self.room_type.is_none() && self.equipment.is_empty() && self.building.is_none()
  }
}

// ─── Bookings ────────────────────────────────────────────────────────────────

/// One weekly occupation of a room by a section and its lecturer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
  pub section_id:    String,
  pub room_id:       String,
  pub instructor_id: String,
  pub building:      String,
  pub slot:          TimeSlot,
}

/// The solver's answer for one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
  pub section_id:    String,
  pub room_id:       String,
  pub instructor_id: String,
  pub building:      String,
  pub slot:          TimeSlot,
  /// Weighted soft-constraint score of the chosen room.
  pub score:         f64,
}

impl Assignment {
  pub fn booking(&self) -> Booking {
    Booking {
      section_id:    self.section_id.clone(),
      room_id:       self.room_id.clone(),
      instructor_id: self.instructor_id.clone(),
      building:      self.building.clone(),
      slot:          self.slot,
    }
  }
}
