//! Room and time-slot assignment under hard and soft constraints.
//!
//! Hard constraints decide feasibility: room capacity, no overlapping booking
//! of the room or of the lecturer, and the slot lying inside one of the
//! lecturer's availability windows. Feasible rooms are ranked by a weighted
//! sum of soft scores, each in `[0, 1]`; equal scores go to the lowest room id.

use std::collections::{BTreeMap, BTreeSet};

use argos_core::{
  academic::SectionSpec,
  calendar::{Assignment, Booking, RoomPreference, TimeSlot},
  entity::Bookable,
  state::{InstructorCalendar, RoomCalendar},
  stream::StreamId,
};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Weights ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftWeights {
  /// Room type, equipment and building match.
  pub preference:            f64,
  /// Few empty seats.
  pub capacity_fit:          f64,
  /// No building change on a tight same-day turnaround for the lecturer.
  pub travel:                f64,
  /// Spread load across rooms: fewer same-day bookings is better.
  pub balance:               f64,
  pub travel_buffer_minutes: i64,
}

impl Default for SoftWeights {
  fn default() -> Self {
    Self {
      preference:            0.5,
      capacity_fit:          0.3,
      travel:                0.2,
      balance:               0.1,
      travel_buffer_minutes: 15,
    }
  }
}

// ─── Diagnostics ─────────────────────────────────────────────────────────────

/// One failed hard constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "constraint", rename_all = "snake_case")]
pub enum Violation {
  RoomUnregistered,
  RoomCapacity { capacity: u32, required: u32 },
  RoomBooked { section_id: String, slot: TimeSlot },
  InstructorBooked { section_id: String, slot: TimeSlot },
  InstructorUnavailable { instructor_id: String, slot: TimeSlot },
}

/// Every hard constraint one candidate room failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConflict {
  pub room_id:    String,
  pub violations: Vec<Violation>,
}

// ─── Request ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
  pub section_id:    String,
  pub instructor_id: String,
  pub expected_size: u32,
  pub preference:    RoomPreference,
  pub slot:          TimeSlot,
}

impl ScheduleRequest {
  pub fn for_section(section_id: impl Into<String>, spec: &SectionSpec, slot: TimeSlot) -> Self {
    Self {
      section_id: section_id.into(),
      instructor_id: spec.instructor_id.clone(),
      expected_size: spec.expected_size(),
      preference: spec.room_preference.clone(),
      slot,
    }
  }
}

// ─── Availability index ──────────────────────────────────────────────────────

/// Room and lecturer calendars visible to one scheduling pass.
///
/// Successful assignments are recorded here, so later requests in the same
/// pass see them in their time-conflict checks.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityIndex {
  rooms:       BTreeMap<String, RoomCalendar>,
  instructors: BTreeMap<String, InstructorCalendar>,
}

impl AvailabilityIndex {
  pub fn insert_room(&mut self, calendar: RoomCalendar) {
    self.rooms.insert(calendar.entity.id.clone(), calendar);
  }

  pub fn insert_instructor(&mut self, calendar: InstructorCalendar) {
    self.instructors.insert(calendar.entity.id.clone(), calendar);
  }

  pub fn room(&self, room_id: &str) -> Option<&RoomCalendar> { self.rooms.get(room_id) }

  pub fn instructor(&self, instructor_id: &str) -> Option<&InstructorCalendar> {
    self.instructors.get(instructor_id)
  }

  fn record(&mut self, booking: &Booking) {
    if let Some(room) = self.rooms.get_mut(&booking.room_id) {
      room.bookings.push(booking.clone());
    }
    self
      .instructors
      .entry(booking.instructor_id.clone())
      .or_insert_with(|| InstructorCalendar::new(&StreamId::lecturer(booking.instructor_id.clone())))
      .bookings
      .push(booking.clone());
  }
}

// ─── Solver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConstraintSolver {
  weights: SoftWeights,
}

impl ConstraintSolver {
  pub fn new(weights: SoftWeights) -> Self { Self { weights } }

  pub fn weights(&self) -> &SoftWeights { &self.weights }

  /// Pick a room for `request` among `candidate_rooms`.
  ///
  /// On success the booking is recorded in `index`. When no room passes the
  /// hard constraints the error lists every violation of every candidate,
  /// ordered by room id.
  pub fn schedule(
    &self,
    request: &ScheduleRequest,
    candidate_rooms: &[String],
    index: &mut AvailabilityIndex,
  ) -> Result<Assignment> {
    request.slot.validate()?;

    let candidates: BTreeSet<&str> = candidate_rooms.iter().map(String::as_str).collect();
    let lecturer = index.instructor(&request.instructor_id);
    let lecturer_violations = instructor_violations(request, lecturer);

    let mut best: Option<(f64, &RoomCalendar)> = None;
    let mut conflicts = Vec::new();

    for room_id in candidates {
      let Some(room) = index.room(room_id).filter(|r| r.is_registered()) else {
        let mut violations = vec![Violation::RoomUnregistered];
        violations.extend(lecturer_violations.iter().cloned());
        conflicts.push(RoomConflict { room_id: room_id.to_owned(), violations });
        continue;
      };

      let mut violations = room_violations(request, room);
      violations.extend(lecturer_violations.iter().cloned());
      if !violations.is_empty() {
        conflicts.push(RoomConflict { room_id: room_id.to_owned(), violations });
        continue;
      }

      let score = self.score(request, room, lecturer);
      // Strictly greater: on a tie the earlier (lower) room id stays.
      if best.is_none_or(|(top, _)| score > top) {
        best = Some((score, room));
      }
    }

    let Some((score, room)) = best else {
      return Err(Error::Conflict(conflicts));
    };

    let assignment = Assignment {
      section_id: request.section_id.clone(),
      room_id: room.resource_id().to_owned(),
      instructor_id: request.instructor_id.clone(),
      building: room.building().to_owned(),
      slot: request.slot,
      score,
    };
    index.record(&assignment.booking());
    Ok(assignment)
  }

  /// Weighted soft score of a feasible room.
  pub fn score(
    &self,
    request: &ScheduleRequest,
    room: &RoomCalendar,
    lecturer: Option<&InstructorCalendar>,
  ) -> f64 {
    let w = &self.weights;
    w.preference * preference_score(&request.preference, room)
      + w.capacity_fit * capacity_fit(request.expected_size, room.capacity())
      + w.travel * travel_score(request.slot, room, lecturer, w.travel_buffer_minutes)
      + w.balance * balance_score(request.slot, room)
  }
}

// ─── Hard constraints ────────────────────────────────────────────────────────

fn room_violations<R: Bookable>(request: &ScheduleRequest, room: &R) -> Vec<Violation> {
  let mut violations = Vec::new();
  if room.capacity() < request.expected_size {
    violations.push(Violation::RoomCapacity {
      capacity: room.capacity(),
      required: request.expected_size,
    });
  }
  violations.extend(room.clashes(&request.slot).map(|b| Violation::RoomBooked {
    section_id: b.section_id.clone(),
    slot:       b.slot,
  }));
  violations
}

fn instructor_violations(
  request: &ScheduleRequest,
  lecturer: Option<&InstructorCalendar>,
) -> Vec<Violation> {
  let mut violations = Vec::new();
  if !lecturer.is_some_and(|l| l.is_available(&request.slot)) {
    violations.push(Violation::InstructorUnavailable {
      instructor_id: request.instructor_id.clone(),
      slot:          request.slot,
    });
  }
  if let Some(lecturer) = lecturer {
    violations.extend(
      lecturer
        .bookings
        .iter()
        .filter(|b| b.slot.overlaps(&request.slot))
        .map(|b| Violation::InstructorBooked {
          section_id: b.section_id.clone(),
          slot:       b.slot,
        }),
    );
  }
  violations
}

// ─── Soft constraints ────────────────────────────────────────────────────────

fn preference_score(preference: &RoomPreference, room: &RoomCalendar) -> f64 {
  let Some(spec) = &room.spec else { return 0.0 };
  if preference.is_empty() {
    return 1.0;
  }

  let mut parts = Vec::new();
  if let Some(wanted) = &preference.room_type {
    parts.push(if spec.room_type.as_ref() == Some(wanted) { 1.0 } else { 0.0 });
  }
  if !preference.equipment.is_empty() {
    let present = preference.equipment.intersection(&spec.equipment).count();
    parts.push(present as f64 / preference.equipment.len() as f64);
  }
  if let Some(building) = &preference.building {
    parts.push(if &spec.building == building { 1.0 } else { 0.0 });
  }
  parts.iter().sum::<f64>() / parts.len() as f64
}

fn capacity_fit(required: u32, capacity: u32) -> f64 {
  if capacity == 0 {
    return 0.0;
  }
  let wasted = capacity.saturating_sub(required);
  1.0 - f64::from(wasted) / f64::from(capacity)
}

fn travel_score(
  slot: TimeSlot,
  room: &RoomCalendar,
  lecturer: Option<&InstructorCalendar>,
  buffer_minutes: i64,
) -> f64 {
  let Some(lecturer) = lecturer else { return 1.0 };
  let buffer = TimeDelta::minutes(buffer_minutes);
  let rushed = lecturer.bookings.iter().any(|b| {
    b.building != room.building() && b.slot.gap_to(&slot).is_some_and(|gap| gap < buffer)
  });
  if rushed { 0.0 } else { 1.0 }
}

fn balance_score(slot: TimeSlot, room: &RoomCalendar) -> f64 {
  let same_day = room.bookings.iter().filter(|b| b.slot.day == slot.day).count();
  1.0 / (1.0 + same_day as f64)
}
