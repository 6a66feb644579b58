//! Aggregate state and the deterministic reducer.
//!
//! [`StreamState::apply`] is the only way state changes: replaying the same
//! events always yields the same state, on every node. Events an aggregate
//! does not consume still advance its version.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  academic::{Grade, GradeLevel, SectionSpec, WaitlistEntry},
  calendar::{Assignment, Booking, RoomSpec, TimeSlot},
  entity::{Bookable, Enrollable, Entity},
  event::{Event, EventPayload},
  stream::{EntityKind, StreamId},
};

// ─── Section ─────────────────────────────────────────────────────────────────

/// Enrollment state of one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRoster {
  pub entity:     Entity,
  pub spec:       Option<SectionSpec>,
  /// Enrolled students and the time they asked for their seat.
  pub enrolled:   BTreeMap<String, DateTime<Utc>>,
  /// Kept in promotion order.
  pub waitlist:   Vec<WaitlistEntry>,
  pub assignment: Option<Assignment>,
}

impl SectionRoster {
  pub fn new(stream_id: &StreamId) -> Self {
    Self {
      entity:     Entity::new(stream_id),
      spec:       None,
      enrolled:   BTreeMap::new(),
      waitlist:   Vec::new(),
      assignment: None,
    }
  }

  pub fn section_id(&self) -> &str { &self.entity.id }

  pub fn capacity(&self) -> u32 { self.spec.as_ref().map_or(0, |s| s.capacity) }

  /// `None` when the waitlist is unbounded.
  pub fn waitlist_capacity(&self) -> Option<u32> {
    self.spec.as_ref().and_then(|s| s.waitlist_capacity)
  }

  pub fn waitlist_has_room(&self) -> bool {
    self.waitlist_capacity().is_none_or(|cap| (self.waitlist.len() as u32) < cap)
  }

  pub fn occupied(&self) -> u32 { self.enrolled.len() as u32 }

  pub fn free_seats(&self) -> u32 { self.capacity().saturating_sub(self.occupied()) }

  pub fn is_enrolled(&self, student_id: &str) -> bool { self.enrolled.contains_key(student_id) }

  /// 1-based position on the waitlist.
  pub fn waitlist_position(&self, student_id: &str) -> Option<usize> {
    self
      .waitlist
      .iter()
      .position(|e| e.student_id == student_id)
      .map(|i| i + 1)
  }

  /// A seat is free while someone is still waiting for one.
  pub fn needs_promotion(&self) -> bool { self.free_seats() > 0 && !self.waitlist.is_empty() }

  fn apply(&mut self, payload: &EventPayload) {
    match payload {
      EventPayload::SectionOpened(spec) => self.spec = Some(spec.clone()),
      EventPayload::Enrolled(enrollment) => {
        self.remove_waiting(&enrollment.student_id);
        self
          .enrolled
          .insert(enrollment.student_id.clone(), enrollment.requested_at);
      }
      EventPayload::Waitlisted(entry) => {
        self.remove_waiting(&entry.student_id);
        let at = self
          .waitlist
          .partition_point(|e| e.promotion_order(entry).is_lt());
        self.waitlist.insert(at, entry.clone());
      }
      EventPayload::Dropped { student_id } => {
        self.enrolled.remove(student_id);
      }
      EventPayload::WaitlistRemoved { student_id, .. } => self.remove_waiting(student_id),
      EventPayload::SectionScheduled(assignment) => self.assignment = Some(assignment.clone()),
      EventPayload::SectionUnscheduled { .. } => self.assignment = None,
      _ => {}
    }
  }

  fn remove_waiting(&mut self, student_id: &str) {
    self.waitlist.retain(|e| e.student_id != student_id);
  }
}

// ─── Room ────────────────────────────────────────────────────────────────────

/// A room and what is booked into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCalendar {
  pub entity:   Entity,
  pub spec:     Option<RoomSpec>,
  pub bookings: Vec<Booking>,
}

impl RoomCalendar {
  pub fn new(stream_id: &StreamId) -> Self {
    Self { entity: Entity::new(stream_id), spec: None, bookings: Vec::new() }
  }

  pub fn is_registered(&self) -> bool { self.spec.is_some() }

  fn apply(&mut self, payload: &EventPayload) {
    match payload {
      EventPayload::RoomRegistered(spec) => self.spec = Some(spec.clone()),
      EventPayload::Booked(booking) => self.bookings.push(booking.clone()),
      EventPayload::BookingReleased { section_id } => {
        self.bookings.retain(|b| &b.section_id != section_id)
      }
      _ => {}
    }
  }
}

impl Bookable for RoomCalendar {
  fn resource_id(&self) -> &str { &self.entity.id }

  fn building(&self) -> &str { self.spec.as_ref().map_or("", |s| s.building.as_str()) }

  fn capacity(&self) -> u32 { self.spec.as_ref().map_or(0, |s| s.capacity) }

  fn bookings(&self) -> &[Booking] { &self.bookings }
}

// ─── Lecturer ────────────────────────────────────────────────────────────────

/// A lecturer's declared availability and teaching bookings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructorCalendar {
  pub entity:       Entity,
  pub availability: Vec<TimeSlot>,
  pub bookings:     Vec<Booking>,
}

impl InstructorCalendar {
  pub fn new(stream_id: &StreamId) -> Self {
    Self {
      entity:       Entity::new(stream_id),
      availability: Vec::new(),
      bookings:     Vec::new(),
    }
  }

  pub fn instructor_id(&self) -> &str { &self.entity.id }

  pub fn is_available(&self, slot: &TimeSlot) -> bool {
    self.availability.iter().any(|w| w.contains(slot))
  }

  fn apply(&mut self, payload: &EventPayload) {
    match payload {
      EventPayload::AvailabilityDeclared { windows } => self.availability = windows.clone(),
      EventPayload::Booked(booking) => self.bookings.push(booking.clone()),
      EventPayload::BookingReleased { section_id } => {
        self.bookings.retain(|b| &b.section_id != section_id)
      }
      _ => {}
    }
  }
}

// ─── Student ─────────────────────────────────────────────────────────────────

/// A student's academic record as far as enrollment policy cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
  pub entity:      Entity,
  pub gpa:         Option<f32>,
  pub grade_level: GradeLevel,
  /// Latest grade per completed course.
  pub completed:   BTreeMap<String, Grade>,
}

impl StudentRecord {
  pub fn new(stream_id: &StreamId) -> Self {
    Self {
      entity:      Entity::new(stream_id),
      gpa:         None,
      grade_level: GradeLevel::default(),
      completed:   BTreeMap::new(),
    }
  }

  fn apply(&mut self, payload: &EventPayload) {
    match payload {
      EventPayload::StudentProfiled { gpa, grade_level } => {
        self.gpa = *gpa;
        self.grade_level = *grade_level;
      }
      EventPayload::CourseCompleted { course_id, grade } => {
        self.completed.insert(course_id.clone(), *grade);
      }
      _ => {}
    }
  }
}

impl Enrollable for StudentRecord {
  fn student_id(&self) -> &str { &self.entity.id }

  fn gpa(&self) -> Option<f32> { self.gpa }

  fn grade_level(&self) -> GradeLevel { self.grade_level }

  fn grade_for(&self, course_id: &str) -> Option<Grade> { self.completed.get(course_id).copied() }
}

// ─── StreamState ─────────────────────────────────────────────────────────────

/// Materialised state of any stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum StreamState {
  Section(SectionRoster),
  Room(RoomCalendar),
  Lecturer(InstructorCalendar),
  Student(StudentRecord),
}

impl StreamState {
  /// The state of a stream before its first event.
  pub fn empty(stream_id: &StreamId) -> Self {
    match stream_id.kind() {
      EntityKind::Section => Self::Section(SectionRoster::new(stream_id)),
      EntityKind::Room => Self::Room(RoomCalendar::new(stream_id)),
      EntityKind::Lecturer => Self::Lecturer(InstructorCalendar::new(stream_id)),
      EntityKind::Student => Self::Student(StudentRecord::new(stream_id)),
    }
  }

  pub fn entity(&self) -> &Entity {
    match self {
      Self::Section(s) => &s.entity,
      Self::Room(r) => &r.entity,
      Self::Lecturer(l) => &l.entity,
      Self::Student(s) => &s.entity,
    }
  }

  fn entity_mut(&mut self) -> &mut Entity {
    match self {
      Self::Section(s) => &mut s.entity,
      Self::Room(r) => &mut r.entity,
      Self::Lecturer(l) => &mut l.entity,
      Self::Student(s) => &mut s.entity,
    }
  }

  pub fn stream_id(&self) -> StreamId { self.entity().stream_id() }

  pub fn version(&self) -> u64 { self.entity().version }

  /// Fold one event into the state. The caller guarantees version order.
  pub fn apply(&mut self, event: &Event) {
    match self {
      Self::Section(s) => s.apply(&event.payload),
      Self::Room(r) => r.apply(&event.payload),
      Self::Lecturer(l) => l.apply(&event.payload),
      Self::Student(s) => s.apply(&event.payload),
    }
    self.entity_mut().touch(event);
  }

  pub fn into_section(self) -> Option<SectionRoster> {
    match self {
      Self::Section(s) => Some(s),
      _ => None,
    }
  }

  pub fn into_room(self) -> Option<RoomCalendar> {
    match self {
      Self::Room(r) => Some(r),
      _ => None,
    }
  }

  pub fn into_lecturer(self) -> Option<InstructorCalendar> {
    match self {
      Self::Lecturer(l) => Some(l),
      _ => None,
    }
  }

  pub fn into_student(self) -> Option<StudentRecord> {
    match self {
      Self::Student(s) => Some(s),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::{NaiveTime, TimeZone, Weekday};

  use super::*;
  use crate::{
    academic::{Enrollment, Prerequisite},
    calendar::RoomPreference,
    event::NewEvent,
  };

  fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, minute, 0).unwrap()
  }

  fn replay(stream_id: &StreamId, payloads: Vec<EventPayload>) -> StreamState {
    let mut state = StreamState::empty(stream_id);
    for (i, payload) in payloads.into_iter().enumerate() {
      let event = Event::committed(stream_id.clone(), i as u64 + 1, NewEvent::new(payload));
      state.apply(&event);
    }
    state
  }

  fn spec(capacity: u32) -> SectionSpec {
    SectionSpec {
      course_id: "CS301".into(),
      instructor_id: "lee".into(),
      capacity,
      waitlist_capacity: Some(5),
      expected_size: None,
      prerequisites: vec![Prerequisite::passing("CS201")],
      room_preference: RoomPreference::default(),
    }
  }

  fn enrolled(id: &str, minute: u32) -> EventPayload {
    EventPayload::Enrolled(Enrollment {
      student_id:   id.into(),
      requested_at: at(minute),
      promoted:     false,
    })
  }

  fn waitlisted(id: &str, priority: i64, minute: u32) -> EventPayload {
    EventPayload::Waitlisted(WaitlistEntry {
      student_id: id.into(),
      priority,
      requested_at: at(minute),
    })
  }

  #[test]
  fn roster_tracks_seats_and_waitlist_order() {
    let id = StreamId::section("CS301-A");
    let state = replay(&id, vec![
      EventPayload::SectionOpened(spec(2)),
      enrolled("a", 0),
      enrolled("b", 1),
      waitlisted("c", 5, 2),
      waitlisted("d", 20, 3),
      waitlisted("e", 5, 1),
    ]);

    assert_eq!(state.version(), 6);
    let roster = state.into_section().unwrap();
    assert_eq!(roster.occupied(), 2);
    assert_eq!(roster.free_seats(), 0);
    let order: Vec<&str> = roster.waitlist.iter().map(|e| e.student_id.as_str()).collect();
    assert_eq!(order, ["d", "e", "c"]);
    assert_eq!(roster.waitlist_position("c"), Some(3));
    assert!(!roster.needs_promotion());
  }

  #[test]
  fn drop_frees_seat_and_enrolled_event_clears_waitlist_entry() {
    let id = StreamId::section("CS301-A");
    let state = replay(&id, vec![
      EventPayload::SectionOpened(spec(1)),
      enrolled("a", 0),
      waitlisted("b", 0, 1),
      EventPayload::Dropped { student_id: "a".into() },
    ]);
    let roster = state.clone().into_section().unwrap();
    assert!(roster.needs_promotion());

    let mut state = state;
    state.apply(&Event::committed(id.clone(), 5, NewEvent::new(enrolled("b", 1))));
    let roster = state.into_section().unwrap();
    assert!(roster.is_enrolled("b"));
    assert!(roster.waitlist.is_empty());
    assert!(!roster.needs_promotion());
  }

  #[test]
  fn calendars_book_and_release() {
    let slot = TimeSlot::new(
      Weekday::Tue,
      NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
      NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
    )
    .unwrap();
    let booking = Booking {
      section_id:    "CS301-A".into(),
      room_id:       "B-101".into(),
      instructor_id: "lee".into(),
      building:      "B".into(),
      slot,
    };

    let id = StreamId::room("B-101");
    let state = replay(&id, vec![
      EventPayload::RoomRegistered(RoomSpec {
        room_id:   "B-101".into(),
        building:  "B".into(),
        capacity:  40,
        room_type: Some("lecture".into()),
        equipment: Default::default(),
      }),
      EventPayload::Booked(booking.clone()),
    ]);
    let room = state.clone().into_room().unwrap();
    assert_eq!(room.capacity(), 40);
    assert_eq!(room.clashes(&slot).count(), 1);

    let mut state = state;
    state.apply(&Event::committed(
      id,
      3,
      NewEvent::new(EventPayload::BookingReleased { section_id: "CS301-A".into() }),
    ));
    assert!(state.into_room().unwrap().bookings.is_empty());
  }

  #[test]
  fn student_record_keeps_latest_grade_and_entity_header() {
    let id = StreamId::student("s-1");
    let state = replay(&id, vec![
      EventPayload::StudentProfiled { gpa: Some(3.6), grade_level: GradeLevel::Senior },
      EventPayload::CourseCompleted { course_id: "CS201".into(), grade: Grade::F },
      EventPayload::CourseCompleted { course_id: "CS201".into(), grade: Grade::B },
    ]);
    assert_eq!(state.entity().status, crate::entity::EntityStatus::Active);
    let record = state.into_student().unwrap();
    assert_eq!(record.grade_for("CS201"), Some(Grade::B));
    assert_eq!(record.grade_level(), GradeLevel::Senior);
    assert_eq!(record.entity.version, 3);
  }

  #[test]
  fn unrelated_events_only_advance_version() {
    let id = StreamId::student("s-2");
    let state = replay(&id, vec![EventPayload::Dropped { student_id: "x".into() }]);
    assert_eq!(state.version(), 1);
    assert!(state.into_student().unwrap().completed.is_empty());
  }

  #[test]
  fn state_serializes_with_kind_tag() {
    let id = StreamId::lecturer("lee");
    let json = serde_json::to_value(StreamState::empty(&id)).unwrap();
    assert_eq!(json["kind"], "lecturer");
    assert_eq!(json["state"]["entity"]["id"], "lee");
  }
}
