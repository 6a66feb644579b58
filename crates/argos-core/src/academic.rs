//! Enrollment-side domain types: grades, sections and waitlist entries.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::RoomPreference;

// ─── Grades ──────────────────────────────────────────────────────────────────

/// A final letter grade for a completed course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
  A,
  B,
  C,
  D,
  F,
}

impl Grade {
  /// The lowest grade that counts as a pass.
  pub const PASSING: Grade = Grade::D;

  pub fn points(self) -> u8 {
    match self {
      Self::A => 4,
      Self::B => 3,
      Self::C => 2,
      Self::D => 1,
      Self::F => 0,
    }
  }

  pub fn is_passing(self) -> bool { self.meets(Self::PASSING) }

  /// Whether this grade is at least `minimum`.
  pub fn meets(self, minimum: Grade) -> bool { self.points() >= minimum.points() }
}

/// Academic standing used for waitlist priority tiers.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum GradeLevel {
  #[default]
  Freshman,
  Sophomore,
  Junior,
  Senior,
  Graduate,
}

// ─── Sections ────────────────────────────────────────────────────────────────

fn passing() -> Grade { Grade::PASSING }

/// A course that must be completed before enrolling in a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisite {
  pub course_id: String,
  #[serde(default = "passing")]
  pub min_grade: Grade,
}

impl Prerequisite {
  pub fn passing(course_id: impl Into<String>) -> Self {
    Self { course_id: course_id.into(), min_grade: Grade::PASSING }
  }
}

/// Everything declared when a section is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
  pub course_id:         String,
  pub instructor_id:     String,
  pub capacity:          u32,
  /// Unbounded when absent.
  #[serde(default)]
  pub waitlist_capacity: Option<u32>,
  /// Headcount a room must hold; defaults to `capacity`.
  #[serde(default)]
  pub expected_size:     Option<u32>,
  #[serde(default)]
  pub prerequisites:     Vec<Prerequisite>,
  #[serde(default)]
  pub room_preference:   RoomPreference,
}

impl SectionSpec {
  pub fn expected_size(&self) -> u32 { self.expected_size.unwrap_or(self.capacity) }
}

// ─── Roster entries ──────────────────────────────────────────────────────────

/// A seat granted to a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
  pub student_id:   String,
  pub requested_at: DateTime<Utc>,
  /// `true` when the seat came from the waitlist.
  #[serde(default)]
  pub promoted:     bool,
}

/// A student queued for a seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
  pub student_id:   String,
  pub priority:     i64,
  pub requested_at: DateTime<Utc>,
}

impl WaitlistEntry {
  /// Promotion order: higher priority first, then earlier request, then
  /// student id so that the order is total.
  pub fn promotion_order(&self, other: &Self) -> Ordering {
    other
      .priority
      .cmp(&self.priority)
      .then(self.requested_at.cmp(&other.requested_at))
      .then_with(|| self.student_id.cmp(&other.student_id))
  }
}
