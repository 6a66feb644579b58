//! Ordered enrollment policies.
//!
//! Policies run in their declared order. The first one that rejects ends the
//! evaluation; a waitlist verdict is remembered and the remaining policies
//! still run, so a full section never hides a missing prerequisite.

use argos_core::{entity::Enrollable, state::SectionRoster};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, priority::PriorityWeights};

// ─── Verdicts ────────────────────────────────────────────────────────────────

/// What a single policy says about a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
  Pass,
  Waitlist,
  Reject(String),
}

/// The combined outcome of every policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
  Accept,
  Waitlist { priority: i64 },
  Reject { policy: String, reason: String },
}

// ─── Policy trait ────────────────────────────────────────────────────────────

pub trait EnrollmentPolicy: Send + Sync {
  fn name(&self) -> &'static str;

  fn check(&self, student: &dyn Enrollable, section: &SectionRoster) -> Verdict;

  /// Policies that order the waitlist report a score here.
  fn priority(&self, _student: &dyn Enrollable) -> Option<i64> { None }
}

/// Every declared prerequisite must be completed with at least its minimum
/// grade.
pub struct PrerequisiteCheck;

impl EnrollmentPolicy for PrerequisiteCheck {
  fn name(&self) -> &'static str { "prerequisite" }

  fn check(&self, student: &dyn Enrollable, section: &SectionRoster) -> Verdict {
    let Some(spec) = &section.spec else { return Verdict::Pass };

    let missing: Vec<String> = spec
      .prerequisites
      .iter()
      .filter(|p| {
        !student
          .grade_for(&p.course_id)
          .is_some_and(|grade| grade.meets(p.min_grade))
      })
      .map(|p| format!("{} (minimum {:?})", p.course_id, p.min_grade))
      .collect();

    if missing.is_empty() {
      Verdict::Pass
    } else {
      Verdict::Reject(format!("missing prerequisites: {}", missing.join(", ")))
    }
  }
}

/// Seats first, then the waitlist, then nothing.
pub struct Quota;

impl EnrollmentPolicy for Quota {
  fn name(&self) -> &'static str { "quota" }

  fn check(&self, _student: &dyn Enrollable, section: &SectionRoster) -> Verdict {
    if section.occupied() < section.capacity() {
      Verdict::Pass
    } else if section.waitlist_has_room() {
      Verdict::Waitlist
    } else {
      Verdict::Reject(format!(
        "section full ({}/{}) and waitlist full ({}/{})",
        section.occupied(),
        section.capacity(),
        section.waitlist.len(),
        section.waitlist_capacity().unwrap_or_default()
      ))
    }
  }
}

/// Never rejects; supplies the waitlist score.
pub struct Priority(pub PriorityWeights);

impl EnrollmentPolicy for Priority {
  fn name(&self) -> &'static str { "priority" }

  fn check(&self, _student: &dyn Enrollable, _section: &SectionRoster) -> Verdict { Verdict::Pass }

  fn priority(&self, student: &dyn Enrollable) -> Option<i64> { Some(self.0.score(student)) }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct PolicyEngine {
  policies: Vec<Box<dyn EnrollmentPolicy>>,
}

impl PolicyEngine {
  /// Prerequisite, then quota, then priority.
  pub fn standard(weights: PriorityWeights) -> Self {
    Self::new(vec![
      Box::new(PrerequisiteCheck),
      Box::new(Quota),
      Box::new(Priority(weights)),
    ])
  }

  pub fn new(policies: Vec<Box<dyn EnrollmentPolicy>>) -> Self { Self { policies } }

  pub fn policy_names(&self) -> Vec<&'static str> {
    self.policies.iter().map(|p| p.name()).collect()
  }

  /// The waitlist score from the first policy that reports one.
  pub fn priority(&self, student: &dyn Enrollable) -> i64 {
    self
      .policies
      .iter()
      .find_map(|p| p.priority(student))
      .unwrap_or(0)
  }

  pub fn evaluate(&self, student: &dyn Enrollable, section: &SectionRoster) -> Result<Decision> {
    if section.spec.is_none() {
      return Err(Error::SectionNotOpen(section.section_id().to_owned()));
    }

    let mut waitlist = false;
    for policy in &self.policies {
      match policy.check(student, section) {
        Verdict::Pass => {}
        Verdict::Waitlist => waitlist = true,
        Verdict::Reject(reason) => {
          return Ok(Decision::Reject { policy: policy.name().to_owned(), reason });
        }
      }
    }

    Ok(if waitlist {
      Decision::Waitlist { priority: self.priority(student) }
    } else {
      Decision::Accept
    })
  }
}
