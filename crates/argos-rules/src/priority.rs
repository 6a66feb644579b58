//! Waitlist priority scoring.
//!
//! The score is a grade-level tier weight plus the bonus of the best GPA band
//! the student reaches. Ties are broken by request time in
//! [`argos_core::academic::WaitlistEntry::promotion_order`].

use argos_core::{academic::GradeLevel, entity::Enrollable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpaBand {
  pub min_gpa: f32,
  pub bonus:   i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
  pub freshman:  i64,
  pub sophomore: i64,
  pub junior:    i64,
  pub senior:    i64,
  pub graduate:  i64,
  pub gpa_bands: Vec<GpaBand>,
}

impl Default for PriorityWeights {
  fn default() -> Self {
    Self {
      freshman:  0,
      sophomore: 5,
      junior:    10,
      senior:    15,
      graduate:  20,
      gpa_bands: vec![
        GpaBand { min_gpa: 3.5, bonus: 10 },
        GpaBand { min_gpa: 3.0, bonus: 5 },
      ],
    }
  }
}

impl PriorityWeights {
  pub fn tier(&self, level: GradeLevel) -> i64 {
    match level {
      GradeLevel::Freshman => self.freshman,
      GradeLevel::Sophomore => self.sophomore,
      GradeLevel::Junior => self.junior,
      GradeLevel::Senior => self.senior,
      GradeLevel::Graduate => self.graduate,
    }
  }

  pub fn gpa_bonus(&self, gpa: Option<f32>) -> i64 {
    let Some(gpa) = gpa else { return 0 };
    self
      .gpa_bands
      .iter()
      .filter(|band| gpa >= band.min_gpa)
      .map(|band| band.bonus)
      .max()
      .unwrap_or(0)
  }

  pub fn score(&self, student: &dyn Enrollable) -> i64 {
    self.tier(student.grade_level()) + self.gpa_bonus(student.gpa())
  }
}
