//! Commands, their envelope and their outcomes.

use std::time::Duration;

use argos_core::{
  academic::{Grade, GradeLevel, SectionSpec},
  calendar::{Assignment, RoomSpec, TimeSlot},
  principal::{Capability, Principal},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CommandError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
  OpenSection {
    section_id: String,
    spec:       SectionSpec,
  },
  RegisterRoom {
    spec: RoomSpec,
  },
  DeclareAvailability {
    instructor_id: String,
    windows:       Vec<TimeSlot>,
  },
  ProfileStudent {
    student_id:  String,
    #[serde(default)]
    gpa:         Option<f32>,
    #[serde(default)]
    grade_level: GradeLevel,
  },
  RecordCompletion {
    student_id: String,
    course_id:  String,
    grade:      Grade,
  },
  Enroll {
    section_id:   String,
    student_id:   String,
    /// Defaults to the time the command is decided.
    #[serde(default)]
    requested_at: Option<DateTime<Utc>>,
  },
  Drop {
    section_id: String,
    student_id: String,
  },
  PromoteWaitlist {
    section_id: String,
  },
  Schedule {
    section_id:      String,
    slot:            TimeSlot,
    candidate_rooms: Vec<String>,
  },
  Unschedule {
    section_id: String,
  },
}

impl Command {
  pub fn name(&self) -> &'static str {
    match self {
      Self::OpenSection { .. } => "open_section",
      Self::RegisterRoom { .. } => "register_room",
      Self::DeclareAvailability { .. } => "declare_availability",
      Self::ProfileStudent { .. } => "profile_student",
      Self::RecordCompletion { .. } => "record_completion",
      Self::Enroll { .. } => "enroll",
      Self::Drop { .. } => "drop",
      Self::PromoteWaitlist { .. } => "promote_waitlist",
      Self::Schedule { .. } => "schedule",
      Self::Unschedule { .. } => "unschedule",
    }
  }

  /// What the authorization layer must have granted before submission.
  pub fn required_capability(&self) -> Capability {
    match self {
      Self::OpenSection { .. } | Self::RegisterRoom { .. } | Self::DeclareAvailability { .. } => {
        Capability::ManageCatalog
      }
      Self::ProfileStudent { .. } | Self::RecordCompletion { .. } => Capability::ManageRecords,
      Self::Enroll { .. } | Self::Drop { .. } | Self::PromoteWaitlist { .. } => Capability::Enroll,
      Self::Schedule { .. } | Self::Unschedule { .. } => Capability::Schedule,
    }
  }

  /// Checks that need no state.
  pub fn validate(&self) -> Result<(), CommandError> {
    fn id(field: &str, value: &str) -> Result<(), CommandError> {
      if value.trim().is_empty() {
        return Err(CommandError::invalid(format!("{field} must not be empty")));
      }
      Ok(())
    }

    match self {
      Self::OpenSection { section_id, spec } => {
        id("section_id", section_id)?;
        id("course_id", &spec.course_id)?;
        id("instructor_id", &spec.instructor_id)?;
        if spec.capacity == 0 {
          return Err(CommandError::invalid("capacity must be at least 1"));
        }
      }
      Self::RegisterRoom { spec } => {
        id("room_id", &spec.room_id)?;
        id("building", &spec.building)?;
      }
      Self::DeclareAvailability { instructor_id, windows } => {
        id("instructor_id", instructor_id)?;
        for window in windows {
          window.validate().map_err(|err| CommandError::invalid(err.to_string()))?;
        }
      }
      Self::ProfileStudent { student_id, gpa, .. } => {
        id("student_id", student_id)?;
        if let Some(gpa) = gpa
          && !(0.0..=4.0).contains(gpa)
        {
          return Err(CommandError::invalid(format!("gpa {gpa} is outside 0.0..=4.0")));
        }
      }
      Self::RecordCompletion { student_id, course_id, .. } => {
        id("student_id", student_id)?;
        id("course_id", course_id)?;
      }
      Self::Enroll { section_id, student_id, .. } | Self::Drop { section_id, student_id } => {
        id("section_id", section_id)?;
        id("student_id", student_id)?;
      }
      Self::PromoteWaitlist { section_id } | Self::Unschedule { section_id } => {
        id("section_id", section_id)?;
      }
      Self::Schedule { section_id, slot, candidate_rooms } => {
        id("section_id", section_id)?;
        slot.validate().map_err(|err| CommandError::invalid(err.to_string()))?;
        if candidate_rooms.is_empty() {
          return Err(CommandError::invalid("at least one candidate room is required"));
        }
        for room in candidate_rooms {
          id("candidate room", room)?;
        }
      }
    }
    Ok(())
  }
}

/// A command with the caller's identity and time budget.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
  pub principal:      Principal,
  pub command:        Command,
  pub correlation_id: Uuid,
  /// No commit is attempted after this instant.
  pub deadline:       Instant,
}

impl CommandEnvelope {
  pub fn new(principal: Principal, command: Command, timeout: Duration) -> Self {
    Self {
      principal,
      command,
      correlation_id: Uuid::new_v4(),
      deadline: Instant::now() + timeout,
    }
  }

  pub fn correlated(mut self, correlation_id: Uuid) -> Self {
    self.correlation_id = correlation_id;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
  Opened,
  Registered,
  Recorded,
  Enrolled,
  Waitlisted { position: usize, priority: i64 },
  AlreadyEnrolled,
  AlreadyWaitlisted,
  Dropped { promoted: Vec<String>, removed: Vec<String> },
  Promoted { promoted: Vec<String>, removed: Vec<String> },
  Scheduled(Assignment),
  Unscheduled,
}

/// An outcome and the log index it was committed at. Outcomes that wrote
/// nothing carry the commit index they were decided against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committed {
  pub index:   u64,
  #[serde(flatten)]
  pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
  use chrono::{NaiveTime, Weekday};

  use super::*;

  #[test]
  fn commands_use_a_type_tag() {
    let json = serde_json::json!({
      "type": "enroll",
      "section_id": "CS301-A",
      "student_id": "s-1"
    });
    let command: Command = serde_json::from_value(json).unwrap();
    assert_eq!(command, Command::Enroll {
      section_id:   "CS301-A".into(),
      student_id:   "s-1".into(),
      requested_at: None,
    });
    assert_eq!(command.name(), "enroll");
    assert_eq!(command.required_capability(), Capability::Enroll);
  }

  #[test]
  fn committed_flattens_the_outcome() {
    let committed = Committed {
      index:   7,
      outcome: Outcome::Waitlisted { position: 2, priority: 15 },
    };
    let json = serde_json::to_value(&committed).unwrap();
    assert_eq!(json, serde_json::json!({
      "index": 7,
      "outcome": "waitlisted",
      "position": 2,
      "priority": 15
    }));
  }

  #[test]
  fn validation_catches_malformed_commands() {
    let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
    let bad_slot = Command::Schedule {
      section_id:      "CS301-A".into(),
      slot:            TimeSlot { day: Weekday::Mon, start: nine, end: nine },
      candidate_rooms: vec!["R1".into()],
    };
    assert!(matches!(bad_slot.validate(), Err(CommandError::Invalid(_))));

    let no_rooms = Command::Schedule {
      section_id:      "CS301-A".into(),
      slot:            TimeSlot {
        day:   Weekday::Mon,
        start: nine,
        end:   NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
      },
      candidate_rooms: vec![],
    };
    assert!(no_rooms.validate().is_err());

    let gpa = Command::ProfileStudent {
      student_id:  "s-1".into(),
      gpa:         Some(4.5),
      grade_level: GradeLevel::Senior,
    };
    assert!(gpa.validate().is_err());

    let blank = Command::PromoteWaitlist { section_id: "  ".into() };
    assert!(blank.validate().is_err());
  }
}
