//! Decision logic for Argos: enrollment policies and the room scheduler.
//!
//! Pure synchronous code over [`argos_core`] state; no locking, I/O or
//! consensus. Callers hold whatever locks make the inputs stable.
//!
//! # Quick start
//!
//! ```no_run
//! use argos_rules::{PolicyEngine, priority::PriorityWeights};
//! # fn demo(student: &argos_core::state::StudentRecord, roster: &argos_core::state::SectionRoster) {
//! let engine = PolicyEngine::standard(PriorityWeights::default());
//! let decision = engine.evaluate(student, roster).unwrap();
//! println!("{decision:?}");
//! # }
//! ```

pub mod error;
pub mod policy;
pub mod priority;
pub mod solver;

pub use error::{Error, Result};
pub use policy::{Decision, EnrollmentPolicy, PolicyEngine};
pub use solver::{AvailabilityIndex, ConstraintSolver, RoomConflict, ScheduleRequest, Violation};
