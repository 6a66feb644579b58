//! The single write path: locks, decision, consensus, outcome.
//!
//! Every attempt runs the decision twice. The first run, against unlocked
//! state, only plans which locks to take; the second, under those locks, is
//! the one that commits. If the locked state turns out to need locks outside
//! the plan, the attempt lets go and replans with the union.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use argos_core::{
  academic::{Enrollment, WaitlistEntry},
  event::{Event, EventPayload, NewEvent, StreamAppend},
  state::{InstructorCalendar, RoomCalendar, SectionRoster, StreamState, StudentRecord},
  store::SnapshotStore,
  stream::StreamId,
};
use argos_raft::{EntryPayload, NodeStatus, RaftConfig, RaftNode, RaftStorage, Transport};
use argos_rules::{
  AvailabilityIndex, ConstraintSolver, Decision, PolicyEngine, ScheduleRequest,
};
use chrono::Utc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  command::{Command, CommandEnvelope, Committed, Outcome},
  config::EngineConfig,
  error::CommandError,
  event_log::EventLog,
  lock::{LockManager, LockMode, LockSet},
  machine::EventLogMachine,
  retry::Backoff,
};

/// A store that can back both the event log and the consensus log.
pub trait Store: SnapshotStore + RaftStorage + Clone + 'static {}

impl<S> Store for S where S: SnapshotStore + RaftStorage + Clone + 'static {}

pub type Node<S, T> = RaftNode<S, T, EventLogMachine<S>>;

type CommandResult<T> = std::result::Result<T, CommandError>;

// ─── Decisions ───────────────────────────────────────────────────────────────

enum Effect {
  /// Nothing to write.
  Nothing(Outcome),
  Append {
    batch:   Vec<StreamAppend>,
    outcome: Outcome,
  },
}

struct Plan {
  locks:  LockSet,
  effect: Effect,
}

/// Events of one command, grouped per stream, each group guarded by the
/// version its stream had when the decision was made.
struct Draft<'a> {
  envelope: &'a CommandEnvelope,
  appends:  BTreeMap<StreamId, StreamAppend>,
  /// The first event; every later one is caused by it.
  cause:    Option<Uuid>,
}

impl<'a> Draft<'a> {
  fn new(envelope: &'a CommandEnvelope) -> Self {
    Self { envelope, appends: BTreeMap::new(), cause: None }
  }

  fn emit(&mut self, stream_id: &StreamId, expected_version: u64, payload: EventPayload) {
    let event = NewEvent::new(payload)
      .correlated(self.envelope.correlation_id, self.cause)
      .with_actor(self.envelope.principal.id.clone());
    self.cause.get_or_insert(event.event_id);
    self
      .appends
      .entry(stream_id.clone())
      .or_insert_with(|| StreamAppend::new(stream_id.clone(), expected_version))
      .push(event);
  }

  fn finish(self, outcome: Outcome) -> Effect {
    Effect::Append { batch: self.appends.into_values().collect(), outcome }
  }
}

/// Seats handed out and waitlist entries dropped by one promotion pass.
#[derive(Default)]
struct Promotion {
  promoted: Vec<String>,
  removed:  Vec<String>,
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

pub struct CommandCoordinator<S: Store, T: Transport> {
  log:      Arc<EventLog<S>>,
  raft:     Node<S, T>,
  locks:    LockManager,
  policies: PolicyEngine,
  solver:   ConstraintSolver,
  config:   EngineConfig,
}

impl<S: Store, T: Transport> CommandCoordinator<S, T> {
  /// Open the event log over `store` and start this node's replica. With
  /// `resync` the local consensus log is discarded first.
  pub async fn start(
    config: EngineConfig,
    raft_config: RaftConfig,
    store: S,
    transport: T,
    resync: bool,
  ) -> argos_raft::Result<Self> {
    let log = Arc::new(EventLog::new(Arc::new(store.clone()), config.snapshot_every));
    let machine = EventLogMachine::new(Arc::clone(&log));

    let raft = if resync {
      Node::<S, T>::start_resynced(raft_config, store, transport, machine).await?
    } else {
      Node::<S, T>::start(raft_config, store, transport, machine).await?
    };

    let locks = LockManager::new(config.lease_ttl());
    locks.spawn_reaper((config.lease_ttl() / 2).max(Duration::from_millis(10)));

    info!(node_id = raft.id(), "command coordinator started");
    Ok(Self {
      log,
      raft,
      locks,
      policies: PolicyEngine::standard(config.priority.clone()),
      solver: ConstraintSolver::new(config.weights.clone()),
      config,
    })
  }

  pub fn log(&self) -> &Arc<EventLog<S>> { &self.log }

  pub fn raft(&self) -> &Node<S, T> { &self.raft }

  pub fn locks(&self) -> &LockManager { &self.locks }

  pub fn config(&self) -> &EngineConfig { &self.config }

  pub async fn status(&self) -> NodeStatus { self.raft.status().await }

  pub async fn shutdown(&self) { self.raft.shutdown().await }

  // ─── Reads ─────────────────────────────────────────────────────────────────

  /// Local state of a stream. Served without consensus: current on the
  /// leader, possibly behind on followers.
  pub async fn query(&self, stream_id: &StreamId) -> CommandResult<StreamState> {
    let state = self.log.replay(stream_id).await?;
    if state.version() == 0 {
      return Err(CommandError::NotFound(stream_id.clone()));
    }
    Ok(state)
  }

  pub async fn events(
    &self,
    stream_id: StreamId,
    from_version: u64,
    limit: usize,
  ) -> CommandResult<Vec<Event>> {
    Ok(self.log.events(stream_id, from_version, limit).await?)
  }

  // ─── Writes ────────────────────────────────────────────────────────────────

  /// Decide and commit one command, retrying transient failures with
  /// backoff until attempts run out or the deadline would pass.
  #[tracing::instrument(
    skip_all,
    fields(
      command = envelope.command.name(),
      correlation_id = %envelope.correlation_id,
      principal = %envelope.principal.id,
    )
  )]
  pub async fn submit(&self, envelope: CommandEnvelope) -> CommandResult<Committed> {
    envelope.command.validate()?;

    let mut backoff = Backoff::new(&self.config.retry);
    loop {
      match self.attempt(&envelope).await {
        Ok(committed) => {
          debug!(index = committed.index, "command committed");
          return Ok(committed);
        }
        Err(err) if err.is_retryable() && !err.is_redirect() => {
          let Some(delay) = backoff.next_delay() else { return Err(err) };
          if Instant::now() + delay >= envelope.deadline {
            return Err(err);
          }
          warn!(attempt = backoff.attempt(), %err, ?delay, "retrying command");
          sleep(delay).await;
        }
        Err(err) => return Err(err),
      }
    }
  }

  async fn attempt(&self, envelope: &CommandEnvelope) -> CommandResult<Committed> {
    let deadline = envelope.deadline;
    self.raft.read_barrier(deadline).await?;

    let mut locks = match self.decide(envelope).await {
      Ok(plan) => plan.locks,
      Err(_) => base_locks(&envelope.command),
    };

    loop {
      let now = Instant::now();
      if now >= deadline {
        return Err(CommandError::Unavailable {
          reason:      "deadline passed before the command was decided".into(),
          leader_hint: None,
        });
      }
      let wait = self.config.lock_timeout().min(deadline - now);
      let leases = self.locks.acquire_all(&locks, wait).await?;

      let plan = self.decide(envelope).await?;
      if !locks.covers(&plan.locks) {
        debug!("locked state needs more locks, replanning");
        drop(leases);
        for (key, mode) in plan.locks.iter() {
          locks.insert(key.clone(), mode);
        }
        continue;
      }

      return match plan.effect {
        Effect::Nothing(outcome) => {
          let index = self.raft.status().await.commit_index;
          Ok(Committed { index, outcome })
        }
        Effect::Append { batch, outcome } => {
          leases.ensure_valid()?;
          let applied = self.raft.propose(EntryPayload::Batch(batch), deadline).await?;
          applied.output?;
          drop(leases);
          Ok(Committed { index: applied.index, outcome })
        }
      };
    }
  }

  async fn decide(&self, envelope: &CommandEnvelope) -> CommandResult<Plan> {
    let mut draft = Draft::new(envelope);
    let mut locks = base_locks(&envelope.command);

    let effect = match &envelope.command {
      Command::OpenSection { section_id, spec } => {
        let roster = self.section(section_id).await?;
        if roster.spec.is_some() {
          return Err(CommandError::invalid(format!("section {section_id} is already open")));
        }
        draft.emit(
          &StreamId::section(section_id),
          roster.entity.version,
          EventPayload::SectionOpened(spec.clone()),
        );
        draft.finish(Outcome::Opened)
      }

      Command::RegisterRoom { spec } => {
        let room = self.room(&spec.room_id).await?;
        if room.is_registered() {
          return Err(CommandError::invalid(format!("room {} is already registered", spec.room_id)));
        }
        draft.emit(
          &StreamId::room(&spec.room_id),
          room.entity.version,
          EventPayload::RoomRegistered(spec.clone()),
        );
        draft.finish(Outcome::Registered)
      }

      Command::DeclareAvailability { instructor_id, windows } => {
        let stream_id = StreamId::lecturer(instructor_id);
        let version = self.log.head_version(stream_id.clone()).await?;
        draft.emit(&stream_id, version, EventPayload::AvailabilityDeclared {
          windows: windows.clone(),
        });
        draft.finish(Outcome::Recorded)
      }

      Command::ProfileStudent { student_id, gpa, grade_level } => {
        let stream_id = StreamId::student(student_id);
        let version = self.log.head_version(stream_id.clone()).await?;
        draft.emit(&stream_id, version, EventPayload::StudentProfiled {
          gpa:         *gpa,
          grade_level: *grade_level,
        });
        draft.finish(Outcome::Recorded)
      }

      Command::RecordCompletion { student_id, course_id, grade } => {
        let stream_id = StreamId::student(student_id);
        let version = self.log.head_version(stream_id.clone()).await?;
        draft.emit(&stream_id, version, EventPayload::CourseCompleted {
          course_id: course_id.clone(),
          grade:     *grade,
        });
        draft.finish(Outcome::Recorded)
      }

      Command::Enroll { section_id, student_id, requested_at } => {
        let roster = self.open_section(section_id).await?;
        if roster.is_enrolled(student_id) {
          return Ok(Plan { locks, effect: Effect::Nothing(Outcome::AlreadyEnrolled) });
        }
        if roster.waitlist_position(student_id).is_some() {
          return Ok(Plan { locks, effect: Effect::Nothing(Outcome::AlreadyWaitlisted) });
        }

        let student = self.student(student_id).await?;
        let requested_at = requested_at.unwrap_or_else(Utc::now);
        let section = StreamId::section(section_id);

        match self.policies.evaluate(&student, &roster)? {
          Decision::Accept => {
            draft.emit(&section, roster.entity.version, EventPayload::Enrolled(Enrollment {
              student_id: student_id.clone(),
              requested_at,
              promoted: false,
            }));
            draft.finish(Outcome::Enrolled)
          }
          Decision::Waitlist { priority } => {
            let entry = WaitlistEntry { student_id: student_id.clone(), priority, requested_at };
            let position = roster
              .waitlist
              .partition_point(|e| e.promotion_order(&entry).is_lt())
              + 1;
            draft.emit(&section, roster.entity.version, EventPayload::Waitlisted(entry));
            draft.finish(Outcome::Waitlisted { position, priority })
          }
          Decision::Reject { policy, reason } => {
            return Err(CommandError::PolicyRejected { policy, reason });
          }
        }
      }

      Command::Drop { section_id, student_id } => {
        let mut roster = self.open_section(section_id).await?;
        lock_waitlist(&mut locks, &roster);
        let section = StreamId::section(section_id);
        let version = roster.entity.version;

        if roster.enrolled.remove(student_id).is_some() {
          draft.emit(&section, version, EventPayload::Dropped { student_id: student_id.clone() });
        } else if roster.waitlist_position(student_id).is_some() {
          roster.waitlist.retain(|e| &e.student_id != student_id);
          draft.emit(&section, version, EventPayload::WaitlistRemoved {
            student_id: student_id.clone(),
            reason:     "withdrawn".into(),
          });
        } else {
          return Err(CommandError::invalid(format!(
            "student {student_id} is neither enrolled in nor waitlisted for {section_id}"
          )));
        }

        let Promotion { promoted, removed } = self.promote(&mut draft, &mut roster).await?;
        draft.finish(Outcome::Dropped { promoted, removed })
      }

      Command::PromoteWaitlist { section_id } => {
        let mut roster = self.open_section(section_id).await?;
        lock_waitlist(&mut locks, &roster);
        if !roster.needs_promotion() {
          return Ok(Plan {
            locks,
            effect: Effect::Nothing(Outcome::Promoted { promoted: vec![], removed: vec![] }),
          });
        }
        let Promotion { promoted, removed } = self.promote(&mut draft, &mut roster).await?;
        draft.finish(Outcome::Promoted { promoted, removed })
      }

      Command::Schedule { section_id, slot, candidate_rooms } => {
        let roster = self.open_section(section_id).await?;
        let Some(spec) = &roster.spec else {
          return Err(CommandError::NotFound(StreamId::section(section_id)));
        };
        let lecturer_id = StreamId::lecturer(&spec.instructor_id);
        locks.insert(lecturer_id.clone(), LockMode::Write);
        if roster.assignment.is_some() {
          return Err(CommandError::invalid(format!(
            "section {section_id} is already scheduled; unschedule it first"
          )));
        }

        let mut index = AvailabilityIndex::default();
        let mut versions = BTreeMap::new();
        for room_id in candidate_rooms {
          let room = self.room(room_id).await?;
          versions.insert(StreamId::room(room_id), room.entity.version);
          index.insert_room(room);
        }
        let lecturer = self.lecturer(&spec.instructor_id).await?;
        versions.insert(lecturer_id, lecturer.entity.version);
        index.insert_instructor(lecturer);

        let request = ScheduleRequest::for_section(section_id.clone(), spec, *slot);
        let assignment = self.solver.schedule(&request, candidate_rooms, &mut index)?;

        let booking = assignment.booking();
        draft.emit(
          &StreamId::section(section_id),
          roster.entity.version,
          EventPayload::SectionScheduled(assignment.clone()),
        );
        for stream_id in [
          StreamId::room(&assignment.room_id),
          StreamId::lecturer(&assignment.instructor_id),
        ] {
          let version = versions.get(&stream_id).copied().unwrap_or_default();
          draft.emit(&stream_id, version, EventPayload::Booked(booking.clone()));
        }
        draft.finish(Outcome::Scheduled(assignment))
      }

      Command::Unschedule { section_id } => {
        let roster = self.open_section(section_id).await?;
        let Some(assignment) = &roster.assignment else {
          return Err(CommandError::invalid(format!("section {section_id} is not scheduled")));
        };
        let room = StreamId::room(&assignment.room_id);
        let lecturer = StreamId::lecturer(&assignment.instructor_id);
        locks.insert(room.clone(), LockMode::Write);
        locks.insert(lecturer.clone(), LockMode::Write);

        draft.emit(
          &StreamId::section(section_id),
          roster.entity.version,
          EventPayload::SectionUnscheduled { room_id: assignment.room_id.clone() },
        );
        for stream_id in [room, lecturer] {
          let version = self.log.head_version(stream_id.clone()).await?;
          draft.emit(&stream_id, version, EventPayload::BookingReleased {
            section_id: section_id.clone(),
          });
        }
        draft.finish(Outcome::Unscheduled)
      }
    };

    Ok(Plan { locks, effect })
  }

  /// Fill free seats from the front of the waitlist. A candidate who no
  /// longer passes every policy is taken off the waitlist and the next one
  /// is tried.
  async fn promote(
    &self,
    draft: &mut Draft<'_>,
    roster: &mut SectionRoster,
  ) -> CommandResult<Promotion> {
    let section = roster.entity.stream_id();
    let version = roster.entity.version;
    let mut promotion = Promotion::default();

    while roster.free_seats() > 0 && !roster.waitlist.is_empty() {
      let entry = roster.waitlist.remove(0);
      let student = self.student(&entry.student_id).await?;

      match self.policies.evaluate(&student, roster)? {
        Decision::Accept => {
          roster.enrolled.insert(entry.student_id.clone(), entry.requested_at);
          draft.emit(&section, version, EventPayload::Enrolled(Enrollment {
            student_id:   entry.student_id.clone(),
            requested_at: entry.requested_at,
            promoted:     true,
          }));
          promotion.promoted.push(entry.student_id);
        }
        Decision::Reject { policy, reason } => {
          draft.emit(&section, version, EventPayload::WaitlistRemoved {
            student_id: entry.student_id.clone(),
            reason:     format!("{policy}: {reason}"),
          });
          promotion.removed.push(entry.student_id);
        }
        Decision::Waitlist { .. } => {
          // No seat after all; leave the queue as it was.
          roster.waitlist.insert(0, entry);
          break;
        }
      }
    }

    if !promotion.promoted.is_empty() || !promotion.removed.is_empty() {
      info!(
        section = %section,
        promoted = ?promotion.promoted,
        removed = ?promotion.removed,
        "waitlist promotion"
      );
    }
    Ok(promotion)
  }

  // ─── State access ──────────────────────────────────────────────────────────

  async fn state(&self, stream_id: StreamId) -> CommandResult<StreamState> {
    Ok(self.log.replay(&stream_id).await?)
  }

  async fn section(&self, section_id: &str) -> CommandResult<SectionRoster> {
    self
      .state(StreamId::section(section_id))
      .await?
      .into_section()
      .ok_or_else(|| mismatch("section"))
  }

  /// The roster of a section that has been opened.
  async fn open_section(&self, section_id: &str) -> CommandResult<SectionRoster> {
    let roster = self.section(section_id).await?;
    if roster.spec.is_none() {
      return Err(CommandError::NotFound(StreamId::section(section_id)));
    }
    Ok(roster)
  }

  async fn room(&self, room_id: &str) -> CommandResult<RoomCalendar> {
    self
      .state(StreamId::room(room_id))
      .await?
      .into_room()
      .ok_or_else(|| mismatch("room"))
  }

  async fn lecturer(&self, instructor_id: &str) -> CommandResult<InstructorCalendar> {
    self
      .state(StreamId::lecturer(instructor_id))
      .await?
      .into_lecturer()
      .ok_or_else(|| mismatch("lecturer"))
  }

  /// A student without events is a freshman with no record.
  async fn student(&self, student_id: &str) -> CommandResult<StudentRecord> {
    self
      .state(StreamId::student(student_id))
      .await?
      .into_student()
      .ok_or_else(|| mismatch("student"))
  }
}

fn mismatch(kind: &str) -> CommandError {
  CommandError::Internal(format!("replayed state is not a {kind}").into())
}

/// Locks every command needs regardless of state.
fn base_locks(command: &Command) -> LockSet {
  match command {
    Command::OpenSection { section_id, .. }
    | Command::Drop { section_id, .. }
    | Command::PromoteWaitlist { section_id }
    | Command::Unschedule { section_id } => LockSet::new().write(StreamId::section(section_id)),
    Command::RegisterRoom { spec } => LockSet::new().write(StreamId::room(&spec.room_id)),
    Command::DeclareAvailability { instructor_id, .. } => {
      LockSet::new().write(StreamId::lecturer(instructor_id))
    }
    Command::ProfileStudent { student_id, .. } | Command::RecordCompletion { student_id, .. } => {
      LockSet::new().write(StreamId::student(student_id))
    }
    Command::Enroll { section_id, student_id, .. } => LockSet::new()
      .write(StreamId::section(section_id))
      .read(StreamId::student(student_id)),
    Command::Schedule { section_id, candidate_rooms, .. } => candidate_rooms.iter().fold(
      LockSet::new().write(StreamId::section(section_id)),
      |set, room| set.write(StreamId::room(room)),
    ),
  }
}

/// Promotion reads the record of everyone on the waitlist.
fn lock_waitlist(locks: &mut LockSet, roster: &SectionRoster) {
  for entry in &roster.waitlist {
    locks.insert(StreamId::student(&entry.student_id), LockMode::Read);
  }
}
