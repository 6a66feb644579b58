//! End-to-end tests of the command path over in-memory SQLite stores.

use std::{sync::Arc, time::Duration};

use argos_core::{
  academic::{Grade, GradeLevel, Prerequisite, SectionSpec},
  calendar::{RoomPreference, RoomSpec, TimeSlot},
  event::{EventPayload, NewEvent, StreamAppend},
  principal::Principal,
  store::SnapshotStore,
  stream::{StreamId, VersionConflict},
};
use argos_raft::{
  EntryPayload, LocalNetwork, LocalTransport, NodeId, RaftConfig, RaftTimings, Role,
};
use argos_rules::Violation;
use argos_store_sqlite::SqliteStore;
use chrono::{NaiveTime, Weekday};
use tokio::{
  task::JoinSet,
  time::{Instant, sleep},
};

use crate::{
  Command, CommandCoordinator, CommandEnvelope, CommandError, EngineConfig, Error, EventLog,
  Outcome,
  sweep::{promotion_sweep, snapshot_sweep},
};

type Coordinator = CommandCoordinator<SqliteStore, LocalTransport>;

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn fast() -> RaftTimings {
  RaftTimings {
    election_timeout_min_ms: 100,
    election_timeout_max_ms: 200,
    heartbeat_interval_ms:   20,
    tick_interval_ms:        5,
    max_append_entries:      64,
  }
}

async fn until_leader(coordinator: &Coordinator) {
  let until = Instant::now() + Duration::from_secs(3);
  while coordinator.status().await.role != Role::Leader {
    assert!(Instant::now() < until, "node never became leader");
    sleep(Duration::from_millis(10)).await;
  }
}

async fn single_with(config: EngineConfig) -> Arc<Coordinator> {
  let net = LocalNetwork::new();
  let store = SqliteStore::open_in_memory().await.unwrap();
  let raft = RaftConfig::with_timings(1, vec![1], &fast());
  let coordinator = Coordinator::start(config, raft, store, net.transport(1), false)
    .await
    .unwrap();
  net.register(coordinator.raft());
  until_leader(&coordinator).await;
  Arc::new(coordinator)
}

async fn single() -> Arc<Coordinator> { single_with(EngineConfig::default()).await }

fn envelope(command: Command) -> CommandEnvelope {
  CommandEnvelope::new(Principal::system(), command, Duration::from_secs(10))
}

async fn run(coordinator: &Coordinator, command: Command) -> Outcome {
  coordinator.submit(envelope(command)).await.unwrap().outcome
}

fn spec(instructor: &str, capacity: u32, waitlist: u32, prerequisites: Vec<Prerequisite>) -> SectionSpec {
  SectionSpec {
    course_id: "CS301".into(),
    instructor_id: instructor.into(),
    capacity,
    waitlist_capacity: Some(waitlist),
    expected_size: None,
    prerequisites,
    room_preference: RoomPreference::default(),
  }
}

fn open(section: &str, spec: SectionSpec) -> Command {
  Command::OpenSection { section_id: section.into(), spec }
}

fn enroll(section: &str, student: &str) -> Command {
  Command::Enroll { section_id: section.into(), student_id: student.into(), requested_at: None }
}

fn slot(day: Weekday, from: (u32, u32), to: (u32, u32)) -> TimeSlot {
  TimeSlot::new(
    day,
    NaiveTime::from_hms_opt(from.0, from.1, 0).unwrap(),
    NaiveTime::from_hms_opt(to.0, to.1, 0).unwrap(),
  )
  .unwrap()
}

fn room(id: &str, capacity: u32) -> Command {
  Command::RegisterRoom {
    spec: RoomSpec {
      room_id: id.into(),
      building: "B".into(),
      capacity,
      room_type: None,
      equipment: Default::default(),
    },
  }
}

fn available(instructor: &str) -> Command {
  Command::DeclareAvailability {
    instructor_id: instructor.into(),
    windows:       vec![slot(Weekday::Mon, (8, 0), (18, 0))],
  }
}

async fn roster(coordinator: &Coordinator, section: &str) -> argos_core::state::SectionRoster {
  coordinator
    .query(&StreamId::section(section))
    .await
    .unwrap()
    .into_section()
    .unwrap()
}

// ─── Enrollment ──────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thirty_one_concurrent_enrollments_fill_thirty_seats() {
  let c = single().await;
  // No waitlist cap: the default for sections opened without one.
  let section = SectionSpec { waitlist_capacity: None, ..spec("lee", 30, 0, vec![]) };
  run(&c, open("CS301-A", section)).await;

  let mut tasks = JoinSet::new();
  for i in 0..31 {
    let c = Arc::clone(&c);
    tasks.spawn(async move { c.submit(envelope(enroll("CS301-A", &format!("s-{i:02}")))).await });
  }

  let (mut enrolled, mut waitlisted) = (0, 0);
  while let Some(result) = tasks.join_next().await {
    match result.unwrap().unwrap().outcome {
      Outcome::Enrolled => enrolled += 1,
      Outcome::Waitlisted { position: 1, .. } => waitlisted += 1,
      other => panic!("unexpected outcome {other:?}"),
    }
  }
  assert_eq!((enrolled, waitlisted), (30, 1));

  let roster = roster(&c, "CS301-A").await;
  assert_eq!(roster.occupied(), 30);
  assert_eq!(roster.waitlist.len(), 1);
  assert_eq!(roster.entity.version, 32);
}

#[tokio::test]
async fn repeated_enrollment_writes_nothing() {
  let c = single().await;
  run(&c, open("CS301-A", spec("lee", 1, 1, vec![]))).await;
  assert_eq!(run(&c, enroll("CS301-A", "a")).await, Outcome::Enrolled);
  assert_eq!(run(&c, enroll("CS301-A", "a")).await, Outcome::AlreadyEnrolled);
  assert!(matches!(run(&c, enroll("CS301-A", "b")).await, Outcome::Waitlisted { .. }));
  assert_eq!(run(&c, enroll("CS301-A", "b")).await, Outcome::AlreadyWaitlisted);

  // Both seat and waitlist are now full.
  let err = c.submit(envelope(enroll("CS301-A", "c"))).await.unwrap_err();
  assert!(matches!(err, CommandError::PolicyRejected { ref policy, .. } if policy == "quota"));
  assert_eq!(roster(&c, "CS301-A").await.entity.version, 3);
}

#[tokio::test]
async fn missing_prerequisite_is_rejected_without_retry() {
  let c = single().await;
  run(&c, open("CS301-A", spec("lee", 10, 0, vec![Prerequisite::passing("CS201")]))).await;

  let err = c.submit(envelope(enroll("CS301-A", "s-1"))).await.unwrap_err();
  assert!(!err.is_retryable());
  assert!(matches!(
    err,
    CommandError::PolicyRejected { ref policy, ref reason } if policy == "prerequisite" && reason.contains("CS201")
  ));

  run(&c, Command::RecordCompletion {
    student_id: "s-1".into(),
    course_id:  "CS201".into(),
    grade:      Grade::C,
  })
  .await;
  assert_eq!(run(&c, enroll("CS301-A", "s-1")).await, Outcome::Enrolled);
}

#[tokio::test]
async fn unknown_section_is_not_found() {
  let c = single().await;
  let err = c.submit(envelope(enroll("nope", "s-1"))).await.unwrap_err();
  assert!(matches!(err, CommandError::NotFound(ref id) if *id == StreamId::section("nope")));

  let err = c.submit(envelope(open("CS301-A", spec("lee", 0, 0, vec![])))).await.unwrap_err();
  assert!(matches!(err, CommandError::Invalid(_)));
}

#[tokio::test]
async fn drop_promotes_the_highest_priority_in_the_same_batch() {
  let c = single().await;
  run(&c, open("CS301-A", spec("lee", 1, 5, vec![]))).await;
  run(&c, Command::ProfileStudent {
    student_id:  "senior".into(),
    gpa:         Some(3.8),
    grade_level: GradeLevel::Senior,
  })
  .await;

  run(&c, enroll("CS301-A", "first")).await;
  assert_eq!(run(&c, enroll("CS301-A", "freshman")).await, Outcome::Waitlisted {
    position: 1,
    priority: 0,
  });
  assert_eq!(run(&c, enroll("CS301-A", "senior")).await, Outcome::Waitlisted {
    position: 1,
    priority: 25,
  });

  let drop = envelope(Command::Drop { section_id: "CS301-A".into(), student_id: "first".into() });
  let correlation_id = drop.correlation_id;
  let committed = c.submit(drop).await.unwrap();
  assert_eq!(committed.outcome, Outcome::Dropped {
    promoted: vec!["senior".into()],
    removed:  vec![],
  });

  let events = c.events(StreamId::section("CS301-A"), 5, 10).await.unwrap();
  assert_eq!(events.len(), 2);
  assert_eq!(events[0].payload, EventPayload::Dropped { student_id: "first".into() });
  assert!(matches!(
    &events[1].payload,
    EventPayload::Enrolled(e) if e.student_id == "senior" && e.promoted
  ));
  assert!(events.iter().all(|e| e.correlation_id == correlation_id));
  assert_eq!(events[1].causation_id, Some(events[0].event_id));

  let roster = roster(&c, "CS301-A").await;
  assert!(roster.is_enrolled("senior"));
  assert_eq!(roster.waitlist_position("freshman"), Some(1));
}

#[tokio::test]
async fn promotion_removes_candidates_who_no_longer_qualify() {
  let c = single().await;
  run(&c, open("CS301-A", spec("lee", 1, 5, vec![Prerequisite::passing("CS201")]))).await;
  for student in ["a", "b", "c"] {
    run(&c, Command::RecordCompletion {
      student_id: student.into(),
      course_id:  "CS201".into(),
      grade:      Grade::B,
    })
    .await;
    run(&c, enroll("CS301-A", student)).await;
  }
  // b retakes the course and fails; only the latest grade counts.
  run(&c, Command::RecordCompletion {
    student_id: "b".into(),
    course_id:  "CS201".into(),
    grade:      Grade::F,
  })
  .await;

  let outcome = run(&c, Command::Drop { section_id: "CS301-A".into(), student_id: "a".into() }).await;
  assert_eq!(outcome, Outcome::Dropped { promoted: vec!["c".into()], removed: vec!["b".into()] });

  let roster = roster(&c, "CS301-A").await;
  assert!(roster.is_enrolled("c"));
  assert!(roster.waitlist.is_empty());
}

#[tokio::test]
async fn withdrawing_from_the_waitlist() {
  let c = single().await;
  run(&c, open("CS301-A", spec("lee", 1, 5, vec![]))).await;
  run(&c, enroll("CS301-A", "a")).await;
  run(&c, enroll("CS301-A", "b")).await;

  let outcome = run(&c, Command::Drop { section_id: "CS301-A".into(), student_id: "b".into() }).await;
  assert_eq!(outcome, Outcome::Dropped { promoted: vec![], removed: vec![] });
  let last = c.events(StreamId::section("CS301-A"), 4, 1).await.unwrap();
  assert_eq!(last[0].payload, EventPayload::WaitlistRemoved {
    student_id: "b".into(),
    reason:     "withdrawn".into(),
  });

  let err = c
    .submit(envelope(Command::Drop { section_id: "CS301-A".into(), student_id: "zed".into() }))
    .await
    .unwrap_err();
  assert!(matches!(err, CommandError::Invalid(_)));
}

#[tokio::test]
async fn promotion_sweep_fills_missed_seats() {
  let c = single().await;
  run(&c, open("CS301-A", spec("lee", 1, 5, vec![]))).await;
  run(&c, enroll("CS301-A", "a")).await;
  run(&c, enroll("CS301-A", "b")).await;

  // A drop committed without its promotion leaves a seat free.
  let dropped = StreamAppend::new(StreamId::section("CS301-A"), 3)
    .with(NewEvent::new(EventPayload::Dropped { student_id: "a".into() }));
  let applied = c
    .raft()
    .propose(EntryPayload::Batch(vec![dropped]), Instant::now() + Duration::from_secs(2))
    .await
    .unwrap();
  assert!(applied.output.is_ok());
  assert!(roster(&c, "CS301-A").await.needs_promotion());

  let changed = promotion_sweep(&c, Duration::from_secs(5)).await.unwrap();
  assert_eq!(changed, [StreamId::section("CS301-A")]);
  assert!(roster(&c, "CS301-A").await.is_enrolled("b"));
  assert!(promotion_sweep(&c, Duration::from_secs(5)).await.unwrap().is_empty());
}

// ─── Scheduling ──────────────────────────────────────────────────────────────

async fn scheduling_fixture() -> Arc<Coordinator> {
  let c = single().await;
  run(&c, room("R1", 40)).await;
  for (section, instructor) in [("A", "lee"), ("B", "kim")] {
    run(&c, available(instructor)).await;
    run(&c, open(section, spec(instructor, 30, 0, vec![]))).await;
  }
  c
}

fn schedule(section: &str, slot: TimeSlot, rooms: &[&str]) -> Command {
  Command::Schedule {
    section_id: section.into(),
    slot,
    candidate_rooms: rooms.iter().map(|r| r.to_string()).collect(),
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_requests_for_one_room_conflict() {
  let c = scheduling_fixture().await;

  let first = {
    let c = Arc::clone(&c);
    tokio::spawn(async move {
      c.submit(envelope(schedule("A", slot(Weekday::Mon, (9, 0), (10, 0)), &["R1"]))).await
    })
  };
  let second = {
    let c = Arc::clone(&c);
    tokio::spawn(async move {
      c.submit(envelope(schedule("B", slot(Weekday::Mon, (9, 30), (10, 30)), &["R1"]))).await
    })
  };
  let results = [first.await.unwrap(), second.await.unwrap()];

  let scheduled = results.iter().filter(|r| matches!(r, Ok(c) if matches!(c.outcome, Outcome::Scheduled(_)))).count();
  assert_eq!(scheduled, 1);
  let conflict = results
    .iter()
    .find_map(|r| match r {
      Err(CommandError::Conflict(conflicts)) => Some(conflicts.clone()),
      _ => None,
    })
    .expect("one request must conflict");
  assert_eq!(conflict.len(), 1);
  assert!(matches!(conflict[0].violations[..], [Violation::RoomBooked { .. }]));

  let room = c.query(&StreamId::room("R1")).await.unwrap().into_room().unwrap();
  assert_eq!(room.bookings.len(), 1);
}

#[tokio::test]
async fn unschedule_releases_both_calendars() {
  let c = scheduling_fixture().await;
  let nine = slot(Weekday::Mon, (9, 0), (10, 0));

  let Outcome::Scheduled(assignment) = run(&c, schedule("A", nine, &["R1"])).await else {
    panic!("expected an assignment");
  };
  assert_eq!(assignment.room_id, "R1");
  let lee = c.query(&StreamId::lecturer("lee")).await.unwrap().into_lecturer().unwrap();
  assert_eq!(lee.bookings.len(), 1);

  let err = c.submit(envelope(schedule("A", nine, &["R1"]))).await.unwrap_err();
  assert!(matches!(err, CommandError::Invalid(_)));

  assert_eq!(run(&c, Command::Unschedule { section_id: "A".into() }).await, Outcome::Unscheduled);
  let room = c.query(&StreamId::room("R1")).await.unwrap().into_room().unwrap();
  assert!(room.bookings.is_empty());
  assert!(roster(&c, "A").await.assignment.is_none());

  // The room is free again, so B can have it.
  assert!(matches!(run(&c, schedule("B", nine, &["R1"])).await, Outcome::Scheduled(_)));
}

#[tokio::test]
async fn lecturer_without_availability_cannot_be_scheduled() {
  let c = single().await;
  run(&c, room("R1", 40)).await;
  run(&c, open("A", spec("nobody", 10, 0, vec![]))).await;

  let err = c
    .submit(envelope(schedule("A", slot(Weekday::Tue, (9, 0), (10, 0)), &["R1", "R9"])))
    .await
    .unwrap_err();
  let CommandError::Conflict(conflicts) = err else { panic!("expected a conflict") };
  let rooms: Vec<&str> = conflicts.iter().map(|c| c.room_id.as_str()).collect();
  assert_eq!(rooms, ["R1", "R9"]);
  assert!(conflicts[1].violations.contains(&Violation::RoomUnregistered));
}

// ─── Event log ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_produce_contiguous_versions() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let log = Arc::new(EventLog::new(Arc::new(store), 0));
  let stream = StreamId::student("busy");

  let mut tasks = JoinSet::new();
  for writer in 0..8 {
    let log = Arc::clone(&log);
    let stream = stream.clone();
    tasks.spawn(async move {
      for n in 0..5 {
        loop {
          let head = log.head_version(stream.clone()).await.unwrap();
          let event = NewEvent::new(EventPayload::CourseCompleted {
            course_id: format!("W{writer}-{n}"),
            grade:     Grade::A,
          });
          match log.append(stream.clone(), head, event).await {
            Ok(version) => {
              assert_eq!(version, head + 1);
              break;
            }
            Err(Error::VersionConflict(VersionConflict { .. })) => continue,
            Err(err) => panic!("{err}"),
          }
        }
      }
    });
  }
  while let Some(result) = tasks.join_next().await {
    result.unwrap();
  }

  let events = log.read(stream, 1).collect().await.unwrap();
  let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
  assert_eq!(versions, (1..=40).collect::<Vec<_>>());
}

#[tokio::test]
async fn snapshot_replay_matches_full_replay() {
  let config = EngineConfig { snapshot_every: 4, ..EngineConfig::default() };
  let c = single_with(config).await;
  run(&c, open("CS301-A", spec("lee", 3, 5, vec![]))).await;
  for i in 0..6 {
    run(&c, enroll("CS301-A", &format!("s-{i}"))).await;
  }

  assert_eq!(snapshot_sweep(c.log()).await, 1);
  let section = StreamId::section("CS301-A");
  let snapshot = c.log().store().load_snapshot(section.clone()).await.unwrap().unwrap();
  assert_eq!(snapshot.version, 7);

  run(&c, Command::Drop { section_id: "CS301-A".into(), student_id: "s-0".into() }).await;

  let from_snapshot = c.log().replay(&section).await.unwrap();
  let from_scratch = c.log().replay_from_scratch(&section).await.unwrap();
  assert_eq!(from_snapshot, from_scratch);
  assert_eq!(from_snapshot.version(), 9);
}

// ─── Replication ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_redirect_and_converge() {
  let net = LocalNetwork::new();
  let ids: Vec<NodeId> = vec![1, 2, 3];
  let mut nodes = Vec::new();
  for &id in &ids {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let raft = RaftConfig::with_timings(id, ids.clone(), &fast());
    let coordinator = Coordinator::start(EngineConfig::default(), raft, store, net.transport(id), false)
      .await
      .unwrap();
    net.register(coordinator.raft());
    nodes.push(coordinator);
  }

  let until = Instant::now() + Duration::from_secs(5);
  let leader = loop {
    let mut found = None;
    for node in &nodes {
      let status = node.status().await;
      if status.role == Role::Leader {
        found = Some(status.node_id);
      }
    }
    let settled = match found {
      Some(leader) => {
        let mut all = true;
        for node in &nodes {
          all &= node.status().await.leader == Some(leader);
        }
        all
      }
      None => false,
    };
    if settled && let Some(leader) = found {
      break leader;
    }
    assert!(Instant::now() < until, "cluster never settled on a leader");
    sleep(Duration::from_millis(20)).await;
  };

  let leader_node = &nodes[(leader - 1) as usize];
  let follower = nodes.iter().find(|n| n.raft().id() != leader).unwrap();

  let err = follower
    .submit(envelope(open("CS301-A", spec("lee", 5, 0, vec![]))))
    .await
    .unwrap_err();
  assert!(matches!(err, CommandError::Unavailable { leader_hint: Some(hint), .. } if hint == leader));

  run(leader_node, open("CS301-A", spec("lee", 5, 0, vec![]))).await;
  run(leader_node, enroll("CS301-A", "s-1")).await;

  for node in &nodes {
    let until = Instant::now() + Duration::from_secs(3);
    loop {
      if let Ok(state) = node.query(&StreamId::section("CS301-A")).await
        && state.version() == 2
      {
        break;
      }
      assert!(Instant::now() < until, "node {} never caught up", node.raft().id());
      sleep(Duration::from_millis(20)).await;
    }
  }

  for node in &nodes {
    node.shutdown().await;
  }
}
