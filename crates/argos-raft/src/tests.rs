use std::{
  collections::BTreeMap,
  convert::Infallible,
  sync::{Arc, Mutex},
  time::Duration,
};

use argos_core::{event::StreamAppend, stream::StreamId};
use tokio::time::{Instant, sleep};

use crate::{
  EntryPayload, HardState, LocalNetwork, LocalTransport, LogEntry, MemoryStorage, NodeId,
  RaftConfig, RaftError, RaftNode, RaftStorage, RaftTimings, Role, StateMachine, VoteRequest,
  rpc::AppendRequest,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

/// Records every applied batch's first stream id, in apply order.
#[derive(Clone, Default)]
struct Recorder {
  applied: Arc<Mutex<Vec<(u64, String)>>>,
}

impl Recorder {
  fn commands(&self) -> Vec<String> {
    self.applied.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
  }
}

impl StateMachine for Recorder {
  type Error = Infallible;
  type Output = u64;

  async fn apply(&self, entry: LogEntry) -> Result<u64, Infallible> {
    if let EntryPayload::Batch(appends) = &entry.payload
      && let Some(append) = appends.first()
    {
      self.applied.lock().unwrap().push((entry.index, append.stream_id.id().to_owned()));
    }
    Ok(entry.index)
  }
}

type TestNode = RaftNode<MemoryStorage, LocalTransport, Recorder>;

fn command(name: &str) -> EntryPayload {
  EntryPayload::Batch(vec![StreamAppend::new(StreamId::student(name), 0)])
}

fn in_log(storage: &MemoryStorage, name: &str) -> bool {
  storage.log().iter().any(|entry| entry.payload == command(name))
}

fn fast() -> RaftTimings {
  RaftTimings {
    election_timeout_min_ms: 100,
    election_timeout_max_ms: 200,
    heartbeat_interval_ms:   20,
    tick_interval_ms:        5,
    max_append_entries:      16,
  }
}

fn deadline(millis: u64) -> Instant { Instant::now() + Duration::from_millis(millis) }

struct Cluster {
  net:      LocalNetwork,
  nodes:    BTreeMap<NodeId, TestNode>,
  storage:  BTreeMap<NodeId, MemoryStorage>,
  machines: BTreeMap<NodeId, Recorder>,
}

impl Cluster {
  async fn start(size: u64) -> Self {
    let net = LocalNetwork::new();
    let ids: Vec<NodeId> = (1..=size).collect();
    let mut cluster = Self {
      net:      net.clone(),
      nodes:    BTreeMap::new(),
      storage:  BTreeMap::new(),
      machines: BTreeMap::new(),
    };
    for &id in &ids {
      let storage = MemoryStorage::new();
      let machine = Recorder::default();
      let config = RaftConfig::with_timings(id, ids.clone(), &fast());
      let node = RaftNode::start(config, storage.clone(), net.transport(id), machine.clone())
        .await
        .unwrap();
      net.register(&node);
      cluster.nodes.insert(id, node);
      cluster.storage.insert(id, storage);
      cluster.machines.insert(id, machine);
    }
    cluster
  }

  fn node(&self, id: NodeId) -> &TestNode { &self.nodes[&id] }

  /// The leader with the highest term among `among`, once one exists.
  async fn leader_among(&self, among: &[NodeId], within: Duration) -> NodeId {
    let until = Instant::now() + within;
    loop {
      let mut best: Option<(u64, NodeId)> = None;
      for &id in among {
        let status = self.nodes[&id].status().await;
        if status.role == Role::Leader && best.is_none_or(|(term, _)| status.term > term) {
          best = Some((status.term, id));
        }
      }
      if let Some((_, id)) = best {
        return id;
      }
      assert!(Instant::now() < until, "no leader elected among {among:?}");
      sleep(Duration::from_millis(10)).await;
    }
  }

  async fn leader(&self) -> NodeId {
    let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
    self.leader_among(&ids, Duration::from_secs(3)).await
  }

  async fn shutdown(&self) {
    for node in self.nodes.values() {
      node.shutdown().await;
    }
  }
}

async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
  let until = Instant::now() + within;
  while Instant::now() < until {
    if check() {
      return true;
    }
    sleep(Duration::from_millis(10)).await;
  }
  check()
}

// ─── Elections and replication ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_leads_and_applies_alone() {
  let recorder = Recorder::default();
  let config = RaftConfig::with_timings(1, vec![], &fast());
  let node = RaftNode::start(config, MemoryStorage::new(), LocalNetwork::new().transport(1), recorder.clone())
    .await
    .unwrap();

  let until = Instant::now() + Duration::from_secs(2);
  while node.status().await.role != Role::Leader {
    assert!(Instant::now() < until);
    sleep(Duration::from_millis(5)).await;
  }
  node.read_barrier(deadline(1000)).await.unwrap();

  let applied = node.propose(command("a"), deadline(1000)).await.unwrap();
  // Index 1 is the leader's noop.
  assert_eq!(applied.index, 2);
  assert_eq!(applied.output, 2);
  assert_eq!(recorder.commands(), ["a"]);
  node.shutdown().await;
}

/// Fails the first batch it sees, then applies normally.
#[derive(Clone, Default)]
struct FailsOnce {
  failed: Arc<Mutex<bool>>,
}

impl StateMachine for FailsOnce {
  type Error = std::io::Error;
  type Output = u64;

  async fn apply(&self, entry: LogEntry) -> Result<u64, std::io::Error> {
    let mut failed = self.failed.lock().unwrap();
    if matches!(entry.payload, EntryPayload::Batch(_)) && !*failed {
      *failed = true;
      return Err(std::io::Error::other("disk full"));
    }
    Ok(entry.index)
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proposal_waits_out_a_failed_apply() {
  let machine = FailsOnce::default();
  let config = RaftConfig::with_timings(1, vec![], &fast());
  let node = RaftNode::start(config, MemoryStorage::new(), LocalNetwork::new().transport(1), machine.clone())
    .await
    .unwrap();

  let until = Instant::now() + Duration::from_secs(2);
  while node.status().await.role != Role::Leader {
    assert!(Instant::now() < until);
    sleep(Duration::from_millis(5)).await;
  }
  node.read_barrier(deadline(1000)).await.unwrap();

  let applied = node.propose(command("a"), deadline(1000)).await.unwrap();
  assert_eq!(applied.index, 2);
  assert_eq!(applied.output, 2);
  assert!(*machine.failed.lock().unwrap());
  node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_elect_one_leader_and_replicate() {
  let cluster = Cluster::start(3).await;
  let leader = cluster.leader().await;

  for name in ["a", "b", "c"] {
    cluster.node(leader).propose(command(name), deadline(2000)).await.unwrap();
  }

  for (id, machine) in &cluster.machines {
    let caught_up = eventually(Duration::from_secs(2), || machine.commands() == ["a", "b", "c"]).await;
    assert!(caught_up, "node {id} applied {:?}", machine.commands());
  }

  let leaders = {
    let mut count = 0;
    let term = cluster.node(leader).status().await.term;
    for node in cluster.nodes.values() {
      let status = node.status().await;
      if status.role == Role::Leader && status.term == term {
        count += 1;
      }
    }
    count
  };
  assert_eq!(leaders, 1);
  cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_refuse_proposals_with_a_hint() {
  let cluster = Cluster::start(3).await;
  let leader = cluster.leader().await;
  cluster.node(leader).propose(command("warmup"), deadline(2000)).await.unwrap();

  let follower = *cluster.nodes.keys().find(|id| **id != leader).unwrap();
  let until = Instant::now() + Duration::from_secs(2);
  while cluster.node(follower).status().await.leader != Some(leader) {
    assert!(Instant::now() < until);
    sleep(Duration::from_millis(10)).await;
  }

  let result = cluster.node(follower).propose(command("x"), deadline(500)).await;
  assert!(matches!(result, Err(RaftError::NotLeader { leader_hint: Some(id) }) if id == leader));
  cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failover_keeps_every_committed_entry() {
  let cluster = Cluster::start(5).await;
  let old = cluster.leader().await;

  for name in ["a", "b", "c"] {
    cluster.node(old).propose(command(name), deadline(2000)).await.unwrap();
  }

  cluster.node(old).shutdown().await;
  cluster.net.remove(old);

  let survivors: Vec<NodeId> = cluster.nodes.keys().copied().filter(|id| *id != old).collect();
  let started = Instant::now();
  let new = cluster.leader_among(&survivors, Duration::from_secs(3)).await;
  assert_ne!(new, old);
  assert!(started.elapsed() < Duration::from_secs(3));

  for name in ["a", "b", "c"] {
    assert!(in_log(&cluster.storage[&new], name), "{name} missing from the new leader");
  }

  cluster.node(new).propose(command("d"), deadline(2000)).await.unwrap();
  let machine = &cluster.machines[&new];
  assert!(eventually(Duration::from_secs(1), || machine.commands() == ["a", "b", "c", "d"]).await);
  cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_partition_commits_nothing() {
  let cluster = Cluster::start(5).await;
  let leader = cluster.leader().await;
  cluster.node(leader).propose(command("before"), deadline(2000)).await.unwrap();
  sleep(Duration::from_millis(100)).await;

  let others: Vec<NodeId> = cluster.nodes.keys().copied().filter(|id| *id != leader).collect();
  let buddy = others[0];
  let majority = &others[1..];
  let committed_before = cluster.node(leader).status().await.commit_index;

  cluster.net.partition(&[&[leader, buddy][..], majority]);

  let stranded = cluster.node(leader).propose(command("stranded"), deadline(600)).await;
  assert!(stranded.is_err(), "minority leader committed: {stranded:?}");

  let new = cluster.leader_among(majority, Duration::from_secs(3)).await;
  cluster.node(new).propose(command("majority"), deadline(2000)).await.unwrap();

  for id in [leader, buddy] {
    let status = cluster.node(id).status().await;
    assert!(status.commit_index <= committed_before, "node {id} committed during the partition");
  }

  cluster.net.heal();

  let minority_storage = cluster.storage[&leader].clone();
  let converged = eventually(Duration::from_secs(5), || {
    in_log(&minority_storage, "majority") && !in_log(&minority_storage, "stranded")
  })
  .await;
  assert!(converged, "old leader did not adopt the majority log");

  for machine in cluster.machines.values() {
    assert!(!machine.commands().contains(&"stranded".to_owned()));
  }
  cluster.shutdown().await;
}

// ─── Handler rules ───────────────────────────────────────────────────────────

/// A follower that will not time out during the test, with peers 2 and 3.
async fn idle_follower(storage: MemoryStorage) -> TestNode {
  let timings = RaftTimings {
    election_timeout_min_ms: 60_000,
    election_timeout_max_ms: 120_000,
    ..RaftTimings::default()
  };
  let config = RaftConfig::with_timings(1, vec![2, 3], &timings);
  RaftNode::start(config, storage, LocalNetwork::new().transport(1), Recorder::default())
    .await
    .unwrap()
}

fn entries(terms: &[u64]) -> Vec<LogEntry> {
  terms
    .iter()
    .zip(1..)
    .map(|(&term, index)| LogEntry::new(index, term, EntryPayload::Noop))
    .collect()
}

fn vote(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> VoteRequest {
  VoteRequest { term, candidate_id, last_log_index, last_log_term }
}

#[tokio::test]
async fn grants_one_vote_per_term() {
  let node = idle_follower(MemoryStorage::new()).await;

  assert!(node.handle_vote(vote(1, 2, 0, 0)).await.unwrap().vote_granted);
  assert!(node.handle_vote(vote(1, 2, 0, 0)).await.unwrap().vote_granted);
  assert!(!node.handle_vote(vote(1, 3, 0, 0)).await.unwrap().vote_granted);
  assert!(node.handle_vote(vote(2, 3, 0, 0)).await.unwrap().vote_granted);

  let stale = node.handle_vote(vote(1, 2, 5, 5)).await.unwrap();
  assert!(!stale.vote_granted);
  assert_eq!(stale.term, 2);

  let hard = node.storage().hard_state().await.unwrap();
  assert_eq!(hard, HardState { current_term: 2, voted_for: Some(3) });
  node.shutdown().await;
}

#[tokio::test]
async fn refuses_candidates_with_older_logs() {
  let hard = HardState { current_term: 2, voted_for: None };
  let node = idle_follower(MemoryStorage::with_log(hard, entries(&[1, 1, 2]))).await;

  // Longer log, older last term.
  assert!(!node.handle_vote(vote(3, 2, 5, 1)).await.unwrap().vote_granted);
  // Same last term, shorter log.
  assert!(!node.handle_vote(vote(4, 2, 2, 2)).await.unwrap().vote_granted);
  // Newer last term wins even when shorter.
  assert!(node.handle_vote(vote(5, 3, 1, 3)).await.unwrap().vote_granted);
  assert_eq!(node.status().await.term, 5);
  node.shutdown().await;
}

fn append(term: u64, prev: (u64, u64), entries: Vec<LogEntry>, leader_commit: u64) -> AppendRequest {
  AppendRequest {
    term,
    leader_id: 2,
    prev_log_index: prev.0,
    prev_log_term: prev.1,
    entries,
    leader_commit,
  }
}

#[tokio::test]
async fn append_checks_log_matching_and_overwrites_uncommitted_suffix() {
  let storage = MemoryStorage::with_log(HardState { current_term: 2, voted_for: None }, entries(&[1, 1, 2, 2]));
  let node = idle_follower(storage.clone()).await;

  // Gap: we only have four entries.
  let response = node.handle_append(append(3, (6, 3), vec![], 0)).await.unwrap();
  assert!(!response.success);
  assert_eq!(response.conflict_index, 5);
  assert_eq!(response.conflict_term, None);

  // Mismatch at index 4: hint points at the first entry of our term 2.
  let response = node.handle_append(append(3, (4, 3), vec![], 0)).await.unwrap();
  assert!(!response.success);
  assert_eq!(response.conflict_index, 3);
  assert_eq!(response.conflict_term, Some(2));

  // Leader's log diverges from index 3; our uncommitted 3..4 is replaced.
  let replacement = vec![LogEntry::new(3, 3, EntryPayload::Noop)];
  let response = node.handle_append(append(3, (2, 1), replacement, 2)).await.unwrap();
  assert!(response.success);
  assert_eq!(response.match_index, 3);

  let terms: Vec<u64> = storage.log().iter().map(|e| e.term).collect();
  assert_eq!(terms, [1, 1, 3]);
  let status = node.status().await;
  assert_eq!(status.commit_index, 2);
  assert_eq!(status.leader, Some(2));

  // A stale leader is told the newer term.
  let response = node.handle_append(append(1, (0, 0), vec![], 0)).await.unwrap();
  assert!(!response.success);
  assert_eq!(response.term, 3);
  node.shutdown().await;
}

#[tokio::test]
async fn rewriting_a_committed_entry_is_corruption() {
  let storage = MemoryStorage::with_log(HardState { current_term: 2, voted_for: None }, entries(&[1, 1, 2]));
  let node = idle_follower(storage).await;

  let response = node.handle_append(append(2, (3, 2), vec![], 3)).await.unwrap();
  assert!(response.success);
  assert_eq!(node.status().await.commit_index, 3);

  let rewrite = vec![LogEntry::new(2, 3, EntryPayload::Noop)];
  let result = node.handle_append(append(3, (1, 1), rewrite, 3)).await;
  assert!(matches!(result, Err(RaftError::CorruptLog { index: 2, .. })));

  // The node stays fenced off afterwards.
  assert!(matches!(
    node.handle_vote(vote(4, 3, 10, 4)).await,
    Err(RaftError::CorruptLog { .. })
  ));
  node.shutdown().await;
}

#[tokio::test]
async fn corrupt_log_refuses_to_start_until_resynced() {
  let hard = HardState { current_term: 3, voted_for: Some(2) };
  let mut log = entries(&[1, 1, 2]);
  log[2].index = 4;
  let storage = MemoryStorage::with_log(hard, log);

  let config = RaftConfig::new(1, vec![2, 3]);
  let started =
    RaftNode::start(config.clone(), storage.clone(), LocalNetwork::new().transport(1), Recorder::default())
      .await;
  assert!(matches!(started, Err(RaftError::CorruptLog { index: 4, .. })));

  let node =
    RaftNode::start_resynced(config, storage.clone(), LocalNetwork::new().transport(1), Recorder::default())
      .await
      .unwrap();
  let status = node.status().await;
  assert_eq!(status.last_log_index, 0);
  assert_eq!(status.term, 3);
  assert!(storage.log().is_empty());
  node.shutdown().await;
}
