//! The replica itself.
//!
//! All mutable consensus state lives in one [`Volatile`] behind a tokio mutex.
//! Storage writes happen under that lock so a reply never precedes the write
//! it depends on; transport calls never do. Two background tasks drive the
//! node: a ticker (elections, heartbeats, check-quorum) and an applier that
//! feeds committed entries to the state machine in index order.

use std::{
  collections::BTreeMap,
  sync::{Arc, Mutex as StdMutex, PoisonError},
};

use tokio::{
  sync::{Mutex, Notify, oneshot, watch},
  task::{JoinHandle, JoinSet},
  time::{Instant, sleep, timeout_at},
};
use tracing::{debug, error, info, warn};

use crate::{
  config::RaftConfig,
  error::{RaftError, Result},
  machine::StateMachine,
  rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse},
  storage::{LogIntegrity, RaftStorage},
  transport::Transport,
  types::{EntryPayload, HardState, LogEntry, LogId, NodeId, NodeStatus, Role},
};

/// The state machine's output for an applied entry, with the entry's index.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<O> {
  pub index:  u64,
  pub output: O,
}

type Waiter<O> = oneshot::Sender<Result<O>>;

struct Pending<O> {
  term: u64,
  tx:   Waiter<O>,
}

/// Leader-side view of one follower.
struct Progress {
  next_index:  u64,
  match_index: u64,
  last_ack:    Instant,
  inflight:    bool,
}

struct Volatile<O> {
  role:              Role,
  term:              u64,
  voted_for:         Option<NodeId>,
  leader:            Option<NodeId>,
  last_log:          LogId,
  commit_index:      u64,
  last_applied:      u64,
  election_deadline: Instant,
  next_heartbeat:    Instant,
  leader_since:      Instant,
  /// Index of this leader's noop entry.
  term_start:        u64,
  progress:          BTreeMap<NodeId, Progress>,
  pending:           BTreeMap<u64, Pending<O>>,
  fault:             Option<(u64, String)>,
  stopped:           bool,
}

impl<O> Volatile<O> {
  fn hard_state(&self) -> HardState {
    HardState { current_term: self.term, voted_for: self.voted_for }
  }

  fn check_usable(&self) -> Result<()> {
    if self.stopped {
      return Err(RaftError::Shutdown);
    }
    if let Some((index, reason)) = &self.fault {
      return Err(RaftError::CorruptLog { index: *index, reason: reason.clone() });
    }
    Ok(())
  }

  /// Resolve every waiter at or after `index`; their entries are gone.
  fn fail_pending_from(&mut self, index: u64) {
    for (_, pending) in self.pending.split_off(&index) {
      let _ = pending.tx.send(Err(RaftError::LeadershipLost));
    }
  }
}

struct Shared<S, T, M: StateMachine> {
  config:        RaftConfig,
  storage:       S,
  transport:     T,
  machine:       M,
  state:         Mutex<Volatile<M::Output>>,
  commit_notify: Notify,
  applied:       watch::Sender<u64>,
  shutdown:      watch::Sender<bool>,
  tasks:         StdMutex<Vec<JoinHandle<()>>>,
}

/// A handle to a running replica. Cheap to clone.
pub struct RaftNode<S, T, M: StateMachine> {
  shared: Arc<Shared<S, T, M>>,
}

impl<S, T, M: StateMachine> Clone for RaftNode<S, T, M> {
  fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<S, T, M> RaftNode<S, T, M>
where
  S: RaftStorage,
  T: Transport,
  M: StateMachine,
{
  // ─── Lifecycle ─────────────────────────────────────────────────────────────

  /// Verify the stored log, restore the hard state and start the background
  /// tasks. A log that fails verification is refused with `CorruptLog`.
  pub async fn start(config: RaftConfig, storage: S, transport: T, machine: M) -> Result<Self> {
    if let LogIntegrity::Corrupt { index, reason } =
      storage.verify().await.map_err(RaftError::storage)?
    {
      error!(node_id = config.node_id, index, %reason, "stored raft log failed verification");
      return Err(RaftError::CorruptLog { index, reason });
    }

    let hard = storage.hard_state().await.map_err(RaftError::storage)?;
    let last_log = storage.last_log_id().await.map_err(RaftError::storage)?;
    let now = Instant::now();

    let volatile = Volatile {
      role: Role::Follower,
      term: hard.current_term,
      voted_for: hard.voted_for,
      leader: None,
      last_log,
      commit_index: 0,
      last_applied: 0,
      election_deadline: now + config.random_election_timeout(),
      next_heartbeat: now,
      leader_since: now,
      term_start: 0,
      progress: BTreeMap::new(),
      pending: BTreeMap::new(),
      fault: None,
      stopped: false,
    };

    info!(
      node_id = config.node_id,
      term = hard.current_term,
      last_index = last_log.index,
      peers = ?config.peers,
      "raft node starting"
    );

    let node = Self {
      shared: Arc::new(Shared {
        config,
        storage,
        transport,
        machine,
        state: Mutex::new(volatile),
        commit_notify: Notify::new(),
        applied: watch::Sender::new(0),
        shutdown: watch::Sender::new(false),
        tasks: StdMutex::new(Vec::new()),
      }),
    };

    let ticker = tokio::spawn(node.clone().run_ticker());
    let applier = tokio::spawn(node.clone().run_applier());
    node.tasks().extend([ticker, applier]);
    Ok(node)
  }

  /// Discard the local log (term and vote are kept) and start empty, so the
  /// leader re-replicates everything.
  pub async fn start_resynced(
    config: RaftConfig,
    storage: S,
    transport: T,
    machine: M,
  ) -> Result<Self> {
    warn!(node_id = config.node_id, "discarding local raft log for resync");
    storage.reset_log().await.map_err(RaftError::storage)?;
    Self::start(config, storage, transport, machine).await
  }

  /// Stop the background tasks. Waiting proposals resolve with `Shutdown`.
  pub async fn shutdown(&self) {
    {
      let mut st = self.shared.state.lock().await;
      st.stopped = true;
      st.role = Role::Follower;
      st.pending.clear();
    }
    self.shared.shutdown.send_replace(true);
    for task in self.tasks().drain(..) {
      task.abort();
    }
    info!(node_id = self.id(), "raft node stopped");
  }

  fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner)
  }

  // ─── Accessors ─────────────────────────────────────────────────────────────

  pub fn id(&self) -> NodeId { self.shared.config.node_id }

  pub fn config(&self) -> &RaftConfig { &self.shared.config }

  pub fn storage(&self) -> &S { &self.shared.storage }

  pub fn machine(&self) -> &M { &self.shared.machine }

  pub async fn status(&self) -> NodeStatus {
    let st = self.shared.state.lock().await;
    NodeStatus {
      node_id:        self.id(),
      role:           st.role,
      term:           st.term,
      leader:         st.leader,
      commit_index:   st.commit_index,
      last_applied:   st.last_applied,
      last_log_index: st.last_log.index,
    }
  }

  // ─── Client operations ─────────────────────────────────────────────────────

  /// Append `payload` to the log and wait for it to be applied locally.
  ///
  /// Fails with `NotLeader` on followers, `Timeout` once `deadline` passes,
  /// and `LeadershipLost` if the entry is overwritten by a newer leader. A
  /// timed-out entry may still commit later.
  pub async fn propose(
    &self,
    payload: EntryPayload,
    deadline: Instant,
  ) -> Result<Applied<M::Output>> {
    let (index, rx) = {
      let mut st = self.shared.state.lock().await;
      st.check_usable()?;
      if st.role != Role::Leader {
        return Err(RaftError::NotLeader { leader_hint: st.leader });
      }

      let entry = LogEntry::new(st.last_log.index + 1, st.term, payload);
      let index = entry.index;
      self.shared.storage.append(vec![entry]).await.map_err(RaftError::storage)?;
      st.last_log = LogId::new(index, st.term);

      let (tx, rx) = oneshot::channel();
      let term = st.term;
      st.pending.insert(index, Pending { term, tx });
      self.advance_commit(&mut st);
      (index, rx)
    };

    debug!(node_id = self.id(), index, "proposed entry");
    self.broadcast().await;

    match timeout_at(deadline, rx).await {
      Ok(Ok(result)) => result.map(|output| Applied { index, output }),
      Ok(Err(_)) => Err(RaftError::Shutdown),
      Err(_) => {
        self.shared.state.lock().await.pending.remove(&index);
        Err(RaftError::Timeout)
      }
    }
  }

  /// Wait until every entry committed before this leader's term has been
  /// applied locally, so local reads reflect all committed commands.
  pub async fn read_barrier(&self, deadline: Instant) -> Result<()> {
    let (term, target) = {
      let st = self.shared.state.lock().await;
      st.check_usable()?;
      if st.role != Role::Leader {
        return Err(RaftError::NotLeader { leader_hint: st.leader });
      }
      (st.term, st.term_start.max(st.commit_index))
    };

    let mut applied = self.shared.applied.subscribe();
    let reached = timeout_at(deadline, async {
      applied.wait_for(|index| *index >= target).await.is_ok()
    })
    .await;
    match reached {
      Ok(true) => {}
      Ok(false) => return Err(RaftError::Shutdown),
      Err(_) => return Err(RaftError::Timeout),
    }

    let st = self.shared.state.lock().await;
    if st.role == Role::Leader && st.term == term {
      Ok(())
    } else {
      Err(RaftError::LeadershipLost)
    }
  }

  // ─── RPC handlers ──────────────────────────────────────────────────────────

  pub async fn handle_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
    let mut st = self.shared.state.lock().await;
    st.check_usable()?;

    if request.term > st.term {
      self.become_follower(&mut st, request.term, None).await?;
    }
    if request.term < st.term {
      return Ok(VoteResponse { term: st.term, vote_granted: false });
    }

    let free = st.voted_for.is_none_or(|v| v == request.candidate_id);
    let candidate_log = LogId::new(request.last_log_index, request.last_log_term);
    let granted = free && candidate_log.is_up_to_date_with(&st.last_log);

    if granted {
      st.voted_for = Some(request.candidate_id);
      self.persist(&st).await?;
      st.election_deadline = Instant::now() + self.shared.config.random_election_timeout();
    }

    debug!(
      node_id = self.id(),
      term = st.term,
      candidate = request.candidate_id,
      granted,
      "vote requested"
    );
    Ok(VoteResponse { term: st.term, vote_granted: granted })
  }

  pub async fn handle_append(&self, request: AppendRequest) -> Result<AppendResponse> {
    let mut st = self.shared.state.lock().await;
    st.check_usable()?;

    if request.term < st.term {
      return Ok(AppendResponse::rejected(st.term, 0, None));
    }
    if request.term > st.term || st.role != Role::Follower {
      self.become_follower(&mut st, request.term, Some(request.leader_id)).await?;
    }
    st.leader = Some(request.leader_id);
    st.election_deadline = Instant::now() + self.shared.config.random_election_timeout();

    let storage = &self.shared.storage;

    // Log matching on the entry preceding the new ones.
    if request.prev_log_index > st.last_log.index {
      return Ok(AppendResponse::rejected(st.term, st.last_log.index + 1, None));
    }
    if request.prev_log_index > 0 {
      let local_term = storage
        .entry(request.prev_log_index)
        .await
        .map_err(RaftError::storage)?
        .map(|e| e.term)
        .ok_or_else(|| RaftError::CorruptLog {
          index:  request.prev_log_index,
          reason: "entry missing below the last index".into(),
        })?;
      if local_term != request.prev_log_term {
        let first = storage
          .first_index_in_term(local_term, request.prev_log_index)
          .await
          .map_err(RaftError::storage)?;
        return Ok(AppendResponse::rejected(st.term, first, Some(local_term)));
      }
    }

    let match_index = request.prev_log_index + request.entries.len() as u64;
    let new_entries = self.unmatched_suffix(&mut st, request.entries).await?;

    if let Some(first) = new_entries.first().map(|e| e.index) {
      if first <= st.last_log.index {
        info!(node_id = self.id(), from = first, "discarding conflicting log suffix");
        st.fail_pending_from(first);
      }
      let last = new_entries.last().map(LogEntry::log_id).unwrap_or_default();
      storage.append(new_entries).await.map_err(RaftError::storage)?;
      st.last_log = last;
    }

    if request.leader_commit > st.commit_index {
      let commit = request.leader_commit.min(match_index);
      if commit > st.commit_index {
        st.commit_index = commit;
        self.shared.commit_notify.notify_one();
      }
    }

    Ok(AppendResponse::accepted(st.term, match_index))
  }

  /// Skip the entries we already hold; the rest, starting at the first
  /// disagreement, must be written. Disagreeing with a committed entry means
  /// the log can no longer be trusted.
  async fn unmatched_suffix(
    &self,
    st: &mut Volatile<M::Output>,
    entries: Vec<LogEntry>,
  ) -> Result<Vec<LogEntry>> {
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
      return Ok(entries);
    };
    let overlap_end = last.index.min(st.last_log.index);
    let local: BTreeMap<u64, u64> = self
      .shared
      .storage
      .entries(first.index, overlap_end)
      .await
      .map_err(RaftError::storage)?
      .into_iter()
      .map(|e| (e.index, e.term))
      .collect();

    let split = entries
      .iter()
      .position(|e| local.get(&e.index) != Some(&e.term))
      .unwrap_or(entries.len());

    if let Some(conflict) = entries.get(split)
      && conflict.index <= st.commit_index
    {
      let reason = format!(
        "leader sent term {} over a committed entry (commit index {})",
        conflict.term, st.commit_index
      );
      error!(node_id = self.id(), index = conflict.index, %reason, "refusing to rewrite committed log");
      st.fault = Some((conflict.index, reason.clone()));
      return Err(RaftError::CorruptLog { index: conflict.index, reason });
    }

    let mut entries = entries;
    Ok(entries.split_off(split))
  }

  // ─── Role changes ──────────────────────────────────────────────────────────

  async fn persist(&self, st: &Volatile<M::Output>) -> Result<()> {
    self.shared.storage.save_hard_state(st.hard_state()).await.map_err(RaftError::storage)
  }

  async fn become_follower(
    &self,
    st: &mut Volatile<M::Output>,
    term: u64,
    leader: Option<NodeId>,
  ) -> Result<()> {
    let was = st.role;
    if term > st.term {
      st.term = term;
      st.voted_for = None;
      self.persist(st).await?;
    }
    st.role = Role::Follower;
    st.leader = leader;
    st.progress.clear();
    st.election_deadline = Instant::now() + self.shared.config.random_election_timeout();
    if was != Role::Follower {
      info!(node_id = self.id(), term = st.term, ?was, "stepped down to follower");
    }
    Ok(())
  }

  async fn run_election(&self) {
    let (request, deadline) = {
      let mut st = self.shared.state.lock().await;
      if st.check_usable().is_err() || st.role == Role::Leader {
        return;
      }
      st.term += 1;
      st.role = Role::Candidate;
      st.voted_for = Some(self.id());
      st.leader = None;
      st.election_deadline = Instant::now() + self.shared.config.random_election_timeout();
      if let Err(err) = self.persist(&st).await {
        error!(node_id = self.id(), %err, "failed to persist candidacy");
        return;
      }
      let request = VoteRequest {
        term:           st.term,
        candidate_id:   self.id(),
        last_log_index: st.last_log.index,
        last_log_term:  st.last_log.term,
      };
      (request, st.election_deadline)
    };
    info!(node_id = self.id(), term = request.term, "starting election");

    let quorum = self.shared.config.quorum();
    let mut ballots = JoinSet::new();
    for &peer in &self.shared.config.peers {
      let node = self.clone();
      let request = request.clone();
      ballots.spawn(async move { node.shared.transport.request_vote(peer, request).await });
    }

    let tally = timeout_at(deadline, async {
      let mut votes = 1;
      if votes >= quorum {
        return Ok(true);
      }
      while let Some(joined) = ballots.join_next().await {
        let Ok(Ok(response)) = joined else { continue };
        if response.term > request.term {
          return Err(response.term);
        }
        if response.vote_granted {
          votes += 1;
          if votes >= quorum {
            return Ok(true);
          }
        }
      }
      Ok(false)
    })
    .await;

    match tally {
      Ok(Ok(true)) => self.become_leader(request.term).await,
      Ok(Err(higher)) => {
        let mut st = self.shared.state.lock().await;
        if higher > st.term
          && let Err(err) = self.become_follower(&mut st, higher, None).await
        {
          error!(node_id = self.id(), %err, "failed to persist newer term");
        }
      }
      _ => debug!(node_id = self.id(), term = request.term, "election inconclusive"),
    }
  }

  async fn become_leader(&self, term: u64) {
    {
      let mut st = self.shared.state.lock().await;
      if st.role != Role::Candidate || st.term != term {
        return;
      }

      let noop = LogEntry::new(st.last_log.index + 1, term, EntryPayload::Noop);
      let index = noop.index;
      if let Err(err) = self.shared.storage.append(vec![noop]).await {
        error!(node_id = self.id(), %err, "failed to append leader noop");
        return;
      }

      let now = Instant::now();
      st.role = Role::Leader;
      st.leader = Some(self.id());
      st.last_log = LogId::new(index, term);
      st.term_start = index;
      st.leader_since = now;
      st.next_heartbeat = now + self.shared.config.heartbeat_interval;
      st.progress = self
        .shared
        .config
        .peers
        .iter()
        .map(|&peer| {
          (peer, Progress { next_index: index, match_index: 0, last_ack: now, inflight: false })
        })
        .collect();
      self.advance_commit(&mut st);
      info!(node_id = self.id(), term, "became leader");
    }
    self.broadcast().await;
  }

  // ─── Replication ───────────────────────────────────────────────────────────

  /// Start a replication round to every follower that has none in flight.
  async fn broadcast(&self) {
    let targets: Vec<NodeId> = {
      let mut st = self.shared.state.lock().await;
      if st.role != Role::Leader {
        return;
      }
      st.progress
        .iter_mut()
        .filter(|(_, p)| !p.inflight)
        .map(|(&peer, p)| {
          p.inflight = true;
          peer
        })
        .collect()
    };
    for peer in targets {
      tokio::spawn(self.clone().replicate_to(peer));
    }
  }

  /// Send appends to `peer` until it has caught up or an error ends the
  /// round. Runs with the peer's `inflight` flag set.
  async fn replicate_to(self, peer: NodeId) {
    loop {
      let request = match self.next_append(peer).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(err) => {
          error!(node_id = self.id(), peer, %err, "cannot build append request");
          self.finish_round(peer).await;
          return;
        }
      };
      let sent_term = request.term;
      let sent_next = request.prev_log_index + 1;

      let response = match self.shared.transport.append_entries(peer, request).await {
        Ok(response) => response,
        Err(err) => {
          debug!(node_id = self.id(), peer, %err, "append failed");
          self.finish_round(peer).await;
          return;
        }
      };

      let mut st = self.shared.state.lock().await;
      if response.term > st.term {
        if let Err(err) = self.become_follower(&mut st, response.term, None).await {
          error!(node_id = self.id(), %err, "failed to persist newer term");
        }
        return;
      }
      if st.role != Role::Leader || st.term != sent_term {
        return;
      }

      let last_index = st.last_log.index;
      let Some(progress) = st.progress.get_mut(&peer) else { return };
      progress.last_ack = Instant::now();

      if response.success {
        progress.match_index = progress.match_index.max(response.match_index);
        progress.next_index = progress.match_index + 1;
        let caught_up = progress.next_index > last_index;
        if caught_up {
          progress.inflight = false;
        }
        self.advance_commit(&mut st);
        if caught_up {
          return;
        }
      } else {
        let ceiling = sent_next.saturating_sub(1).max(1);
        progress.next_index = response.conflict_index.clamp(1, ceiling);
        debug!(node_id = self.id(), peer, next_index = progress.next_index, "follower log diverges");
      }
    }
  }

  /// The next request for `peer`, or `None` if this node is no longer
  /// leading (in which case the round is over).
  async fn next_append(&self, peer: NodeId) -> Result<Option<AppendRequest>> {
    let st = self.shared.state.lock().await;
    if st.role != Role::Leader || st.stopped {
      return Ok(None);
    }
    let Some(progress) = st.progress.get(&peer) else { return Ok(None) };

    let storage = &self.shared.storage;
    let next = progress.next_index.clamp(1, st.last_log.index + 1);
    let prev_log_index = next - 1;
    let prev_log_term = match prev_log_index {
      0 => 0,
      index => storage
        .entry(index)
        .await
        .map_err(RaftError::storage)?
        .map(|e| e.term)
        .ok_or_else(|| RaftError::CorruptLog {
          index,
          reason: "entry missing below the last index".into(),
        })?,
    };
    let upto = st
      .last_log
      .index
      .min(next + self.shared.config.max_append_entries as u64 - 1);
    let entries = storage.entries(next, upto).await.map_err(RaftError::storage)?;

    Ok(Some(AppendRequest {
      term: st.term,
      leader_id: self.id(),
      prev_log_index,
      prev_log_term,
      entries,
      leader_commit: st.commit_index,
    }))
  }

  async fn finish_round(&self, peer: NodeId) {
    if let Some(progress) = self.shared.state.lock().await.progress.get_mut(&peer) {
      progress.inflight = false;
    }
  }

  /// Commit the highest index stored on a majority, but only within this
  /// leader's own term.
  fn advance_commit(&self, st: &mut Volatile<M::Output>) {
    if st.role != Role::Leader {
      return;
    }
    let mut matched: Vec<u64> = st.progress.values().map(|p| p.match_index).collect();
    matched.push(st.last_log.index);
    matched.sort_unstable_by(|a, b| b.cmp(a));

    let majority = matched[self.shared.config.quorum() - 1];
    if majority > st.commit_index && majority >= st.term_start {
      st.commit_index = majority;
      self.shared.commit_notify.notify_one();
    }
  }

  // ─── Background tasks ──────────────────────────────────────────────────────

  async fn run_ticker(self) {
    let mut shutdown = self.shared.shutdown.subscribe();
    loop {
      tokio::select! {
        _ = sleep(self.shared.config.tick_interval) => {}
        _ = shutdown.changed() => return,
      }
      self.tick().await;
    }
  }

  async fn tick(&self) {
    let now = Instant::now();
    let (start_election, heartbeat) = {
      let mut st = self.shared.state.lock().await;
      if st.check_usable().is_err() {
        return;
      }
      match st.role {
        Role::Follower | Role::Candidate => (now >= st.election_deadline, false),
        Role::Leader => {
          if self.lost_quorum(&st, now) {
            warn!(node_id = self.id(), term = st.term, "lost contact with a majority");
            let term = st.term;
            if let Err(err) = self.become_follower(&mut st, term, None).await {
              error!(node_id = self.id(), %err, "failed to step down");
            }
            (false, false)
          } else if now >= st.next_heartbeat {
            st.next_heartbeat = now + self.shared.config.heartbeat_interval;
            (false, true)
          } else {
            (false, false)
          }
        }
      }
    };

    if start_election {
      self.run_election().await;
    } else if heartbeat {
      self.broadcast().await;
    }
  }

  /// A leader that has not heard from a majority for a full election timeout
  /// may already have been replaced.
  fn lost_quorum(&self, st: &Volatile<M::Output>, now: Instant) -> bool {
    let window = self.shared.config.election_timeout_max;
    if now.duration_since(st.leader_since) < window {
      return false;
    }
    let reachable = 1 + st
      .progress
      .values()
      .filter(|p| now.duration_since(p.last_ack) < window)
      .count();
    reachable < self.shared.config.quorum()
  }

  async fn run_applier(self) {
    let mut shutdown = self.shared.shutdown.subscribe();
    loop {
      let (commit, applied) = {
        let st = self.shared.state.lock().await;
        (st.commit_index, st.last_applied)
      };
      if applied >= commit {
        tokio::select! {
          _ = self.shared.commit_notify.notified() => {}
          _ = shutdown.changed() => return,
        }
        continue;
      }

      let upto = commit.min(applied + self.shared.config.max_append_entries as u64);
      let entries = match self.shared.storage.entries(applied + 1, upto).await {
        Ok(entries) => entries,
        Err(err) => {
          error!(node_id = self.id(), %err, "cannot read committed entries");
          sleep(self.shared.config.heartbeat_interval).await;
          continue;
        }
      };

      for entry in entries {
        if !self.apply_one(entry).await {
          sleep(self.shared.config.heartbeat_interval).await;
          break;
        }
      }
    }
  }

  /// Apply one committed entry and resolve its waiter. Returns `false` if the
  /// state machine failed; the entry is retried and its waiter keeps waiting
  /// until it applies or the write times out.
  async fn apply_one(&self, entry: LogEntry) -> bool {
    let LogId { index, term } = entry.log_id();
    let output = match self.shared.machine.apply(entry).await {
      Ok(output) => output,
      Err(err) => {
        error!(node_id = self.id(), index, %err, "state machine failed to apply entry");
        return false;
      }
    };

    let waiter = {
      let mut st = self.shared.state.lock().await;
      st.last_applied = index;
      st.pending.remove(&index)
    };
    self.shared.applied.send_replace(index);

    if let Some(pending) = waiter {
      let reply = if pending.term == term { Ok(output) } else { Err(RaftError::LeadershipLost) };
      let _ = pending.tx.send(reply);
    }
    true
  }
}
