//! Per-entity read/write locks with leases.
//!
//! Requests are granted strictly in arrival order: a read waits behind any
//! queued write, so a steady stream of readers cannot starve a writer. Every
//! grant is a [`Lease`] with a deadline; dropping the lease releases it, and a
//! lease that outlives its deadline is revoked and handed to the next waiter.
//!
//! Nothing here detects deadlock. Callers that need several locks go through
//! [`LockManager::acquire_all`], which always acquires in `(kind, id)` order.

use std::{
  collections::{BTreeMap, HashMap, VecDeque},
  sync::{
    Arc, Mutex, PoisonError, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Duration,
};

use argos_core::stream::StreamId;
use thiserror::Error;
use tokio::{
  sync::oneshot,
  task::JoinHandle,
  time::{Instant, timeout_at},
};
use tracing::{debug, warn};

pub type LockKey = StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
  Read,
  Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
  #[error("timed out waiting for {mode:?} lock on {key}")]
  Timeout { key: LockKey, mode: LockMode },

  #[error("lease on {key} expired and was revoked")]
  Revoked { key: LockKey },
}

// ─── Table ───────────────────────────────────────────────────────────────────

struct Holder {
  expires_at: Instant,
  revoked:    Arc<AtomicBool>,
}

struct Grant {
  id:         u64,
  mode:       LockMode,
  expires_at: Instant,
  revoked:    Arc<AtomicBool>,
}

struct Waiter {
  id:   u64,
  mode: LockMode,
  tx:   oneshot::Sender<Grant>,
}

#[derive(Default)]
struct Entry {
  readers: BTreeMap<u64, Holder>,
  writer:  Option<(u64, Holder)>,
  queue:   VecDeque<Waiter>,
}

impl Entry {
  fn is_idle(&self) -> bool {
    self.readers.is_empty() && self.writer.is_none() && self.queue.is_empty()
  }

  fn compatible(&self, mode: LockMode) -> bool {
    match mode {
      LockMode::Read => self.writer.is_none(),
      LockMode::Write => self.writer.is_none() && self.readers.is_empty(),
    }
  }

  fn hold(&mut self, id: u64, mode: LockMode, ttl: Duration) -> Grant {
    let expires_at = Instant::now() + ttl;
    let revoked = Arc::new(AtomicBool::new(false));
    let holder = Holder { expires_at, revoked: Arc::clone(&revoked) };
    match mode {
      LockMode::Read => {
        self.readers.insert(id, holder);
      }
      LockMode::Write => self.writer = Some((id, holder)),
    }
    Grant { id, mode, expires_at, revoked }
  }

  fn release(&mut self, id: u64) -> bool {
    if self.writer.as_ref().is_some_and(|(w, _)| *w == id) {
      self.writer = None;
      return true;
    }
    self.readers.remove(&id).is_some()
  }

  /// Revoke every holder past its deadline. Returns how many were revoked.
  fn reap(&mut self, key: &LockKey, now: Instant) -> usize {
    let mut reaped = 0;
    if let Some((id, holder)) = &self.writer
      && holder.expires_at <= now
    {
      warn!(%key, lease = id, "revoking expired write lease");
      holder.revoked.store(true, Ordering::SeqCst);
      self.writer = None;
      reaped += 1;
    }
    self.readers.retain(|id, holder| {
      let keep = holder.expires_at > now;
      if !keep {
        warn!(%key, lease = id, "revoking expired read lease");
        holder.revoked.store(true, Ordering::SeqCst);
        reaped += 1;
      }
      keep
    });
    reaped
  }

  /// Grant queued requests from the front for as long as they fit.
  fn promote(&mut self, ttl: Duration) {
    while let Some(front) = self.queue.front() {
      if front.tx.is_closed() {
        self.queue.pop_front();
        continue;
      }
      if !self.compatible(front.mode) {
        break;
      }
      let Some(waiter) = self.queue.pop_front() else { break };
      let grant = self.hold(waiter.id, waiter.mode, ttl);
      if let Err(grant) = waiter.tx.send(grant) {
        // The requester gave up between the check and the send.
        self.release(grant.id);
      }
    }
  }
}

struct Inner {
  table:   Mutex<HashMap<LockKey, Entry>>,
  next_id: AtomicU64,
  ttl:     Duration,
}

impl Inner {
  fn with<R>(&self, f: impl FnOnce(&mut HashMap<LockKey, Entry>) -> R) -> R {
    let mut guard = self.table.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
  }

  fn release(&self, key: &LockKey, id: u64) {
    let ttl = self.ttl;
    self.with(|table| {
      let Some(entry) = table.get_mut(key) else { return };
      if entry.release(id) {
        entry.promote(ttl);
      }
      if entry.is_idle() {
        table.remove(key);
      }
    });
  }
}

// ─── LockManager ─────────────────────────────────────────────────────────────

/// Node-local lock table. Clones share the table.
#[derive(Clone)]
pub struct LockManager {
  inner: Arc<Inner>,
}

impl LockManager {
  /// `lease_ttl` bounds how long any grant may be held.
  pub fn new(lease_ttl: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        table:   Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        ttl:     lease_ttl,
      }),
    }
  }

  pub async fn acquire(&self, key: LockKey, mode: LockMode, timeout: Duration) -> Result<Lease, LockError> {
    self.acquire_until(key, mode, Instant::now() + timeout).await
  }

  async fn acquire_until(&self, key: LockKey, mode: LockMode, deadline: Instant) -> Result<Lease, LockError> {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let ttl = self.inner.ttl;

    let queued = self.inner.with(|table| {
      let entry = table.entry(key.clone()).or_default();
      entry.reap(&key, Instant::now());
      entry.promote(ttl);
      if entry.queue.is_empty() && entry.compatible(mode) {
        Ok(entry.hold(id, mode, ttl))
      } else {
        let (tx, rx) = oneshot::channel();
        entry.queue.push_back(Waiter { id, mode, tx });
        Err(rx)
      }
    });

    let mut rx = match queued {
      Ok(grant) => return Ok(self.lease(key, grant)),
      Err(rx) => rx,
    };

    if let Ok(Ok(grant)) = timeout_at(deadline, &mut rx).await {
      return Ok(self.lease(key, grant));
    }

    // Timed out: withdraw, unless the grant raced the deadline.
    let withdrawn = self.inner.with(|table| {
      let Some(entry) = table.get_mut(&key) else { return true };
      let before = entry.queue.len();
      entry.queue.retain(|w| w.id != id);
      let withdrawn = entry.queue.len() != before;
      if withdrawn {
        entry.promote(ttl);
      }
      if entry.is_idle() {
        table.remove(&key);
      }
      withdrawn
    });
    if !withdrawn && let Ok(grant) = rx.try_recv() {
      return Ok(self.lease(key, grant));
    }

    debug!(%key, ?mode, "lock wait timed out");
    Err(LockError::Timeout { key, mode })
  }

  fn lease(&self, key: LockKey, grant: Grant) -> Lease {
    Lease {
      key,
      id: grant.id,
      mode: grant.mode,
      expires_at: grant.expires_at,
      revoked: grant.revoked,
      manager: self.clone(),
    }
  }

  /// Acquire every lock in `set`, in `(kind, id)` order, within one overall
  /// timeout. On failure everything already acquired is released.
  pub async fn acquire_all(&self, set: &LockSet, timeout: Duration) -> Result<Leases, LockError> {
    let deadline = Instant::now() + timeout;
    let mut leases = Vec::with_capacity(set.len());
    for (key, mode) in set.iter() {
      leases.push(self.acquire_until(key.clone(), mode, deadline).await?);
    }
    Ok(Leases { leases })
  }

  /// Revoke every expired lease and wake whoever is next. Returns the number
  /// of leases revoked.
  pub fn reap_expired(&self) -> usize {
    let ttl = self.inner.ttl;
    let now = Instant::now();
    self.inner.with(|table| {
      let mut reaped = 0;
      for (key, entry) in table.iter_mut() {
        reaped += entry.reap(key, now);
        entry.promote(ttl);
      }
      table.retain(|_, entry| !entry.is_idle());
      reaped
    })
  }

  /// Run [`reap_expired`](Self::reap_expired) every `interval` until the
  /// manager is dropped.
  pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { return };
        let reaped = LockManager { inner }.reap_expired();
        if reaped > 0 {
          debug!(reaped, "reaped expired leases");
        }
      }
    })
  }

  /// Keys with any holder or waiter.
  pub fn held_keys(&self) -> Vec<LockKey> {
    let mut keys: Vec<LockKey> = self.inner.with(|table| table.keys().cloned().collect());
    keys.sort();
    keys
  }
}

// ─── Lease ───────────────────────────────────────────────────────────────────

/// A granted lock. Released on drop.
pub struct Lease {
  key:        LockKey,
  id:         u64,
  mode:       LockMode,
  expires_at: Instant,
  revoked:    Arc<AtomicBool>,
  manager:    LockManager,
}

impl Lease {
  pub fn key(&self) -> &LockKey { &self.key }

  pub fn mode(&self) -> LockMode { self.mode }

  pub fn expires_at(&self) -> Instant { self.expires_at }

  pub fn is_valid(&self) -> bool {
    !self.revoked.load(Ordering::SeqCst) && Instant::now() < self.expires_at
  }

  /// Fails once the lease has expired or been revoked; the work done under
  /// it must be abandoned.
  pub fn ensure_valid(&self) -> Result<(), LockError> {
    if self.is_valid() { Ok(()) } else { Err(LockError::Revoked { key: self.key.clone() }) }
  }

  /// Turn a read lease into a write lease. Immediate when this is the only
  /// reader; otherwise the read is released and a write is queued afresh.
  pub async fn upgrade(mut self, timeout: Duration) -> Result<Lease, LockError> {
    if self.mode == LockMode::Write {
      return Ok(self);
    }
    self.ensure_valid()?;

    let id = self.id;
    let in_place = self.manager.inner.with(|table| {
      let Some(entry) = table.get_mut(&self.key) else { return false };
      let sole_reader = entry.writer.is_none()
        && entry.readers.len() == 1
        && entry.readers.contains_key(&id);
      if sole_reader && let Some(holder) = entry.readers.remove(&id) {
        entry.writer = Some((id, holder));
        return true;
      }
      false
    });

    if in_place {
      self.mode = LockMode::Write;
      return Ok(self);
    }

    let manager = self.manager.clone();
    let key = self.key.clone();
    drop(self);
    manager.acquire(key, LockMode::Write, timeout).await
  }
}

impl Drop for Lease {
  fn drop(&mut self) { self.manager.inner.release(&self.key, self.id); }
}

impl std::fmt::Debug for Lease {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Lease")
      .field("key", &self.key)
      .field("id", &self.id)
      .field("mode", &self.mode)
      .finish()
  }
}

/// Leases of one command, released together.
#[derive(Debug)]
pub struct Leases {
  leases: Vec<Lease>,
}

impl Leases {
  pub fn ensure_valid(&self) -> Result<(), LockError> {
    self.leases.iter().try_for_each(Lease::ensure_valid)
  }

  pub fn len(&self) -> usize { self.leases.len() }

  pub fn is_empty(&self) -> bool { self.leases.is_empty() }
}

// ─── LockSet ─────────────────────────────────────────────────────────────────

/// The locks one command needs, kept in acquisition order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
  requests: BTreeMap<LockKey, LockMode>,
}

impl LockSet {
  pub fn new() -> Self { Self::default() }

  /// Add a request; a key asked for twice gets the stronger mode.
  pub fn insert(&mut self, key: LockKey, mode: LockMode) -> &mut Self {
    let slot = self.requests.entry(key).or_insert(mode);
    *slot = (*slot).max(mode);
    self
  }

  pub fn read(mut self, key: LockKey) -> Self {
    self.insert(key, LockMode::Read);
    self
  }

  pub fn write(mut self, key: LockKey) -> Self {
    self.insert(key, LockMode::Write);
    self
  }

  pub fn iter(&self) -> impl Iterator<Item = (&LockKey, LockMode)> {
    self.requests.iter().map(|(key, mode)| (key, *mode))
  }

  pub fn len(&self) -> usize { self.requests.len() }

  pub fn is_empty(&self) -> bool { self.requests.is_empty() }

  /// Whether holding `self` is enough to do what `needed` asks for.
  pub fn covers(&self, needed: &LockSet) -> bool {
    needed
      .iter()
      .all(|(key, mode)| self.requests.get(key).is_some_and(|held| *held >= mode))
  }
}
