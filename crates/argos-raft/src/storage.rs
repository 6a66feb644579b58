//! Durable consensus state: the hard state and the log itself.

use std::{
  convert::Infallible,
  future::Future,
  sync::{Arc, Mutex, PoisonError},
};

use crate::types::{HardState, LogEntry, LogId};

/// Result of checking a stored log on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogIntegrity {
  Intact,
  Corrupt { index: u64, reason: String },
}

/// Checks index contiguity from 1 and non-decreasing terms, none beyond
/// `current_term`. Backends with extra per-entry checks run those first.
pub fn check_sequence<'a>(
  current_term: u64,
  entries: impl IntoIterator<Item = &'a LogEntry>,
) -> LogIntegrity {
  let mut expected = 1;
  let mut last_term = 0;
  for entry in entries {
    if entry.index != expected {
      return LogIntegrity::Corrupt {
        index:  entry.index,
        reason: format!("expected index {expected}"),
      };
    }
    if entry.term < last_term {
      return LogIntegrity::Corrupt {
        index:  entry.index,
        reason: format!("term {} follows term {last_term}", entry.term),
      };
    }
    if entry.term > current_term {
      return LogIntegrity::Corrupt {
        index:  entry.index,
        reason: format!("term {} is ahead of current term {current_term}", entry.term),
      };
    }
    expected += 1;
    last_term = entry.term;
  }
  LogIntegrity::Intact
}

/// Every write must be durable before the returned future resolves.
pub trait RaftStorage: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn hard_state(&self) -> impl Future<Output = Result<HardState, Self::Error>> + Send + '_;

  fn save_hard_state(
    &self,
    state: HardState,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Index and term of the last entry; `(0, 0)` for an empty log.
  fn last_log_id(&self) -> impl Future<Output = Result<LogId, Self::Error>> + Send + '_;

  /// Entries `from..=to` in index order; empty when `from > to`.
  fn entries(
    &self,
    from: u64,
    to: u64,
  ) -> impl Future<Output = Result<Vec<LogEntry>, Self::Error>> + Send + '_;

  fn entry(
    &self,
    index: u64,
  ) -> impl Future<Output = Result<Option<LogEntry>, Self::Error>> + Send + '_ {
    async move { Ok(self.entries(index, index).await?.into_iter().next()) }
  }

  /// Lowest index holding `term`, searching no further than `at_or_before`.
  fn first_index_in_term(
    &self,
    term: u64,
    at_or_before: u64,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Write `entries` (contiguous, ascending), first discarding every stored
  /// entry at or after the first one's index.
  fn append(
    &self,
    entries: Vec<LogEntry>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Drop the whole log, keeping the hard state.
  fn reset_log(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn verify(&self) -> impl Future<Output = Result<LogIntegrity, Self::Error>> + Send + '_;
}

// ─── MemoryStorage ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
  hard: HardState,
  log:  Vec<LogEntry>,
}

/// Volatile storage for tests and single-process clusters. Clones share the
/// same state, so a "restarted" node can be handed its old log.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
  inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
  pub fn new() -> Self { Self::default() }

  /// Seed storage with an arbitrary, possibly inconsistent, log.
  pub fn with_log(hard: HardState, log: Vec<LogEntry>) -> Self {
    Self { inner: Arc::new(Mutex::new(MemoryInner { hard, log })) }
  }

  /// A copy of the whole log.
  pub fn log(&self) -> Vec<LogEntry> { self.with(|inner| inner.log.clone()) }

  fn with<R>(&self, f: impl FnOnce(&mut MemoryInner) -> R) -> R {
    let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
  }
}

impl RaftStorage for MemoryStorage {
  type Error = Infallible;

  async fn hard_state(&self) -> Result<HardState, Infallible> { Ok(self.with(|inner| inner.hard)) }

  async fn save_hard_state(&self, state: HardState) -> Result<(), Infallible> {
    self.with(|inner| inner.hard = state);
    Ok(())
  }

  async fn last_log_id(&self) -> Result<LogId, Infallible> {
    Ok(self.with(|inner| inner.log.last().map(LogEntry::log_id).unwrap_or_default()))
  }

  async fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, Infallible> {
    Ok(self.with(|inner| {
      inner
        .log
        .iter()
        .filter(|e| e.index >= from && e.index <= to)
        .cloned()
        .collect()
    }))
  }

  async fn first_index_in_term(&self, term: u64, at_or_before: u64) -> Result<u64, Infallible> {
    Ok(self.with(|inner| {
      inner
        .log
        .iter()
        .filter(|e| e.term == term && e.index <= at_or_before)
        .map(|e| e.index)
        .min()
        .unwrap_or(at_or_before)
    }))
  }

  async fn append(&self, entries: Vec<LogEntry>) -> Result<(), Infallible> {
    let Some(first) = entries.first().map(|e| e.index) else { return Ok(()) };
    self.with(|inner| {
      inner.log.retain(|e| e.index < first);
      inner.log.extend(entries);
    });
    Ok(())
  }

  async fn reset_log(&self) -> Result<(), Infallible> {
    self.with(|inner| inner.log.clear());
    Ok(())
  }

  async fn verify(&self) -> Result<LogIntegrity, Infallible> {
    Ok(self.with(|inner| check_sequence(inner.hard.current_term, &inner.log)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::EntryPayload;

  fn noop(index: u64, term: u64) -> LogEntry { LogEntry::new(index, term, EntryPayload::Noop) }

  #[tokio::test]
  async fn append_truncates_the_conflicting_suffix() {
    let storage = MemoryStorage::new();
    storage.append(vec![noop(1, 1), noop(2, 1), noop(3, 1)]).await.unwrap();
    storage.append(vec![noop(2, 2)]).await.unwrap();

    let log = storage.log();
    assert_eq!(log.iter().map(LogEntry::log_id).collect::<Vec<_>>(), [
      LogId::new(1, 1),
      LogId::new(2, 2)
    ]);
    assert_eq!(storage.last_log_id().await.unwrap(), LogId::new(2, 2));
  }

  #[tokio::test]
  async fn first_index_in_term_finds_the_start_of_a_run() {
    let storage = MemoryStorage::new();
    storage
      .append(vec![noop(1, 1), noop(2, 2), noop(3, 2), noop(4, 2), noop(5, 3)])
      .await
      .unwrap();
    assert_eq!(storage.first_index_in_term(2, 4).await.unwrap(), 2);
    assert_eq!(storage.first_index_in_term(3, 5).await.unwrap(), 5);
  }

  #[test]
  fn sequence_checks() {
    assert_eq!(check_sequence(2, &[noop(1, 1), noop(2, 2)]), LogIntegrity::Intact);
    assert!(matches!(
      check_sequence(2, &[noop(1, 1), noop(3, 1)]),
      LogIntegrity::Corrupt { index: 3, .. }
    ));
    assert!(matches!(
      check_sequence(2, &[noop(1, 2), noop(2, 1)]),
      LogIntegrity::Corrupt { index: 2, .. }
    ));
    assert!(matches!(check_sequence(1, &[noop(1, 4)]), LogIntegrity::Corrupt { index: 1, .. }));
  }
}
