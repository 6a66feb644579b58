use std::future::Future;

use crate::types::LogEntry;

/// Consumer of committed entries.
///
/// Entries arrive exactly in index order, once per node start. After a
/// restart the applier begins again at index 1, so `apply` must tolerate
/// entries whose effects are already durable.
pub trait StateMachine: Send + Sync + 'static {
  type Output: Send + 'static;
  type Error: std::error::Error + Send + Sync + 'static;

  fn apply(
    &self,
    entry: LogEntry,
  ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send + '_;
}
