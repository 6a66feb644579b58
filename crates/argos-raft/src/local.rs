//! In-process transport for multi-node clusters inside one runtime.
//!
//! Every registered node gets a dispatcher task that receives RPCs over a
//! channel and answers them by calling the node's handlers. Partitions and
//! isolated nodes are checked when a request is sent.

use std::{
  collections::{BTreeSet, HashMap},
  sync::{Arc, Mutex, PoisonError},
  time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::{
  machine::StateMachine,
  node::RaftNode,
  rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse},
  storage::RaftStorage,
  transport::{Transport, TransportError},
  types::NodeId,
};

type Reply<R> = oneshot::Sender<Result<R, TransportError>>;

enum Rpc {
  Vote(VoteRequest, Reply<VoteResponse>),
  Append(AppendRequest, Reply<AppendResponse>),
}

#[derive(Default)]
struct NetState {
  endpoints: HashMap<NodeId, mpsc::UnboundedSender<Rpc>>,
  /// When set, only nodes in the same group can talk.
  groups:    Option<Vec<BTreeSet<NodeId>>>,
  down:      BTreeSet<NodeId>,
}

impl NetState {
  fn connected(&self, from: NodeId, to: NodeId) -> bool {
    if self.down.contains(&from) || self.down.contains(&to) {
      return false;
    }
    match &self.groups {
      None => true,
      Some(groups) => groups.iter().any(|g| g.contains(&from) && g.contains(&to)),
    }
  }
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
  inner: Arc<Mutex<NetState>>,
}

impl LocalNetwork {
  pub fn new() -> Self { Self::default() }

  fn with<R>(&self, f: impl FnOnce(&mut NetState) -> R) -> R {
    let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
  }

  /// The transport node `from` uses to reach its peers.
  pub fn transport(&self, from: NodeId) -> LocalTransport {
    LocalTransport { from, net: self.clone(), timeout: Duration::from_millis(100) }
  }

  /// Route RPCs addressed to `node` to its handlers. Replaces any previous
  /// registration under the same id.
  pub fn register<S, T, M>(&self, node: &RaftNode<S, T, M>)
  where
    S: RaftStorage,
    T: Transport,
    M: StateMachine,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<Rpc>();
    self.with(|net| net.endpoints.insert(node.id(), tx));

    let node = node.clone();
    tokio::spawn(async move {
      while let Some(rpc) = rx.recv().await {
        let node = node.clone();
        tokio::spawn(async move {
          match rpc {
            Rpc::Vote(request, reply) => {
              let result = node.handle_vote(request).await;
              let _ = reply.send(result.map_err(|e| TransportError::Remote(e.to_string())));
            }
            Rpc::Append(request, reply) => {
              let result = node.handle_append(request).await;
              let _ = reply.send(result.map_err(|e| TransportError::Remote(e.to_string())));
            }
          }
        });
      }
    });
  }

  /// Drop `node` from the network; its dispatcher exits.
  pub fn remove(&self, node: NodeId) { self.with(|net| net.endpoints.remove(&node)); }

  /// Split the cluster; nodes in different groups cannot reach each other.
  /// A node listed in no group is cut off from everyone.
  pub fn partition(&self, groups: &[&[NodeId]]) {
    let groups = groups.iter().map(|g| g.iter().copied().collect()).collect();
    self.with(|net| net.groups = Some(groups));
  }

  pub fn isolate(&self, node: NodeId) { self.with(|net| net.down.insert(node)); }

  /// Restore full connectivity.
  pub fn heal(&self) {
    self.with(|net| {
      net.groups = None;
      net.down.clear();
    });
  }
}

pub struct LocalTransport {
  from:    NodeId,
  net:     LocalNetwork,
  timeout: Duration,
}

impl LocalTransport {
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  fn route(&self, to: NodeId) -> Result<mpsc::UnboundedSender<Rpc>, TransportError> {
    self.net.with(|net| {
      if !net.connected(self.from, to) {
        return Err(TransportError::Unreachable(to));
      }
      net.endpoints.get(&to).cloned().ok_or(TransportError::Unreachable(to))
    })
  }

  async fn call<R>(
    &self,
    to: NodeId,
    build: impl FnOnce(Reply<R>) -> Rpc,
  ) -> Result<R, TransportError> {
    let endpoint = self.route(to)?;
    let (tx, rx) = oneshot::channel();
    endpoint.send(build(tx)).map_err(|_| TransportError::Unreachable(to))?;
    trace!(from = self.from, to, "rpc sent");
    match tokio::time::timeout(self.timeout, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(TransportError::Unreachable(to)),
      Err(_) => Err(TransportError::Timeout(to)),
    }
  }
}

impl Transport for LocalTransport {
  async fn request_vote(
    &self,
    target: NodeId,
    request: VoteRequest,
  ) -> Result<VoteResponse, TransportError> {
    self.call(target, |reply| Rpc::Vote(request, reply)).await
  }

  async fn append_entries(
    &self,
    target: NodeId,
    request: AppendRequest,
  ) -> Result<AppendResponse, TransportError> {
    self.call(target, |reply| Rpc::Append(request, reply)).await
  }
}
