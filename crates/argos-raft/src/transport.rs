use std::future::Future;

use thiserror::Error;

use crate::{
  rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse},
  types::NodeId,
};

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("node {0} is unreachable")]
  Unreachable(NodeId),

  #[error("request to node {0} timed out")]
  Timeout(NodeId),

  #[error("remote error: {0}")]
  Remote(String),

  #[error("http error: {0}")]
  Http(String),
}

/// Sends RPCs to peers. One instance per node; `target` is the peer's id.
pub trait Transport: Send + Sync + 'static {
  fn request_vote(
    &self,
    target: NodeId,
    request: VoteRequest,
  ) -> impl Future<Output = Result<VoteResponse, TransportError>> + Send + '_;

  fn append_entries(
    &self,
    target: NodeId,
    request: AppendRequest,
  ) -> impl Future<Output = Result<AppendResponse, TransportError>> + Send + '_;
}
