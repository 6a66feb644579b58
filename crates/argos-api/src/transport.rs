//! [`Transport`] over the peer routes of [`crate::peer_router`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use argos_raft::{
  AppendRequest, AppendResponse, NodeId, Transport, TransportError, VoteRequest, VoteResponse,
};
use reqwest::Client;
use serde::{Serialize, de::DeserializeOwned};

use crate::CLUSTER_TOKEN_HEADER;

/// Sends consensus RPCs to peers as JSON over HTTP.
///
/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  /// Peer id to base URL, e.g. `http://10.0.0.2:7070`.
  peers:  Arc<BTreeMap<NodeId, String>>,
  token:  Option<Arc<str>>,
}

impl HttpTransport {
  pub fn new(
    peers: BTreeMap<NodeId, String>,
    token: Option<String>,
    timeout: Duration,
  ) -> Result<Self, TransportError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::Http(e.to_string()))?;
    Ok(Self { client, peers: Arc::new(peers), token: token.map(Arc::from) })
  }

  fn url(&self, target: NodeId, path: &str) -> Result<String, TransportError> {
    let base = self.peers.get(&target).ok_or(TransportError::Unreachable(target))?;
    Ok(format!("{}{}", base.trim_end_matches('/'), path))
  }

  async fn call<Req, Resp>(&self, target: NodeId, path: &str, request: &Req) -> Result<Resp, TransportError>
  where
    Req: Serialize,
    Resp: DeserializeOwned,
  {
    let mut req = self.client.post(self.url(target, path)?).json(request);
    if let Some(token) = &self.token {
      req = req.header(CLUSTER_TOKEN_HEADER, token.as_ref());
    }

    let resp = req.send().await.map_err(|e| classify(target, e))?;
    let status = resp.status();
    if !status.is_success() {
      let body = resp.text().await.unwrap_or_default();
      return Err(TransportError::Remote(format!("POST {path} → {status}: {body}")));
    }
    resp.json().await.map_err(|e| classify(target, e))
  }
}

fn classify(target: NodeId, err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout(target)
  } else if err.is_connect() {
    TransportError::Unreachable(target)
  } else {
    TransportError::Http(err.to_string())
  }
}

impl Transport for HttpTransport {
  async fn request_vote(
    &self,
    target: NodeId,
    request: VoteRequest,
  ) -> Result<VoteResponse, TransportError> {
    self.call(target, "/raft/vote", &request).await
  }

  async fn append_entries(
    &self,
    target: NodeId,
    request: AppendRequest,
  ) -> Result<AppendResponse, TransportError> {
    self.call(target, "/raft/append", &request).await
  }
}
