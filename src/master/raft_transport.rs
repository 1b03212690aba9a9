//! Raft RPC transports
//!
//! Masters exchange bincode-encoded Raft messages over HTTP
//! (`POST /raft/vote`, `/raft/append`, `/raft/snapshot`). The in-memory
//! transport wires nodes of one process together and can partition them.

use crate::common::raft::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::common::{Error, PeerConfig, Result};
use crate::master::raft_node::RaftNode;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &PeerConfig, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, peer: &PeerConfig, req: AppendRequest)
        -> Result<AppendResponse>;

    async fn install_snapshot(
        &self,
        peer: &PeerConfig,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse>;
}

/// Raft over HTTP with bincode bodies
pub struct HttpRaftTransport {
    client: reqwest::Client,
}

impl HttpRaftTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { client })
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        url: String,
        req: &Req,
    ) -> Result<Resp> {
        let body = bincode::serialize(req)?;
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/octet-stream")
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("{} returned {}", url, resp.status())));
        }
        let bytes = resp.bytes().await?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[async_trait]
impl RaftTransport for HttpRaftTransport {
    async fn request_vote(&self, peer: &PeerConfig, req: VoteRequest) -> Result<VoteResponse> {
        self.post(format!("{}/raft/vote", peer.url), &req).await
    }

    async fn append_entries(
        &self,
        peer: &PeerConfig,
        req: AppendRequest,
    ) -> Result<AppendResponse> {
        self.post(format!("{}/raft/append", peer.url), &req).await
    }

    async fn install_snapshot(
        &self,
        peer: &PeerConfig,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        self.post(format!("{}/raft/snapshot", peer.url), &req).await
    }
}

/// Routes Raft messages between nodes living in the same process.
///
/// Nodes are registered by id; a node that is isolated neither sends nor
/// receives.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Weak<RaftNode>>>,
    isolated: RwLock<HashSet<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .insert(node.id().to_string(), Arc::downgrade(node));
    }

    pub fn isolate(&self, id: &str) {
        self.isolated.write().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.isolated.write().remove(id);
    }

    /// Transport handle for the node called `from`.
    pub fn transport(self: &Arc<Self>, from: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            from: from.to_string(),
        })
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<RaftNode>> {
        let isolated = self.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return Err(Error::ConnectionFailed(format!("{} -> {} partitioned", from, to)));
        }
        drop(isolated);
        self.nodes
            .read()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("{} is not reachable", to)))
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    from: String,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn request_vote(&self, peer: &PeerConfig, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.network.route(&self.from, &peer.id)?;
        node.handle_vote(req)
    }

    async fn append_entries(
        &self,
        peer: &PeerConfig,
        req: AppendRequest,
    ) -> Result<AppendResponse> {
        let node = self.network.route(&self.from, &peer.id)?;
        let resp = node.handle_append(req)?;
        // A reply can be lost on the way back, too
        self.network.route(&self.from, &peer.id)?;
        Ok(resp)
    }

    async fn install_snapshot(
        &self,
        peer: &PeerConfig,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        let node = self.network.route(&self.from, &peer.id)?;
        node.handle_snapshot(req)
    }
}
