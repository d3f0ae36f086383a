// Raft network layer for inter-node communication
// Implements openraft's network traits as JSON over HTTP

use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{NodeId, TypeConfig};

/// HTTP path prefix of the raft RPC endpoints
pub const RAFT_PATH: &str = "raft";

/// Factory for creating Raft network connections
#[derive(Clone)]
pub struct HttpRaftNetworkFactory {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRaftNetworkFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpRaftNetworkFactory {
    type Network = HttpRaftConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        HttpRaftConnection {
            target,
            addr: node.addr.clone(),
            client: self.client.clone(),
            timeout: self.timeout,
        }
    }
}

/// A connection to a remote Raft node
pub struct HttpRaftConnection {
    target: NodeId,
    addr: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRaftConnection {
    fn endpoint(&self, rpc: &str) -> String {
        format!("http://{}/{}/{}", self.addr, RAFT_PATH, rpc)
    }

    /// POST `req` and decode the remote `Result<Resp, Err>`
    async fn send_rpc<Req, Resp, Err>(
        &self,
        rpc: &str,
        req: &Req,
    ) -> Result<Resp, RPCError<NodeId, BasicNode, Err>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        Err: std::error::Error + DeserializeOwned,
    {
        let url = self.endpoint(rpc);
        debug!(target = self.target, %url, "Sending raft RPC");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                warn!(target = self.target, %url, error = %e, "Raft RPC failed");
                if e.is_connect() {
                    RPCError::Unreachable(Unreachable::new(&e))
                } else {
                    RPCError::Network(NetworkError::new(&e))
                }
            })?;

        let result: Result<Resp, Err> = response
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for HttpRaftConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send_rpc("append", &req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send_rpc("snapshot", &req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send_rpc("vote", &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_paths() {
        let mut factory = HttpRaftNetworkFactory::new(Duration::from_millis(100));
        let conn = factory
            .new_client(7, &BasicNode::new("10.0.0.1:9848"))
            .await;
        assert_eq!(conn.endpoint("append"), "http://10.0.0.1:9848/raft/append");
        assert_eq!(conn.target, 7);
    }

    #[tokio::test]
    async fn test_unreachable_peer_maps_to_rpc_error() {
        let mut factory = HttpRaftNetworkFactory::new(Duration::from_millis(200));
        // Port 9 (discard) on localhost is not expected to accept connections
        let mut conn = factory.new_client(2, &BasicNode::new("127.0.0.1:9")).await;
        let req = VoteRequest::new(openraft::Vote::new(1, 1), None);
        let result = conn.vote(req, RPCOption::new(Duration::from_millis(200))).await;
        assert!(matches!(
            result,
            Err(RPCError::Unreachable(_)) | Err(RPCError::Network(_))
        ));
    }
}
