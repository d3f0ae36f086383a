// RaftNode wrapper for managing Raft lifecycle
// Provides a high-level API for appending registry commands to the log

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use openraft::error::{CheckIsLeaderError, ClientWriteError, RaftError};
use openraft::{BasicNode, ServerState};
use tracing::{debug, info, warn};
use trellis_common::{EventBus, TrellisError};

use super::config::RaftConfig;
use super::log_store::RocksLogStore;
use super::network::HttpRaftNetworkFactory;
use super::reader::RocksDbReader;
use super::request::{RaftRequest, RaftResponse};
use super::state_machine::RocksStateMachine;
use super::types::{NodeId, Raft, RaftMetrics};

/// High-level wrapper for a registry Raft node
pub struct RaftNode {
    node_id: NodeId,
    /// Address other nodes use for raft RPC
    addr: String,
    raft: Raft,
    reader: RocksDbReader,
    config: RaftConfig,
}

impl RaftNode {
    pub async fn new(
        node_id: NodeId,
        addr: String,
        config: RaftConfig,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        info!(
            "Creating Raft node: id={}, addr={}, data_dir={:?}",
            node_id, addr, config.data_dir
        );

        config.validate().map_err(anyhow::Error::msg)?;
        config.ensure_dirs()?;

        let log_store = RocksLogStore::new(config.log_dir()).await?;
        let state_machine = RocksStateMachine::new(config.state_machine_dir())
            .await?
            .with_events(events);
        let reader = RocksDbReader::from_state_machine(&state_machine);

        let network_factory = HttpRaftNetworkFactory::new(config.rpc_timeout());
        let raft_config = Arc::new(config.to_openraft_config().validate()?);

        let raft = Raft::new(
            node_id,
            raft_config,
            network_factory,
            log_store,
            state_machine,
        )
        .await?;

        info!("Raft node created successfully: id={}", node_id);

        Ok(Self {
            node_id,
            addr,
            raft,
            reader,
            config,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// Read-only view of the local state machine
    pub fn reader(&self) -> &RocksDbReader {
        &self.reader
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.metrics().state, ServerState::Leader)
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.metrics().current_leader
    }

    /// Raft address of the current leader, if known
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
    }

    /// Initialize the cluster with the given members.
    /// Only the first node of a new cluster calls this.
    pub async fn initialize(&self, members: BTreeMap<NodeId, BasicNode>) -> anyhow::Result<()> {
        info!("Initializing Raft cluster with {} members", members.len());
        self.raft.initialize(members).await?;
        info!("Raft cluster initialized successfully");
        Ok(())
    }

    /// Initialize a one-node cluster and wait until this node leads it.
    /// Restarting an already initialized node only waits for leadership.
    pub async fn bootstrap_single(&self, timeout: Duration) -> anyhow::Result<()> {
        let initialized = self.metrics().membership_config.membership().voter_ids().next().is_some();
        if !initialized {
            let mut members = BTreeMap::new();
            members.insert(self.node_id, BasicNode::new(&self.addr));
            self.initialize(members).await?;
        }

        match self.wait_for_leader(timeout).await {
            Some(leader) if leader == self.node_id => Ok(()),
            Some(leader) => anyhow::bail!("node {} leads instead of {}", leader, self.node_id),
            None => anyhow::bail!("no leader elected within {:?}", timeout),
        }
    }

    pub async fn add_learner(&self, node_id: NodeId, addr: String) -> anyhow::Result<()> {
        info!("Adding learner: id={}, addr={}", node_id, addr);
        self.raft
            .add_learner(node_id, BasicNode { addr }, true)
            .await?;
        info!("Learner added successfully: id={}", node_id);
        Ok(())
    }

    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> anyhow::Result<()> {
        info!("Changing membership to: {:?}", members);
        self.raft.change_membership(members, false).await?;
        info!("Membership changed successfully");
        Ok(())
    }

    /// Append a command and wait until it is applied locally.
    ///
    /// Fails with NotLeader, carrying the leader's address when known, if
    /// this node cannot accept writes.
    pub async fn write(&self, request: RaftRequest) -> Result<RaftResponse, TrellisError> {
        debug!("Writing through Raft: {}", request.op_type());

        match self.raft.client_write(request).await {
            Ok(response) => Ok(response.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => Err(
                TrellisError::not_leader(forward.leader_node.map(|node| node.addr)),
            ),
            Err(e) => {
                warn!("Raft write failed: {}", e);
                Err(TrellisError::internal(format!("raft write failed: {}", e)))
            }
        }
    }

    /// Confirm leadership so that a following local read is linearizable
    pub async fn linearizable_read(&self) -> Result<(), TrellisError> {
        match self.raft.ensure_linearizable().await {
            Ok(_) => Ok(()),
            Err(RaftError::APIError(CheckIsLeaderError::ForwardToLeader(forward))) => Err(
                TrellisError::not_leader(forward.leader_node.map(|node| node.addr)),
            ),
            Err(e) => Err(TrellisError::internal(format!(
                "linearizable read failed: {}",
                e
            ))),
        }
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Shutting down Raft node: id={}", self.node_id);
        self.raft.shutdown().await?;
        info!("Raft node shutdown complete");
        Ok(())
    }

    /// Poll metrics until a leader is known or `timeout` elapses
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let start = Instant::now();

        loop {
            if let Some(leader_id) = self.metrics().current_leader {
                return Some(leader_id);
            }
            if start.elapsed() > timeout {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn last_applied_index(&self) -> Option<u64> {
        self.metrics().last_applied.map(|l| l.index)
    }

    pub fn current_term(&self) -> u64 {
        self.metrics().current_term
    }

    pub fn state(&self) -> ServerState {
        self.metrics().state
    }
}

/// Builder for creating RaftNode instances
pub struct RaftNodeBuilder {
    node_id: Option<NodeId>,
    addr: Option<String>,
    config: RaftConfig,
    events: EventBus,
}

impl RaftNodeBuilder {
    pub fn new() -> Self {
        Self {
            node_id: None,
            addr: None,
            config: RaftConfig::default(),
            events: EventBus::default(),
        }
    }

    pub fn node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    /// Bus receiving applied record and pool events
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub async fn build(self) -> anyhow::Result<RaftNode> {
        let node_id = self
            .node_id
            .ok_or_else(|| anyhow::anyhow!("Node ID is required"))?;
        let addr = self
            .addr
            .ok_or_else(|| anyhow::anyhow!("Address is required"))?;

        RaftNode::new(node_id, addr, self.config, self.events).await
    }
}

impl Default for RaftNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trellis_common::{ErrorKind, ServiceRecord, Topic, UrlInfo};

    async fn single_node(dir: &TempDir, events: EventBus) -> RaftNode {
        let node = RaftNodeBuilder::new()
            .node_id(1)
            .addr("127.0.0.1:39848")
            .config(RaftConfig::standalone(dir.path()))
            .events(events)
            .build()
            .await
            .unwrap();
        node.bootstrap_single(Duration::from_secs(10)).await.unwrap();
        node
    }

    #[test]
    fn test_builder() {
        let builder = RaftNodeBuilder::new()
            .node_id(1)
            .addr("127.0.0.1:9848")
            .config(RaftConfig::default());

        assert!(builder.node_id.is_some());
        assert!(builder.addr.is_some());
    }

    #[tokio::test]
    async fn test_builder_requires_node_id() {
        let err = RaftNodeBuilder::new().addr("x").build().await.err().unwrap();
        assert!(err.to_string().contains("Node ID"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_node_write_is_applied() {
        let dir = TempDir::new().unwrap();
        let events = EventBus::default();
        let mut sub = events.subscribe(Topic::records("example"));
        let node = single_node(&dir, events).await;
        assert!(node.is_leader());
        assert_eq!(node.leader_addr().as_deref(), Some("127.0.0.1:39848"));

        let record = ServiceRecord::new("example", "api", UrlInfo::new("tcp", "10.0.0.1", 7000));
        let response = node
            .write(RaftRequest::RecordPut {
                record: record.clone(),
            })
            .await
            .unwrap();
        assert!(response.success);

        // client_write returns after apply, so the local read sees it
        assert_eq!(node.reader().get_record("example", "api").unwrap(), Some(record));
        assert!(sub.recv().await.is_some());

        let rejected = node
            .write(RaftRequest::TicketRedeem {
                iden: "missing".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rejected.error, Some(ErrorKind::NotFound));

        node.linearizable_read().await.unwrap();
        node.shutdown().await.unwrap();
    }
}
