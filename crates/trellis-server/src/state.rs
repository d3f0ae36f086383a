//! Shared application state handed to every handler

use std::sync::Arc;

use tracing::info;
use trellis_common::EventBus;
use trellis_consistency::{RaftNode, RaftNodeBuilder};
use trellis_pki::CertAuthority;
use trellis_registry::{
    LivenessMonitor, PeerFanout, PeerSource, PoolManager, Provisioner, RaftCaStorage,
    RegistryStore, TopologyCoordinator,
};

use crate::middleware::JwtAuthenticator;
use crate::model::Configuration;
use crate::peer::HttpPeerClient;

pub struct AppState {
    pub configuration: Configuration,
    pub node: Arc<RaftNode>,
    pub store: Arc<RegistryStore>,
    pub provisioner: Arc<Provisioner>,
    pub topology: Arc<TopologyCoordinator>,
    pub liveness: Arc<LivenessMonitor>,
    pub pools: Arc<PoolManager>,
    pub fanout: Arc<PeerFanout>,
    /// `None` when auth is disabled
    pub authenticator: Option<Arc<JwtAuthenticator>>,
}

impl AppState {
    /// Open the raft node and assemble every service on top of it
    pub async fn build(configuration: Configuration) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let node = RaftNodeBuilder::new()
            .node_id(configuration.node_id())
            .addr(configuration.node_addr())
            .config(configuration.raft_config())
            .events(events.clone())
            .build()
            .await?;
        info!(
            node_id = node.node_id(),
            addr = node.addr(),
            "Raft node opened"
        );
        Self::assemble(configuration, Arc::new(node), events)
    }

    /// Wire the services over an opened node
    pub fn assemble(
        configuration: Configuration,
        node: Arc<RaftNode>,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(RegistryStore::new(node.clone(), events));

        let ca = Arc::new(CertAuthority::new(
            Arc::new(RaftCaStorage::new(store.clone())),
            configuration.cert_policy(),
        ));
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            ca,
            configuration.provision_config(),
        ));

        let peers = Arc::new(HttpPeerClient::new(configuration.peer_timeout())?);
        let fanout = Arc::new(PeerFanout::new(
            store.clone() as Arc<dyn PeerSource>,
            peers.clone(),
        ));
        let topology = Arc::new(TopologyCoordinator::new(store.clone(), peers));
        let liveness = Arc::new(LivenessMonitor::new(
            store.clone(),
            configuration.heartbeat_ttl(),
            configuration.heartbeat_scan_interval(),
        ));
        let pools = Arc::new(PoolManager::new(store.clone()));

        let authenticator = if configuration.auth_enabled() {
            Some(Arc::new(JwtAuthenticator::new(
                &configuration.jwt_secret(),
                configuration.token_ttl_seconds(),
            )?))
        } else {
            tracing::warn!("Authentication is disabled; every caller is treated as admin");
            None
        };

        Ok(Self {
            configuration,
            node,
            store,
            provisioner,
            topology,
            liveness,
            pools,
            fanout,
            authenticator,
        })
    }

    /// Network assumed by requests that do not name one
    pub fn network_or_default(&self, network: Option<&str>) -> String {
        network
            .map(str::to_string)
            .unwrap_or_else(|| self.configuration.default_network())
    }
}
