//! Trellis Registry - control plane services over the replicated log
//!
//! This crate provides:
//! - [`RegistryStore`]: service records keyed by (network, name)
//! - [`Provisioner`]: one-time provisioning tickets and capability signing
//! - [`RaftCaStorage`]: CA persistence through the log
//! - [`PeerFanout`]: concurrent calls to every peer of a service identity
//! - [`TopologyCoordinator`] and [`LivenessMonitor`]: leader/mirror handover
//!   and online state
//! - [`PoolManager`]: named groups of services

pub mod certs;
pub mod fanout;
pub mod liveness;
pub mod metrics;
pub mod pool;
pub mod provision;
pub mod store;
pub mod topology;

pub use certs::RaftCaStorage;
pub use fanout::{PeerClient, PeerFanout, PeerOp, PeerResult, PeerResults, PeerSource};
pub use liveness::LivenessMonitor;
pub use pool::PoolManager;
pub use provision::{ProvisionConfig, ProvisionUrl, Provisioner, Redemption};
pub use store::RegistryStore;
pub use topology::{PromoteOptions, ReplicaControl, TopologyCoordinator};
pub use trellis_common::api::ClusterState;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;
    use trellis_common::EventBus;
    use trellis_consistency::{RaftConfig, RaftNodeBuilder};

    use crate::store::RegistryStore;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(39900);

    /// Single-node registry on a fresh RocksDB directory
    pub async fn single_node_store() -> (Arc<RegistryStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let events = EventBus::default();
        let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
        let node = RaftNodeBuilder::new()
            .node_id(1)
            .addr(format!("127.0.0.1:{}", port))
            .config(RaftConfig::standalone(dir.path()))
            .events(events.clone())
            .build()
            .await
            .unwrap();
        node.bootstrap_single(Duration::from_secs(10)).await.unwrap();
        (Arc::new(RegistryStore::new(Arc::new(node), events)), dir)
    }

    /// Registry whose node never joined a cluster and so never leads
    pub async fn follower_store() -> (Arc<RegistryStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let events = EventBus::default();
        let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
        let node = RaftNodeBuilder::new()
            .node_id(2)
            .addr(format!("127.0.0.1:{}", port))
            .config(RaftConfig::standalone(dir.path()))
            .events(events.clone())
            .build()
            .await
            .unwrap();
        (Arc::new(RegistryStore::new(Arc::new(node), events)), dir)
    }
}
