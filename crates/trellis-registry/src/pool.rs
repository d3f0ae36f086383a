// Pool manager
// Named, ordered groups of service names; a pool only references services

use std::sync::Arc;

use tracing::info;
use trellis_common::{Pool, Result, Subscription, Topic, TrellisError, now_millis, validate_name};
use trellis_consistency::RaftRequest;

use crate::store::{RegistryStore, expect_doc, storage_error};

pub struct PoolManager {
    store: Arc<RegistryStore>,
}

impl PoolManager {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }

    fn not_found(network: &str, name: &str) -> TrellisError {
        TrellisError::not_found(format!("pool '{}' not found in network '{}'", name, network))
            .with_info("pool", name)
    }

    pub async fn create_pool(&self, network: &str, name: &str, creator: &str) -> Result<Pool> {
        validate_name("network", network)?;
        validate_name("pool", name)?;
        let pool = Pool {
            name: name.to_string(),
            network: network.to_string(),
            members: Vec::new(),
            creator: creator.to_string(),
            created: now_millis(),
        };
        let pool: Pool = expect_doc(self.store.submit(RaftRequest::PoolCreate { pool }).await?)?;
        info!(network, pool = name, "Pool created");
        Ok(pool)
    }

    /// Delete a pool; the referenced services are untouched
    pub async fn del_pool(&self, network: &str, name: &str) -> Result<()> {
        self.store
            .submit(RaftRequest::PoolDelete {
                network: network.to_string(),
                name: name.to_string(),
            })
            .await?
            .into_unit()?;
        info!(network, pool = name, "Pool deleted");
        Ok(())
    }

    pub fn get_pool(&self, network: &str, name: &str) -> Result<Pool> {
        self.store
            .reader()
            .get_pool(network, name)
            .map_err(storage_error)?
            .ok_or_else(|| Self::not_found(network, name))
    }

    pub fn list_pools(&self, network: &str) -> Result<Vec<Pool>> {
        validate_name("network", network)?;
        self.store.reader().list_pools(network).map_err(storage_error)
    }

    /// Add a service; it must exist now, later deletion leaves the member
    pub async fn add_member(&self, network: &str, pool: &str, member: &str) -> Result<Pool> {
        validate_name("service", member)?;
        expect_doc(
            self.store
                .submit(RaftRequest::PoolMemberAdd {
                    network: network.to_string(),
                    pool: pool.to_string(),
                    member: member.to_string(),
                })
                .await?,
        )
    }

    pub async fn del_member(&self, network: &str, pool: &str, member: &str) -> Result<Pool> {
        expect_doc(
            self.store
                .submit(RaftRequest::PoolMemberDelete {
                    network: network.to_string(),
                    pool: pool.to_string(),
                    member: member.to_string(),
                })
                .await?,
        )
    }

    /// Members in insertion order
    pub fn list_members(
        &self,
        network: &str,
        pool: &str,
    ) -> Result<std::vec::IntoIter<String>> {
        Ok(self.get_pool(network, pool)?.members.into_iter())
    }

    /// Observe membership events of an existing pool
    pub fn subscribe(&self, network: &str, pool: &str) -> Result<Subscription> {
        self.get_pool(network, pool)?;
        Ok(self.store.events().subscribe(Topic::pool(network, pool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::single_node_store;
    use trellis_common::{ErrorKind, PoolEventKind, RegistryEvent, ServiceRecord, UrlInfo};

    async fn setup() -> (PoolManager, Arc<RegistryStore>, tempfile::TempDir) {
        let (store, dir) = single_node_store().await;
        for name in ["api.0", "api.1"] {
            store
                .put_record(
                    "example",
                    name,
                    ServiceRecord::new("example", name, UrlInfo::new("tcp", "h", 1)),
                )
                .await
                .unwrap();
        }
        (PoolManager::new(store.clone()), store, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_lifecycle() {
        let (pools, store, _dir) = setup().await;
        pools.create_pool("example", "api", "admin").await.unwrap();
        let err = pools.create_pool("example", "api", "admin").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        pools.add_member("example", "api", "api.1").await.unwrap();
        pools.add_member("example", "api", "api.0").await.unwrap();
        pools.add_member("example", "api", "api.1").await.unwrap();
        let members: Vec<String> = pools.list_members("example", "api").unwrap().collect();
        assert_eq!(members, vec!["api.1", "api.0"]);

        let err = pools.add_member("example", "api", "api.9").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        // deleting a service leaves the reference in place
        store.del_record("example", "api.0").await.unwrap();
        assert!(pools.get_pool("example", "api").unwrap().contains("api.0"));

        pools.del_member("example", "api", "api.0").await.unwrap();
        let err = pools.del_member("example", "api", "api.0").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        pools.del_pool("example", "api").await.unwrap();
        assert!(store.get_record("example", "api.1").is_ok());
        assert!(pools.list_pools("example").unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listener_sees_membership_changes() {
        let (pools, _store, _dir) = setup().await;
        pools.create_pool("example", "api", "admin").await.unwrap();
        let mut sub = pools.subscribe("example", "api").unwrap();

        pools.add_member("example", "api", "api.0").await.unwrap();
        pools.del_member("example", "api", "api.0").await.unwrap();
        pools.del_pool("example", "api").await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..3 {
            match sub.recv().await {
                Some(RegistryEvent::Pool(event)) => kinds.push(event.kind),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(
            kinds,
            vec![PoolEventKind::MemberAdd, PoolEventKind::MemberDel, PoolEventKind::PoolDel]
        );
        assert!(pools.subscribe("example", "api").is_err());
    }
}
