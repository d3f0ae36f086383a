//! Leader/mirror promotion
//!
//! A cluster is NORMAL with a leader, or transiently PROMOTING a candidate
//! or DEMOTING its leader. One handover per cluster runs at a time; a
//! concurrent attempt fails Busy.
//!
//! Graceful handover: the candidate catches up to the leader's log offset,
//! the leader is frozen (no new mutations, in-flight ones drained) and
//! reports its final offset, the candidate catches up to that, and only
//! then is the new leader committed to the registry. A leader frozen by a
//! failed handover is thawed again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{info, warn};
use trellis_common::api::ClusterState;
use trellis_common::{Result, ServiceRecord, TrellisError};

use crate::store::RegistryStore;

/// Replica-side operations driven during a handover
#[async_trait]
pub trait ReplicaControl: Send + Sync {
    /// Current log offset of a replica
    async fn log_offset(&self, peer: &ServiceRecord) -> Result<u64>;

    /// Stop accepting mutations and drain in-flight ones; returns the
    /// final log offset
    async fn freeze(&self, peer: &ServiceRecord) -> Result<u64>;

    async fn thaw(&self, peer: &ServiceRecord) -> Result<()>;

    /// Tell a replica which member now leads its cluster
    async fn set_role(&self, peer: &ServiceRecord, leader: &str) -> Result<()>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoteOptions {
    /// Coordinate with the current leader; false skips every leader
    /// interaction
    #[serde(default = "default_graceful")]
    pub graceful: bool,
    #[serde(default = "default_timeout", with = "millis")]
    pub timeout: Duration,
    /// Offset polling interval
    #[serde(default = "default_poll", with = "millis")]
    pub poll: Duration,
}

fn default_graceful() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll() -> Duration {
    Duration::from_millis(100)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl Default for PromoteOptions {
    fn default() -> Self {
        Self {
            graceful: default_graceful(),
            timeout: default_timeout(),
            poll: default_poll(),
        }
    }
}

impl PromoteOptions {
    pub fn forced() -> Self {
        Self {
            graceful: false,
            ..Default::default()
        }
    }
}

type ClusterKey = (String, String);

/// Holds a cluster's transient state; dropping it returns the cluster to
/// NORMAL
struct HandoverGuard {
    ops: Arc<DashMap<ClusterKey, ClusterState>>,
    key: ClusterKey,
}

impl Drop for HandoverGuard {
    fn drop(&mut self) {
        self.ops.remove(&self.key);
    }
}

pub struct TopologyCoordinator {
    store: Arc<RegistryStore>,
    control: Arc<dyn ReplicaControl>,
    ops: Arc<DashMap<ClusterKey, ClusterState>>,
}

impl TopologyCoordinator {
    pub fn new(store: Arc<RegistryStore>, control: Arc<dyn ReplicaControl>) -> Self {
        Self {
            store,
            control,
            ops: Arc::new(DashMap::new()),
        }
    }

    fn begin(&self, network: &str, cluster: &str, state: ClusterState) -> Result<HandoverGuard> {
        let key = (network.to_string(), cluster.to_string());
        match self.ops.entry(key.clone()) {
            Entry::Occupied(current) => Err(TrellisError::busy(format!(
                "cluster '{}' is already changing leader",
                cluster
            ))
            .with_info("cluster", cluster)
            .with_info("state", serde_json::to_value(current.get()).unwrap_or_default())),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(HandoverGuard {
                    ops: self.ops.clone(),
                    key,
                })
            }
        }
    }

    /// Handovers are driven from the registry leader only
    fn ensure_leader(&self) -> Result<()> {
        if self.store.is_leader() {
            return Ok(());
        }
        Err(TrellisError::not_leader(self.store.node().leader_addr()))
    }

    fn cluster_of(record: &ServiceRecord) -> Result<&str> {
        record.cluster.as_deref().ok_or_else(|| {
            TrellisError::bad_argument(format!("service '{}' is not part of a cluster", record.name))
        })
    }

    /// Make `candidate` the leader of its cluster
    pub async fn promote(
        &self,
        network: &str,
        candidate: &str,
        options: &PromoteOptions,
    ) -> Result<ServiceRecord> {
        self.ensure_leader()?;
        let record = self.store.get_record(network, candidate)?;
        let cluster = Self::cluster_of(&record)?.to_string();
        if record.is_leader() {
            return Ok(record);
        }

        let _guard = self.begin(
            network,
            &cluster,
            ClusterState::Promoting {
                candidate: candidate.to_string(),
            },
        )?;
        let leader = self
            .store
            .cluster_members(network, &cluster)?
            .into_iter()
            .find(ServiceRecord::is_leader);

        self.handover(network, &cluster, leader, record, options).await
    }

    /// Hand leadership from `leader` to its most caught-up online mirror
    pub async fn demote(
        &self,
        network: &str,
        leader: &str,
        options: &PromoteOptions,
    ) -> Result<ServiceRecord> {
        self.ensure_leader()?;
        let record = self.store.get_record(network, leader)?;
        let cluster = Self::cluster_of(&record)?.to_string();
        if !record.is_leader() {
            return Err(TrellisError::bad_argument(format!(
                "service '{}' does not lead cluster '{}'",
                leader, cluster
            )));
        }

        let _guard = self.begin(
            network,
            &cluster,
            ClusterState::Demoting {
                leader: leader.to_string(),
            },
        )?;

        let deadline = Instant::now() + options.timeout;
        let mut best: Option<(u64, ServiceRecord)> = None;
        for mirror in self.store.cluster_members(network, &cluster)? {
            if mirror.name == leader || !mirror.is_online() {
                continue;
            }
            let queried = timeout_at(deadline, self.control.log_offset(&mirror)).await;
            match queried {
                Ok(Ok(offset)) if best.as_ref().is_none_or(|(b, _)| offset > *b) => {
                    best = Some((offset, mirror));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(mirror = %mirror.name, error = %e, "Skipping mirror"),
                Err(_) => warn!(mirror = %mirror.name, "Mirror offset query timed out"),
            }
        }

        let (_, candidate) = best.ok_or_else(|| {
            TrellisError::not_ready(format!("cluster '{}' has no online mirror", cluster))
                .with_info("cluster", cluster.clone())
        })?;
        self.handover(network, &cluster, Some(record), candidate, options)
            .await
    }

    async fn handover(
        &self,
        network: &str,
        cluster: &str,
        leader: Option<ServiceRecord>,
        candidate: ServiceRecord,
        options: &PromoteOptions,
    ) -> Result<ServiceRecord> {
        let deadline = Instant::now() + options.timeout;
        let coordinate = options.graceful
            && leader
                .as_ref()
                .is_some_and(|l| l.is_online() && l.name != candidate.name);

        let result = if let (true, Some(leader)) = (coordinate, &leader) {
            self.graceful_commit(network, cluster, leader, &candidate, options, deadline)
                .await
        } else {
            self.store
                .set_cluster_leader(network, cluster, &candidate.name)
                .await
                .map(|_| ())
        };
        crate::metrics::record_promotion(options.graceful, result.is_ok());
        result?;

        info!(
            network,
            cluster,
            leader = %candidate.name,
            previous = ?leader.as_ref().map(|l| &l.name),
            graceful = options.graceful,
            "Cluster leader changed"
        );

        let mut notify = vec![&candidate];
        if let (true, Some(previous)) = (coordinate, &leader) {
            notify.push(previous);
        }
        for peer in notify {
            if let Err(e) = self.control.set_role(peer, &candidate.name).await {
                warn!(peer = %peer.name, error = %e, "Failed to notify new role");
            }
        }

        self.store.get_record(network, &candidate.name)
    }

    async fn graceful_commit(
        &self,
        network: &str,
        cluster: &str,
        leader: &ServiceRecord,
        candidate: &ServiceRecord,
        options: &PromoteOptions,
        deadline: Instant,
    ) -> Result<()> {
        let target = self.bounded(deadline, self.control.log_offset(leader)).await?;
        self.wait_for_offset(candidate, target, options.poll, deadline)
            .await?;

        let final_offset = self.bounded(deadline, self.control.freeze(leader)).await?;
        let committed = async {
            self.wait_for_offset(candidate, final_offset, options.poll, deadline)
                .await?;
            self.store
                .set_cluster_leader(network, cluster, &candidate.name)
                .await
        }
        .await;

        if let Err(e) = committed {
            warn!(leader = %leader.name, error = %e, "Handover failed after freeze, thawing leader");
            if let Err(thaw) = self.control.thaw(leader).await {
                warn!(leader = %leader.name, error = %thaw, "Failed to thaw leader");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        deadline: Instant,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        timeout_at(deadline, fut)
            .await
            .map_err(|_| TrellisError::timeout("handover deadline exceeded"))?
    }

    async fn wait_for_offset(
        &self,
        candidate: &ServiceRecord,
        target: u64,
        poll: Duration,
        deadline: Instant,
    ) -> Result<()> {
        loop {
            let offset = self.bounded(deadline, self.control.log_offset(candidate)).await?;
            if offset >= target {
                return Ok(());
            }
            if Instant::now() + poll > deadline {
                return Err(TrellisError::timeout(format!(
                    "'{}' reached offset {} of {}",
                    candidate.name, offset, target
                ))
                .with_info("offset", offset)
                .with_info("target", target));
            }
            sleep(poll).await;
        }
    }

    pub fn cluster_state(&self, network: &str, cluster: &str) -> Result<ClusterState> {
        if let Some(state) = self.ops.get(&(network.to_string(), cluster.to_string())) {
            return Ok(state.clone());
        }
        let members = self.store.cluster_members(network, cluster)?;
        if members.is_empty() {
            return Err(TrellisError::not_found(format!(
                "cluster '{}' not found in network '{}'",
                cluster, network
            )));
        }
        Ok(ClusterState::Normal {
            leader: members.into_iter().find(ServiceRecord::is_leader).map(|r| r.name),
        })
    }
}
