//! Registry store
//!
//! Service records keyed by (network, name). Reads come from the local
//! state machine; every mutation is validated here and then appended to the
//! replicated log, so the log never carries an invalid transition. Nodes
//! that do not lead the log refuse mutations with `NotLeader`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info};
use trellis_common::{
    EventBus, Result, ServiceRecord, Subscription, Topic, TrellisError, UrlInfo, now_millis,
    validate_name,
};
use trellis_consistency::{RaftNode, RaftRequest, RaftResponse, RecordCursor, RocksDbReader};

use crate::fanout::PeerSource;

pub(crate) fn storage_error(e: anyhow::Error) -> TrellisError {
    TrellisError::storage(e.to_string())
}

pub(crate) fn not_found(network: &str, name: &str) -> TrellisError {
    TrellisError::not_found(format!(
        "service '{}' not found in network '{}'",
        name, network
    ))
    .with_info("network", network)
    .with_info("name", name)
}

/// Decode the document carried by a successful response
pub(crate) fn expect_doc<T: DeserializeOwned>(response: RaftResponse) -> Result<T> {
    response
        .into_result()?
        .ok_or_else(|| TrellisError::internal("command response carried no document"))
}

pub struct RegistryStore {
    node: Arc<RaftNode>,
    events: EventBus,
}

impl RegistryStore {
    pub fn new(node: Arc<RaftNode>, events: EventBus) -> Self {
        Self { node, events }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    pub fn reader(&self) -> &RocksDbReader {
        self.node.reader()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    /// Append a command to the log; fails closed on non-leaders
    pub(crate) async fn submit(&self, request: RaftRequest) -> Result<RaftResponse> {
        if !self.node.is_leader() {
            return Err(TrellisError::not_leader(self.node.leader_addr()));
        }
        crate::metrics::record_registry_write(request.op_type());
        self.node.write(request).await
    }

    fn validate_record(network: &str, name: &str, record: &ServiceRecord) -> Result<()> {
        validate_name("network", network)?;
        validate_name("service", name)?;
        if record.network != network || record.name != name {
            return Err(TrellisError::bad_argument(format!(
                "record identifies '{}/{}' but was stored as '{}/{}'",
                record.network, record.name, network, name
            )));
        }
        if let Some(cluster) = &record.cluster {
            validate_name("cluster", cluster)?;
        }
        if let Some(leader) = &record.leader {
            validate_name("leader", leader)?;
        }
        if record.urlinfo.host.is_empty() || record.urlinfo.scheme.is_empty() {
            return Err(TrellisError::bad_argument(format!(
                "service '{}' has an incomplete url",
                name
            )));
        }
        Ok(())
    }

    // ==================== Records ====================

    /// Create or replace a record
    pub async fn put_record(
        &self,
        network: &str,
        name: &str,
        mut record: ServiceRecord,
    ) -> Result<ServiceRecord> {
        Self::validate_record(network, name, &record)?;
        if record.created == 0 {
            record.created = now_millis();
        }
        let stored: ServiceRecord = expect_doc(self.submit(RaftRequest::RecordPut { record }).await?)?;
        info!(network, name, url = %stored.urlinfo, "Service record stored");
        Ok(stored)
    }

    /// Register reachability for a service, keeping the liveness and
    /// topology fields of an existing record. A service joining a cluster
    /// inherits the cluster's current leader.
    pub async fn register(
        &self,
        network: &str,
        name: &str,
        urlinfo: UrlInfo,
        cluster: Option<String>,
        creator: &str,
    ) -> Result<ServiceRecord> {
        let record = match self.find_record(network, name)? {
            Some(mut existing) => {
                existing.urlinfo = urlinfo;
                if cluster.is_some() && cluster != existing.cluster {
                    existing.leader = self.current_leader(network, cluster.as_deref())?;
                    existing.cluster = cluster;
                }
                existing
            }
            None => {
                let mut record = ServiceRecord::new(network, name, urlinfo);
                record.leader = self.current_leader(network, cluster.as_deref())?;
                record.cluster = cluster;
                record.creator = creator.to_string();
                record
            }
        };
        self.put_record(network, name, record).await
    }

    fn current_leader(&self, network: &str, cluster: Option<&str>) -> Result<Option<String>> {
        let Some(cluster) = cluster else {
            return Ok(None);
        };
        let members = self
            .reader()
            .cluster_members(network, cluster)
            .map_err(storage_error)?;
        Ok(members.into_iter().find_map(|m| m.leader))
    }

    /// Local point lookup
    pub fn find_record(&self, network: &str, name: &str) -> Result<Option<ServiceRecord>> {
        self.reader()
            .get_record(network, name)
            .map_err(storage_error)
    }

    pub fn get_record(&self, network: &str, name: &str) -> Result<ServiceRecord> {
        self.find_record(network, name)?
            .ok_or_else(|| not_found(network, name))
    }

    /// Resolve `name` to the authoritative record.
    ///
    /// An exact record wins unless that record's cluster is named `name`
    /// itself, in which case `name` is an alias and the cluster's leader is
    /// returned. The pointer is followed on every call.
    pub fn resolve_record(&self, network: &str, name: &str) -> Result<ServiceRecord> {
        let exact = self.find_record(network, name)?;
        if let Some(record) = &exact
            && record.cluster.as_deref() != Some(name)
        {
            return Ok(record.clone());
        }

        let members = self
            .reader()
            .cluster_members(network, name)
            .map_err(storage_error)?;
        if members.is_empty() {
            return exact.ok_or_else(|| not_found(network, name));
        }
        members
            .into_iter()
            .find(ServiceRecord::is_leader)
            .ok_or_else(|| {
                TrellisError::not_ready(format!(
                    "cluster '{}' in network '{}' has no leader",
                    name, network
                ))
                .with_info("cluster", name)
            })
    }

    /// Lazy cursor over the records of one network, or all networks
    pub fn list_records(&self, network: Option<&str>) -> Result<RecordCursor> {
        if let Some(network) = network {
            validate_name("network", network)?;
        }
        Ok(self.reader().list_records(network))
    }

    pub async fn del_record(&self, network: &str, name: &str) -> Result<()> {
        validate_name("network", network)?;
        validate_name("service", name)?;
        self.submit(RaftRequest::RecordDelete {
            network: network.to_string(),
            name: name.to_string(),
        })
        .await?
        .into_unit()?;
        info!(network, name, "Service record deleted");
        Ok(())
    }

    // ==================== Liveness ====================

    pub async fn set_online(
        &self,
        network: &str,
        name: &str,
        instance: &str,
        ready: Option<bool>,
    ) -> Result<ServiceRecord> {
        if instance.is_empty() {
            return Err(TrellisError::bad_argument("instance id is empty"));
        }
        expect_doc(
            self.submit(RaftRequest::RecordOnline {
                network: network.to_string(),
                name: name.to_string(),
                instance: instance.to_string(),
                ready,
            })
            .await?,
        )
    }

    /// Clear `online`; with an instance, only when that instance is the
    /// one currently online
    pub async fn set_down(
        &self,
        network: &str,
        name: &str,
        instance: Option<&str>,
    ) -> Result<ServiceRecord> {
        debug!(network, name, ?instance, "Marking service down");
        expect_doc(
            self.submit(RaftRequest::RecordDown {
                network: network.to_string(),
                name: name.to_string(),
                instance: instance.map(str::to_string),
            })
            .await?,
        )
    }

    pub async fn set_ready(&self, network: &str, name: &str, ready: bool) -> Result<ServiceRecord> {
        expect_doc(
            self.submit(RaftRequest::RecordReady {
                network: network.to_string(),
                name: name.to_string(),
                ready,
            })
            .await?,
        )
    }

    /// Point every member of `cluster` at `leader`; returns how many
    /// records changed
    pub async fn set_cluster_leader(
        &self,
        network: &str,
        cluster: &str,
        leader: &str,
    ) -> Result<usize> {
        validate_name("cluster", cluster)?;
        validate_name("leader", leader)?;
        expect_doc(
            self.submit(RaftRequest::ClusterLeader {
                network: network.to_string(),
                cluster: cluster.to_string(),
                leader: leader.to_string(),
            })
            .await?,
        )
    }

    pub fn cluster_members(&self, network: &str, cluster: &str) -> Result<Vec<ServiceRecord>> {
        self.reader()
            .cluster_members(network, cluster)
            .map_err(storage_error)
    }

    /// Subscribe to record events of one network
    pub fn subscribe(&self, network: &str) -> Subscription {
        self.events.subscribe(Topic::records(network))
    }
}

impl PeerSource for RegistryStore {
    /// Peers of `identity`: the members of the cluster it names or belongs
    /// to, or the record alone when it has no cluster
    fn peers(&self, network: &str, identity: &str) -> Result<Vec<ServiceRecord>> {
        let members = self.cluster_members(network, identity)?;
        if !members.is_empty() {
            return Ok(members);
        }
        let record = self.get_record(network, identity)?;
        match &record.cluster {
            Some(cluster) => self.cluster_members(network, cluster),
            None => Ok(vec![record]),
        }
    }
}
