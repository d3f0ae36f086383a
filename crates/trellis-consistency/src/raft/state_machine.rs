// Raft state machine implementation
// Applies committed registry commands to RocksDB and publishes the resulting events

#![allow(clippy::type_complexity)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta, StorageError,
    StoredMembership,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use trellis_common::{
    CaRecord, CertKind, CertRecord, EventBus, KEY_SEPARATOR, Pool, PoolEvent, PoolEventKind,
    RecordEvent, RecordEventKind, RegistryEvent, RevokedCert, ServiceRecord, Ticket, TicketKind,
    TrellisError,
};

use super::request::{RaftRequest, RaftResponse};
use super::types::{NodeId, TypeConfig};

fn sm_error(e: impl std::fmt::Display, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

// Column family names for state machine
pub const CF_RECORDS: &str = "records";
pub const CF_TICKETS: &str = "tickets";
pub const CF_CAS: &str = "cas";
pub const CF_CERTS: &str = "certs";
pub const CF_REVOCATIONS: &str = "revocations";
pub const CF_POOLS: &str = "pools";
const CF_META: &str = "meta";

/// Column families holding registry data, in snapshot order
pub const DATA_CFS: [&str; 6] = [
    CF_RECORDS,
    CF_TICKETS,
    CF_CAS,
    CF_CERTS,
    CF_REVOCATIONS,
    CF_POOLS,
];

// Meta keys
const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_LAST_MEMBERSHIP: &[u8] = b"last_membership";

type ApplyResult = Result<RaftResponse, TrellisError>;

/// RocksDB-based state machine for the registry
pub struct RocksStateMachine {
    db: Arc<DB>,
    last_applied: RwLock<Option<LogId<NodeId>>>,
    last_membership: RwLock<StoredMembership<NodeId, openraft::BasicNode>>,
    /// Receives record and pool events after each applied command
    events: Option<EventBus>,
}

impl RocksStateMachine {
    /// Get a reference to the underlying RocksDB instance
    pub fn db(&self) -> Arc<DB> {
        self.db.clone()
    }

    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError<NodeId>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs: Vec<_> = DATA_CFS
            .iter()
            .chain(std::iter::once(&CF_META))
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?;

        let sm = Self {
            db: Arc::new(db),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            events: None,
        };

        sm.load_cached_values().await?;

        info!("RocksDB state machine initialized");
        Ok(sm)
    }

    /// Publish applied changes to `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    async fn load_cached_values(&self) -> Result<(), StorageError<NodeId>> {
        if let Some(bytes) = self
            .db
            .get_cf(self.cf(CF_META), KEY_LAST_APPLIED)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        {
            let log_id: LogId<NodeId> =
                serde_json::from_slice(&bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
            *self.last_applied.write().await = Some(log_id);
        }

        if let Some(bytes) = self
            .db
            .get_cf(self.cf(CF_META), KEY_LAST_MEMBERSHIP)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        {
            let membership: StoredMembership<NodeId, openraft::BasicNode> =
                serde_json::from_slice(&bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
            *self.last_membership.write().await = membership;
        }

        Ok(())
    }

    /// Column families are created at open; a missing one means a corrupted database
    fn cf(&self, name: &str) -> &ColumnFamily {
        self.db
            .cf_handle(name)
            .unwrap_or_else(|| panic!("column family '{}' must exist", name))
    }

    // ==================== Keys ====================

    pub fn record_key(network: &str, name: &str) -> String {
        format!("{}{}{}", network, KEY_SEPARATOR, name)
    }

    pub fn ticket_key(iden: &str) -> String {
        iden.to_string()
    }

    pub fn ca_key(network: &str) -> String {
        network.to_string()
    }

    pub fn cert_key(network: &str, kind: CertKind, subject: &str) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            network,
            kind.as_str(),
            subject,
            sep = KEY_SEPARATOR
        )
    }

    pub fn revocation_key(network: &str, fingerprint: &str) -> String {
        format!("{}{}{}", network, KEY_SEPARATOR, fingerprint)
    }

    pub fn pool_key(network: &str, name: &str) -> String {
        format!("{}{}{}", network, KEY_SEPARATOR, name)
    }

    /// Prefix shared by every key scoped to a network
    pub fn network_prefix(network: &str) -> String {
        format!("{}{}", network, KEY_SEPARATOR)
    }

    // ==================== Document helpers ====================

    fn get_doc<T: DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>, TrellisError> {
        let bytes = self
            .db
            .get_cf(self.cf(cf), key.as_bytes())
            .map_err(|e| TrellisError::storage(format!("read {}/{}: {}", cf, key, e)))?;
        bytes
            .map(|b| serde_json::from_slice(&b))
            .transpose()
            .map_err(|e| TrellisError::storage(format!("decode {}/{}: {}", cf, key, e)))
    }

    fn put_doc<T: Serialize>(&self, cf: &str, key: &str, value: &T) -> Result<(), TrellisError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| TrellisError::storage(format!("encode {}/{}: {}", cf, key, e)))?;
        self.db
            .put_cf(self.cf(cf), key.as_bytes(), bytes)
            .map_err(|e| TrellisError::storage(format!("write {}/{}: {}", cf, key, e)))
    }

    fn delete_doc(&self, cf: &str, key: &str) -> Result<(), TrellisError> {
        self.db
            .delete_cf(self.cf(cf), key.as_bytes())
            .map_err(|e| TrellisError::storage(format!("delete {}/{}: {}", cf, key, e)))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), TrellisError> {
        self.db
            .write(batch)
            .map_err(|e| TrellisError::storage(format!("write batch: {}", e)))
    }

    /// Decode every document under `prefix` in a column family
    fn scan_docs<T: DeserializeOwned>(
        &self,
        cf: &str,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, TrellisError> {
        let mut docs = Vec::new();
        let iter = self.db.prefix_iterator_cf(self.cf(cf), prefix.as_bytes());
        for item in iter {
            let (key, value) =
                item.map_err(|e| TrellisError::storage(format!("scan {}: {}", cf, e)))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if !key.starts_with(prefix) {
                break;
            }
            let doc = serde_json::from_slice(&value)
                .map_err(|e| TrellisError::storage(format!("decode {}/{}: {}", cf, key, e)))?;
            docs.push((key, doc));
        }
        Ok(docs)
    }

    fn record_not_found(network: &str, name: &str) -> TrellisError {
        TrellisError::not_found(format!(
            "service '{}' not found in network '{}'",
            name, network
        ))
        .with_info("network", network)
        .with_info("name", name)
    }

    fn pool_not_found(network: &str, name: &str) -> TrellisError {
        TrellisError::not_found(format!("pool '{}' not found in network '{}'", name, network))
            .with_info("network", network)
            .with_info("pool", name)
    }

    fn record_event(kind: RecordEventKind, record: &ServiceRecord) -> RegistryEvent {
        RegistryEvent::Record(RecordEvent {
            kind,
            network: record.network.clone(),
            name: record.name.clone(),
            record: Some(record.clone()),
        })
    }

    fn pool_event(
        kind: PoolEventKind,
        network: &str,
        pool: &str,
        member: Option<&str>,
    ) -> RegistryEvent {
        RegistryEvent::Pool(PoolEvent {
            kind,
            network: network.to_string(),
            pool: pool.to_string(),
            member: member.map(str::to_string),
        })
    }

    // ==================== Apply ====================

    fn apply_request(&self, request: RaftRequest, events: &mut Vec<RegistryEvent>) -> RaftResponse {
        let op = request.op_type();
        let result = match request {
            RaftRequest::RecordPut { record } => self.apply_record_put(record, events),
            RaftRequest::RecordDelete { network, name } => {
                self.apply_record_delete(&network, &name, events)
            }
            RaftRequest::RecordOnline {
                network,
                name,
                instance,
                ready,
            } => self.apply_record_online(&network, &name, instance, ready, events),
            RaftRequest::RecordDown {
                network,
                name,
                instance,
            } => self.apply_record_down(&network, &name, instance.as_deref(), events),
            RaftRequest::RecordReady {
                network,
                name,
                ready,
            } => self.apply_record_ready(&network, &name, ready, events),
            RaftRequest::ClusterLeader {
                network,
                cluster,
                leader,
            } => self.apply_cluster_leader(&network, &cluster, &leader, events),
            RaftRequest::TicketIssue { ticket } => self.apply_ticket_issue(ticket),
            RaftRequest::TicketRedeem { iden } => self.apply_ticket_take(&iden),
            RaftRequest::TicketRevoke { iden } => self.apply_ticket_take(&iden),
            RaftRequest::TicketClear { kind } => self.apply_ticket_clear(kind),
            RaftRequest::CaPut { ca } => self.apply_ca_put(ca),
            RaftRequest::CertIssue { cert } => self.apply_cert_issue(cert),
            RaftRequest::CertRevoke { revoked } => self.apply_cert_revoke(revoked),
            RaftRequest::PoolCreate { pool } => self.apply_pool_create(pool),
            RaftRequest::PoolDelete { network, name } => {
                self.apply_pool_delete(&network, &name, events)
            }
            RaftRequest::PoolMemberAdd {
                network,
                pool,
                member,
            } => self.apply_pool_member_add(&network, &pool, &member, events),
            RaftRequest::PoolMemberDelete {
                network,
                pool,
                member,
            } => self.apply_pool_member_delete(&network, &pool, &member, events),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                debug!(op, error = %e, "Command rejected by state machine");
                RaftResponse::failure(e.kind, e.message)
            }
        }
    }

    fn apply_record_put(
        &self,
        record: ServiceRecord,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        let key = Self::record_key(&record.network, &record.name);
        self.put_doc(CF_RECORDS, &key, &record)?;
        debug!("Record stored: {}", key);
        events.push(Self::record_event(RecordEventKind::Add, &record));
        Ok(RaftResponse::success_with(&record))
    }

    fn apply_record_delete(
        &self,
        network: &str,
        name: &str,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        let key = Self::record_key(network, name);
        let record: ServiceRecord = self
            .get_doc(CF_RECORDS, &key)?
            .ok_or_else(|| Self::record_not_found(network, name))?;
        self.delete_doc(CF_RECORDS, &key)?;
        debug!("Record deleted: {}", key);
        events.push(RegistryEvent::Record(RecordEvent {
            kind: RecordEventKind::Del,
            network: record.network,
            name: record.name,
            record: None,
        }));
        Ok(RaftResponse::success())
    }

    /// Load, mutate and store a record; the event is only emitted when the
    /// closure reports a change.
    fn update_record(
        &self,
        network: &str,
        name: &str,
        kind: RecordEventKind,
        events: &mut Vec<RegistryEvent>,
        mutate: impl FnOnce(&mut ServiceRecord) -> bool,
    ) -> ApplyResult {
        let key = Self::record_key(network, name);
        let mut record: ServiceRecord = self
            .get_doc(CF_RECORDS, &key)?
            .ok_or_else(|| Self::record_not_found(network, name))?;
        if mutate(&mut record) {
            self.put_doc(CF_RECORDS, &key, &record)?;
            events.push(Self::record_event(kind, &record));
        }
        Ok(RaftResponse::success_with(&record))
    }

    fn apply_record_online(
        &self,
        network: &str,
        name: &str,
        instance: String,
        ready: Option<bool>,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        self.update_record(network, name, RecordEventKind::Add, events, |record| {
            let ready = ready.unwrap_or(record.ready);
            let changed = record.online.as_deref() != Some(instance.as_str()) || record.ready != ready;
            record.online = Some(instance);
            record.ready = ready;
            changed
        })
    }

    fn apply_record_down(
        &self,
        network: &str,
        name: &str,
        instance: Option<&str>,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        self.update_record(network, name, RecordEventKind::Down, events, |record| {
            let matches = match (instance, record.online.as_deref()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(wanted), Some(current)) => wanted == current,
            };
            if matches {
                record.online = None;
            }
            matches
        })
    }

    fn apply_record_ready(
        &self,
        network: &str,
        name: &str,
        ready: bool,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        self.update_record(network, name, RecordEventKind::Add, events, |record| {
            let changed = record.ready != ready;
            record.ready = ready;
            changed
        })
    }

    fn apply_cluster_leader(
        &self,
        network: &str,
        cluster: &str,
        leader: &str,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        let members: Vec<(String, ServiceRecord)> = self
            .scan_docs::<ServiceRecord>(CF_RECORDS, &Self::network_prefix(network))?
            .into_iter()
            .filter(|(_, r)| r.cluster.as_deref() == Some(cluster))
            .collect();

        if !members.iter().any(|(_, r)| r.name == leader) {
            return Err(TrellisError::not_found(format!(
                "service '{}' is not a member of cluster '{}'",
                leader, cluster
            ))
            .with_info("cluster", cluster));
        }

        let mut batch = WriteBatch::default();
        let mut changed = Vec::new();
        for (key, mut record) in members {
            if record.leader.as_deref() == Some(leader) {
                continue;
            }
            record.leader = Some(leader.to_string());
            let bytes = serde_json::to_vec(&record)
                .map_err(|e| TrellisError::storage(format!("encode record: {}", e)))?;
            batch.put_cf(self.cf(CF_RECORDS), key.as_bytes(), bytes);
            changed.push(record);
        }
        self.write_batch(batch)?;

        info!(
            network,
            cluster,
            leader,
            updated = changed.len(),
            "Cluster leader updated"
        );
        events.extend(
            changed
                .iter()
                .map(|r| Self::record_event(RecordEventKind::Add, r)),
        );
        Ok(RaftResponse::success_with(&changed.len()))
    }

    fn apply_ticket_issue(&self, ticket: Ticket) -> ApplyResult {
        let key = Self::ticket_key(&ticket.iden);
        if self.get_doc::<Ticket>(CF_TICKETS, &key)?.is_some() {
            return Err(TrellisError::already_exists(format!(
                "ticket '{}' already exists",
                ticket.iden
            )));
        }
        self.put_doc(CF_TICKETS, &key, &ticket)?;
        Ok(RaftResponse::success())
    }

    /// Remove a ticket and return it; both redemption and revocation end here
    fn apply_ticket_take(&self, iden: &str) -> ApplyResult {
        let key = Self::ticket_key(iden);
        let ticket: Ticket = self
            .get_doc(CF_TICKETS, &key)?
            .ok_or_else(|| TrellisError::not_found(format!("ticket '{}' not found", iden)))?;
        self.delete_doc(CF_TICKETS, &key)?;
        Ok(RaftResponse::success_with(&ticket))
    }

    fn apply_ticket_clear(&self, kind: Option<TicketKind>) -> ApplyResult {
        let tickets = self.scan_docs::<Ticket>(CF_TICKETS, "")?;
        let mut batch = WriteBatch::default();
        let mut cleared = 0usize;
        for (key, ticket) in tickets {
            if kind.is_none_or(|k| k == ticket.kind) {
                batch.delete_cf(self.cf(CF_TICKETS), key.as_bytes());
                cleared += 1;
            }
        }
        self.write_batch(batch)?;
        Ok(RaftResponse::success_with(&cleared))
    }

    fn apply_ca_put(&self, ca: CaRecord) -> ApplyResult {
        let key = Self::ca_key(&ca.network);
        if let Some(existing) = self.get_doc::<CaRecord>(CF_CAS, &key)? {
            debug!("CA for network '{}' already exists, keeping first", ca.network);
            return Ok(RaftResponse::success_with(&existing));
        }
        self.put_doc(CF_CAS, &key, &ca)?;
        info!(network = %ca.network, "Network CA stored");
        Ok(RaftResponse::success_with(&ca))
    }

    fn apply_cert_issue(&self, cert: CertRecord) -> ApplyResult {
        let key = Self::cert_key(&cert.network, cert.kind, &cert.subject);
        if let Some(existing) = self.get_doc::<CertRecord>(CF_CERTS, &key)? {
            let revoked_key = Self::revocation_key(&existing.network, &existing.fingerprint);
            if self.get_doc::<RevokedCert>(CF_REVOCATIONS, &revoked_key)?.is_none() {
                return Err(TrellisError::already_exists(format!(
                    "{} certificate for '{}' already issued in network '{}'",
                    cert.kind, cert.subject, cert.network
                ))
                .with_info("fingerprint", existing.fingerprint));
            }
        }
        self.put_doc(CF_CERTS, &key, &cert)?;
        Ok(RaftResponse::success_with(&cert))
    }

    fn apply_cert_revoke(&self, revoked: RevokedCert) -> ApplyResult {
        let key = Self::revocation_key(&revoked.network, &revoked.fingerprint);
        if let Some(existing) = self.get_doc::<RevokedCert>(CF_REVOCATIONS, &key)? {
            return Ok(RaftResponse::success_with(&existing));
        }
        self.put_doc(CF_REVOCATIONS, &key, &revoked)?;
        info!(network = %revoked.network, subject = %revoked.subject, "Certificate revoked");
        Ok(RaftResponse::success_with(&revoked))
    }

    fn apply_pool_create(&self, pool: Pool) -> ApplyResult {
        let key = Self::pool_key(&pool.network, &pool.name);
        if self.get_doc::<Pool>(CF_POOLS, &key)?.is_some() {
            return Err(TrellisError::already_exists(format!(
                "pool '{}' already exists in network '{}'",
                pool.name, pool.network
            )));
        }
        self.put_doc(CF_POOLS, &key, &pool)?;
        Ok(RaftResponse::success_with(&pool))
    }

    fn apply_pool_delete(
        &self,
        network: &str,
        name: &str,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        let key = Self::pool_key(network, name);
        if self.get_doc::<Pool>(CF_POOLS, &key)?.is_none() {
            return Err(Self::pool_not_found(network, name));
        }
        self.delete_doc(CF_POOLS, &key)?;
        events.push(Self::pool_event(PoolEventKind::PoolDel, network, name, None));
        Ok(RaftResponse::success())
    }

    fn apply_pool_member_add(
        &self,
        network: &str,
        name: &str,
        member: &str,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        let key = Self::pool_key(network, name);
        let mut pool: Pool = self
            .get_doc(CF_POOLS, &key)?
            .ok_or_else(|| Self::pool_not_found(network, name))?;
        if self
            .get_doc::<ServiceRecord>(CF_RECORDS, &Self::record_key(network, member))?
            .is_none()
        {
            return Err(Self::record_not_found(network, member));
        }
        if !pool.contains(member) {
            pool.members.push(member.to_string());
            self.put_doc(CF_POOLS, &key, &pool)?;
            events.push(Self::pool_event(
                PoolEventKind::MemberAdd,
                network,
                name,
                Some(member),
            ));
        }
        Ok(RaftResponse::success_with(&pool))
    }

    fn apply_pool_member_delete(
        &self,
        network: &str,
        name: &str,
        member: &str,
        events: &mut Vec<RegistryEvent>,
    ) -> ApplyResult {
        let key = Self::pool_key(network, name);
        let mut pool: Pool = self
            .get_doc(CF_POOLS, &key)?
            .ok_or_else(|| Self::pool_not_found(network, name))?;
        if !pool.contains(member) {
            return Err(TrellisError::not_found(format!(
                "'{}' is not a member of pool '{}'",
                member, name
            )));
        }
        pool.members.retain(|m| m != member);
        self.put_doc(CF_POOLS, &key, &pool)?;
        events.push(Self::pool_event(
            PoolEventKind::MemberDel,
            network,
            name,
            Some(member),
        ));
        Ok(RaftResponse::success_with(&pool))
    }

    fn publish(&self, events: Vec<RegistryEvent>) {
        if let Some(bus) = &self.events {
            for event in events {
                bus.publish(event);
            }
        }
    }

    // ==================== Metadata ====================

    async fn save_last_applied(&self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(&log_id).map_err(|e| sm_error(e, ErrorVerb::Write))?;

        self.db
            .put_cf(self.cf(CF_META), KEY_LAST_APPLIED, bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        *self.last_applied.write().await = Some(log_id);
        Ok(())
    }

    async fn save_membership(
        &self,
        membership: StoredMembership<NodeId, openraft::BasicNode>,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(&membership).map_err(|e| sm_error(e, ErrorVerb::Write))?;

        self.db
            .put_cf(self.cf(CF_META), KEY_LAST_MEMBERSHIP, bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        *self.last_membership.write().await = membership;
        Ok(())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RocksStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let last_applied = *self.last_applied.read().await;
        let last_membership = self.last_membership.read().await.clone();

        let snapshot_id = format!(
            "snapshot-{}-{}",
            last_applied.map(|l| l.index).unwrap_or(0),
            chrono::Utc::now().timestamp_millis()
        );

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: snapshot_id.clone(),
        };

        let mut snapshot_data: HashMap<String, Vec<(Vec<u8>, Vec<u8>)>> = HashMap::new();
        for cf_name in DATA_CFS {
            let mut cf_data = Vec::new();
            let iter = self
                .db
                .iterator_cf(self.cf(cf_name), rocksdb::IteratorMode::Start);
            for item in iter {
                let (key, value) = item.map_err(|e| sm_error(e, ErrorVerb::Read))?;
                cf_data.push((key.to_vec(), value.to_vec()));
            }
            snapshot_data.insert(cf_name.to_string(), cf_data);
        }

        let data = serde_json::to_vec(&snapshot_data).map_err(|e| sm_error(e, ErrorVerb::Write))?;

        info!("Built snapshot {} with {} bytes", snapshot_id, data.len());

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for RocksStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<NodeId>>,
            StoredMembership<NodeId, openraft::BasicNode>,
        ),
        StorageError<NodeId>,
    > {
        let last_applied = *self.last_applied.read().await;
        let last_membership = self.last_membership.read().await.clone();
        Ok((last_applied, last_membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<RaftResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            let mut events = Vec::new();

            let response = match entry.payload {
                EntryPayload::Normal(request) => self.apply_request(request, &mut events),
                EntryPayload::Membership(membership) => {
                    let stored = StoredMembership::new(Some(log_id), membership);
                    self.save_membership(stored).await?;
                    RaftResponse::success()
                }
                EntryPayload::Blank => RaftResponse::success(),
            };

            self.save_last_applied(log_id).await?;
            self.publish(events);
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        // Snapshots are rebuilt from the live column families on demand
        if self.last_applied.read().await.is_none() {
            return Ok(None);
        }
        self.build_snapshot().await.map(Some)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        RocksStateMachine {
            db: self.db.clone(),
            last_applied: RwLock::new(*self.last_applied.read().await),
            last_membership: RwLock::new(self.last_membership.read().await.clone()),
            events: None,
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, openraft::BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();

        if !data.is_empty() {
            let snapshot_data: HashMap<String, Vec<(Vec<u8>, Vec<u8>)>> =
                serde_json::from_slice(&data).map_err(|e| sm_error(e, ErrorVerb::Read))?;

            for (cf_name, cf_data) in snapshot_data {
                let Some(cf) = self.db.cf_handle(&cf_name) else {
                    warn!("Snapshot carries unknown column family '{}'", cf_name);
                    continue;
                };

                let mut batch = WriteBatch::default();
                let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);
                for item in iter {
                    let (key, _) = item.map_err(|e| sm_error(e, ErrorVerb::Read))?;
                    batch.delete_cf(cf, &key);
                }
                for (key, value) in cf_data {
                    batch.put_cf(cf, &key, &value);
                }
                self.db
                    .write(batch)
                    .map_err(|e| sm_error(e, ErrorVerb::Write))?;
            }
        }

        if let Some(log_id) = meta.last_log_id {
            self.save_last_applied(log_id).await?;
        }
        self.save_membership(meta.last_membership.clone()).await?;

        info!("Snapshot installed: {:?}", meta.snapshot_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trellis_common::{ErrorKind, Topic, UrlInfo};

    async fn create_sm() -> (RocksStateMachine, TempDir) {
        let tmp_dir = TempDir::new().unwrap();
        let sm = RocksStateMachine::new(tmp_dir.path()).await.unwrap();
        (sm, tmp_dir)
    }

    fn record(name: &str, cluster: Option<&str>) -> ServiceRecord {
        let mut r = ServiceRecord::new("example", name, UrlInfo::new("tcp", "127.0.0.1", 7000));
        r.cluster = cluster.map(str::to_string);
        r
    }

    fn apply(sm: &RocksStateMachine, request: RaftRequest) -> RaftResponse {
        let mut events = Vec::new();
        let response = sm.apply_request(request, &mut events);
        sm.publish(events);
        response
    }

    fn get_record(sm: &RocksStateMachine, name: &str) -> Option<ServiceRecord> {
        sm.get_doc(CF_RECORDS, &RocksStateMachine::record_key("example", name))
            .unwrap()
    }

    #[test]
    fn test_key_generation() {
        assert_eq!(RocksStateMachine::record_key("example", "00.svc"), "example@@00.svc");
        assert_eq!(
            RocksStateMachine::cert_key("example", CertKind::User, "alice"),
            "example@@user@@alice"
        );
        assert_eq!(RocksStateMachine::network_prefix("example"), "example@@");
    }

    #[tokio::test]
    async fn test_record_put_and_delete() {
        let (sm, _dir) = create_sm().await;
        let resp = apply(&sm, RaftRequest::RecordPut { record: record("api", None) });
        assert!(resp.success);
        assert_eq!(get_record(&sm, "api"), Some(record("api", None)));

        let resp = apply(
            &sm,
            RaftRequest::RecordDelete {
                network: "example".to_string(),
                name: "api".to_string(),
            },
        );
        assert!(resp.success);
        assert!(get_record(&sm, "api").is_none());

        let resp = apply(
            &sm,
            RaftRequest::RecordDelete {
                network: "example".to_string(),
                name: "api".to_string(),
            },
        );
        assert_eq!(resp.error, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_down_clears_online_but_keeps_ready() {
        let (sm, _dir) = create_sm().await;
        apply(&sm, RaftRequest::RecordPut { record: record("00.svc", None) });
        apply(
            &sm,
            RaftRequest::RecordOnline {
                network: "example".to_string(),
                name: "00.svc".to_string(),
                instance: "i-1".to_string(),
                ready: Some(true),
            },
        );
        let online = get_record(&sm, "00.svc").unwrap();
        assert_eq!(online.online.as_deref(), Some("i-1"));
        assert!(online.ready);

        // A stale instance cannot take the record down
        apply(
            &sm,
            RaftRequest::RecordDown {
                network: "example".to_string(),
                name: "00.svc".to_string(),
                instance: Some("i-0".to_string()),
            },
        );
        assert!(get_record(&sm, "00.svc").unwrap().online.is_some());

        apply(
            &sm,
            RaftRequest::RecordDown {
                network: "example".to_string(),
                name: "00.svc".to_string(),
                instance: Some("i-1".to_string()),
            },
        );
        let down = get_record(&sm, "00.svc").unwrap();
        assert!(down.online.is_none());
        assert!(down.ready);
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let (sm, _dir) = create_sm().await;
        let bus = EventBus::default();
        let sm = sm.with_events(bus.clone());
        let mut sub = bus.subscribe(Topic::records("example"));

        apply(&sm, RaftRequest::RecordPut { record: record("api", None) });
        apply(
            &sm,
            RaftRequest::RecordDelete {
                network: "example".to_string(),
                name: "api".to_string(),
            },
        );

        let Some(RegistryEvent::Record(add)) = sub.try_recv() else {
            panic!("expected add event");
        };
        assert_eq!(add.kind, RecordEventKind::Add);
        let Some(RegistryEvent::Record(del)) = sub.try_recv() else {
            panic!("expected del event");
        };
        assert_eq!(del.kind, RecordEventKind::Del);
        assert!(del.record.is_none());
    }

    #[tokio::test]
    async fn test_cluster_leader_rewrites_members() {
        let (sm, _dir) = create_sm().await;
        for name in ["db.0", "db.1"] {
            let mut r = record(name, Some("db"));
            r.leader = Some("db.0".to_string());
            apply(&sm, RaftRequest::RecordPut { record: r });
        }
        apply(&sm, RaftRequest::RecordPut { record: record("other", None) });

        let resp = apply(
            &sm,
            RaftRequest::ClusterLeader {
                network: "example".to_string(),
                cluster: "db".to_string(),
                leader: "db.1".to_string(),
            },
        );
        assert!(resp.success);
        assert_eq!(get_record(&sm, "db.0").unwrap().leader.as_deref(), Some("db.1"));
        assert!(get_record(&sm, "db.1").unwrap().is_leader());
        assert!(get_record(&sm, "other").unwrap().leader.is_none());

        let resp = apply(
            &sm,
            RaftRequest::ClusterLeader {
                network: "example".to_string(),
                cluster: "db".to_string(),
                leader: "other".to_string(),
            },
        );
        assert_eq!(resp.error, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_ticket_redeem_is_single_use() {
        let (sm, _dir) = create_sm().await;
        let ticket = Ticket {
            iden: "abc".to_string(),
            kind: TicketKind::Service,
            network: "example".to_string(),
            target: "00.svc".to_string(),
            config: Default::default(),
            creator: "root".to_string(),
            created: 1,
        };
        assert!(apply(&sm, RaftRequest::TicketIssue { ticket: ticket.clone() }).success);

        let first = apply(&sm, RaftRequest::TicketRedeem { iden: "abc".to_string() });
        let redeemed: Ticket = first.into_result().unwrap().unwrap();
        assert_eq!(redeemed, ticket);

        let second = apply(&sm, RaftRequest::TicketRedeem { iden: "abc".to_string() });
        assert_eq!(second.error, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_ca_first_writer_wins() {
        let (sm, _dir) = create_sm().await;
        let ca = |pem: &str| CaRecord {
            network: "example".to_string(),
            cert_pem: pem.to_string(),
            key_pem: "key".to_string(),
            cap_secret: "00".to_string(),
            created: 1,
        };
        apply(&sm, RaftRequest::CaPut { ca: ca("first") });
        let stored: CaRecord = apply(&sm, RaftRequest::CaPut { ca: ca("second") })
            .into_result()
            .unwrap()
            .unwrap();
        assert_eq!(stored.cert_pem, "first");
    }

    #[tokio::test]
    async fn test_cert_reissue_requires_revocation() {
        let (sm, _dir) = create_sm().await;
        let cert = |fp: &str| CertRecord {
            network: "example".to_string(),
            kind: CertKind::Host,
            subject: "api".to_string(),
            cert_pem: String::new(),
            serial: "01".to_string(),
            fingerprint: fp.to_string(),
            issued: 1,
        };
        assert!(apply(&sm, RaftRequest::CertIssue { cert: cert("aa") }).success);
        let dup = apply(&sm, RaftRequest::CertIssue { cert: cert("bb") });
        assert_eq!(dup.error, Some(ErrorKind::AlreadyExists));

        apply(
            &sm,
            RaftRequest::CertRevoke {
                revoked: RevokedCert {
                    network: "example".to_string(),
                    fingerprint: "aa".to_string(),
                    serial: "01".to_string(),
                    subject: "api".to_string(),
                    revoked: 2,
                },
            },
        );
        assert!(apply(&sm, RaftRequest::CertIssue { cert: cert("bb") }).success);
    }

    #[tokio::test]
    async fn test_pool_membership() {
        let (sm, _dir) = create_sm().await;
        let bus = EventBus::default();
        let sm = sm.with_events(bus.clone());
        apply(&sm, RaftRequest::RecordPut { record: record("web.0", None) });
        apply(
            &sm,
            RaftRequest::PoolCreate {
                pool: Pool {
                    name: "web".to_string(),
                    network: "example".to_string(),
                    members: Vec::new(),
                    creator: String::new(),
                    created: 1,
                },
            },
        );
        let mut sub = bus.subscribe(Topic::pool("example", "web"));

        let missing = apply(
            &sm,
            RaftRequest::PoolMemberAdd {
                network: "example".to_string(),
                pool: "web".to_string(),
                member: "ghost".to_string(),
            },
        );
        assert_eq!(missing.error, Some(ErrorKind::NotFound));

        let added = apply(
            &sm,
            RaftRequest::PoolMemberAdd {
                network: "example".to_string(),
                pool: "web".to_string(),
                member: "web.0".to_string(),
            },
        );
        let pool: Pool = added.into_result().unwrap().unwrap();
        assert_eq!(pool.members, vec!["web.0".to_string()]);

        let Some(RegistryEvent::Pool(event)) = sub.try_recv() else {
            panic!("expected pool event");
        };
        assert_eq!(event.kind, PoolEventKind::MemberAdd);
        assert_eq!(event.member.as_deref(), Some("web.0"));

        // Deleting the pool leaves the service in place
        apply(
            &sm,
            RaftRequest::PoolDelete {
                network: "example".to_string(),
                name: "web".to_string(),
            },
        );
        assert!(get_record(&sm, "web.0").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (mut sm, _dir) = create_sm().await;
        apply(&sm, RaftRequest::RecordPut { record: record("api", None) });

        let snapshot = sm.build_snapshot().await.unwrap();

        let (mut other, _other_dir) = create_sm().await;
        other
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();
        assert_eq!(get_record(&other, "api"), Some(record("api", None)));
    }
}
