// RocksDB reader for the registry state machine
// Provides read-only query operations on the state machine's column families

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use rocksdb::{DB, Direction, IteratorMode};
use serde::de::DeserializeOwned;
use trellis_common::{
    CaRecord, CertKind, CertRecord, Pool, RevokedCert, ServiceRecord, Ticket, TicketKind,
};

use super::state_machine::{
    CF_CAS, CF_CERTS, CF_POOLS, CF_RECORDS, CF_REVOCATIONS, CF_TICKETS, RocksStateMachine,
};

/// Records fetched per page by a cursor
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// Read-only interface for querying registry data stored in RocksDB
#[derive(Clone)]
pub struct RocksDbReader {
    db: Arc<DB>,
}

impl RocksDbReader {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn from_state_machine(sm: &RocksStateMachine) -> Self {
        Self::new(sm.db())
    }

    // ==================== Record Operations ====================

    pub fn get_record(&self, network: &str, name: &str) -> anyhow::Result<Option<ServiceRecord>> {
        self.get_doc(CF_RECORDS, &RocksStateMachine::record_key(network, name))
    }

    /// Lazy cursor over records, all networks when `network` is `None`
    pub fn list_records(&self, network: Option<&str>) -> RecordCursor {
        let prefix = network.map(RocksStateMachine::network_prefix).unwrap_or_default();
        DocCursor::new(self.db.clone(), CF_RECORDS, prefix, DEFAULT_PAGE_SIZE)
    }

    /// Members of a cluster, in key order
    pub fn cluster_members(
        &self,
        network: &str,
        cluster: &str,
    ) -> anyhow::Result<Vec<ServiceRecord>> {
        let mut members = Vec::new();
        for record in self.list_records(Some(network)) {
            let record = record?;
            if record.cluster.as_deref() == Some(cluster) {
                members.push(record);
            }
        }
        Ok(members)
    }

    // ==================== Ticket Operations ====================

    pub fn get_ticket(&self, iden: &str) -> anyhow::Result<Option<Ticket>> {
        self.get_doc(CF_TICKETS, &RocksStateMachine::ticket_key(iden))
    }

    pub fn list_tickets(&self, kind: Option<TicketKind>) -> anyhow::Result<Vec<Ticket>> {
        let tickets: Vec<Ticket> = self.scan_docs(CF_TICKETS, "")?;
        Ok(tickets
            .into_iter()
            .filter(|t| kind.is_none_or(|k| k == t.kind))
            .collect())
    }

    // ==================== CA Operations ====================

    pub fn get_ca(&self, network: &str) -> anyhow::Result<Option<CaRecord>> {
        self.get_doc(CF_CAS, &RocksStateMachine::ca_key(network))
    }

    pub fn get_cert(
        &self,
        network: &str,
        kind: CertKind,
        subject: &str,
    ) -> anyhow::Result<Option<CertRecord>> {
        self.get_doc(CF_CERTS, &RocksStateMachine::cert_key(network, kind, subject))
    }

    pub fn get_revocation(
        &self,
        network: &str,
        fingerprint: &str,
    ) -> anyhow::Result<Option<RevokedCert>> {
        self.get_doc(
            CF_REVOCATIONS,
            &RocksStateMachine::revocation_key(network, fingerprint),
        )
    }

    pub fn list_revocations(&self, network: &str) -> anyhow::Result<Vec<RevokedCert>> {
        self.scan_docs(CF_REVOCATIONS, &RocksStateMachine::network_prefix(network))
    }

    // ==================== Pool Operations ====================

    pub fn get_pool(&self, network: &str, name: &str) -> anyhow::Result<Option<Pool>> {
        self.get_doc(CF_POOLS, &RocksStateMachine::pool_key(network, name))
    }

    pub fn list_pools(&self, network: &str) -> anyhow::Result<Vec<Pool>> {
        self.scan_docs(CF_POOLS, &RocksStateMachine::network_prefix(network))
    }

    // ==================== Internal Helpers ====================

    fn cf_handle(&self, cf_name: &str) -> anyhow::Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf_name))
    }

    fn get_doc<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> anyhow::Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key.as_bytes()) {
            Ok(Some(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("RocksDB get error: {}", e)),
        }
    }

    fn scan_docs<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> anyhow::Result<Vec<T>> {
        DocCursor::new(self.db.clone(), cf_name, prefix.to_string(), DEFAULT_PAGE_SIZE).collect()
    }
}

/// Lazy, finite, restartable cursor over the documents under a key prefix.
///
/// Documents are read from RocksDB one page at a time; each page resumes
/// after the last key returned, so writes made while iterating are observed
/// for keys not yet reached.
pub struct DocCursor<T> {
    db: Arc<DB>,
    cf_name: &'static str,
    prefix: String,
    page_size: usize,
    last_key: Option<Vec<u8>>,
    buffer: VecDeque<T>,
    exhausted: bool,
    _marker: PhantomData<fn() -> T>,
}

/// Cursor over service records
pub type RecordCursor = DocCursor<ServiceRecord>;

impl<T: DeserializeOwned> DocCursor<T> {
    fn new(db: Arc<DB>, cf_name: &'static str, prefix: String, page_size: usize) -> Self {
        Self {
            db,
            cf_name,
            prefix,
            page_size: page_size.max(1),
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
            _marker: PhantomData,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Restart from the first key
    pub fn rewind(&mut self) {
        self.last_key = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill_page(&mut self) -> anyhow::Result<()> {
        let cf = self
            .db
            .cf_handle(self.cf_name)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", self.cf_name))?;

        let start = self
            .last_key
            .clone()
            .unwrap_or_else(|| self.prefix.as_bytes().to_vec());
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut fetched = 0;
        for item in iter {
            let (key, value) = item.map_err(|e| anyhow::anyhow!("RocksDB iterator error: {}", e))?;
            if !key.starts_with(self.prefix.as_bytes()) {
                self.exhausted = true;
                break;
            }
            if self.last_key.as_deref() == Some(&key[..]) {
                continue;
            }
            self.buffer.push_back(serde_json::from_slice(&value)?);
            self.last_key = Some(key.to_vec());
            fetched += 1;
            if fetched == self.page_size {
                return Ok(());
            }
        }
        self.exhausted = true;
        Ok(())
    }
}

impl<T: DeserializeOwned> Iterator for DocCursor<T> {
    type Item = anyhow::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trellis_common::UrlInfo;

    async fn create_test_db() -> (Arc<DB>, TempDir) {
        let tmp_dir = TempDir::new().unwrap();
        let sm: RocksStateMachine = RocksStateMachine::new(tmp_dir.path()).await.unwrap();
        (sm.db(), tmp_dir)
    }

    fn put_record(db: &DB, network: &str, name: &str, cluster: Option<&str>) {
        let cf = db.cf_handle(CF_RECORDS).unwrap();
        let mut record = ServiceRecord::new(network, name, UrlInfo::new("tcp", "h", 1));
        record.cluster = cluster.map(str::to_string);
        let key = RocksStateMachine::record_key(network, name);
        db.put_cf(cf, key.as_bytes(), serde_json::to_vec(&record).unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn test_reader_get_record() {
        let (db, _tmp_dir) = create_test_db().await;
        put_record(&db, "example", "api", None);

        let reader = RocksDbReader::new(db);
        let record = reader.get_record("example", "api").unwrap().unwrap();
        assert_eq!(record.name, "api");
        assert!(reader.get_record("example", "missing").unwrap().is_none());
        assert!(reader.get_record("other", "api").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_pages_and_rewinds() {
        let (db, _tmp_dir) = create_test_db().await;
        for i in 0..5 {
            put_record(&db, "example", &format!("svc{}", i), None);
        }
        put_record(&db, "examplf", "outside", None);

        let reader = RocksDbReader::new(db);
        let mut cursor = reader.list_records(Some("example")).with_page_size(2);
        let names: Vec<String> = cursor.by_ref().map(|r| r.unwrap().name).collect();
        assert_eq!(names, vec!["svc0", "svc1", "svc2", "svc3", "svc4"]);
        assert!(cursor.next().is_none());

        cursor.rewind();
        assert_eq!(cursor.next().unwrap().unwrap().name, "svc0");

        let all: Vec<_> = reader.list_records(None).collect();
        assert_eq!(all.len(), 6);
    }

    #[tokio::test]
    async fn test_cursor_sees_keys_written_ahead() {
        let (db, _tmp_dir) = create_test_db().await;
        put_record(&db, "example", "a", None);
        put_record(&db, "example", "c", None);

        let reader = RocksDbReader::new(db.clone());
        let mut cursor = reader.list_records(Some("example")).with_page_size(1);
        assert_eq!(cursor.next().unwrap().unwrap().name, "a");

        put_record(&db, "example", "b", None);
        let rest: Vec<String> = cursor.map(|r| r.unwrap().name).collect();
        assert_eq!(rest, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_cluster_members() {
        let (db, _tmp_dir) = create_test_db().await;
        put_record(&db, "example", "db.0", Some("db"));
        put_record(&db, "example", "db.1", Some("db"));
        put_record(&db, "example", "web", None);

        let reader = RocksDbReader::new(db);
        let members = reader.cluster_members("example", "db").unwrap();
        assert_eq!(members.len(), 2);
        assert!(reader.cluster_members("example", "cache").unwrap().is_empty());
    }
}
