// RocksDB-backed Raft log storage for the registry

// openraft StorageError is a large type
#![allow(clippy::result_large_err)]

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{
    Entry, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftLogReader, StorageError, Vote,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{NodeId, TypeConfig};

const CF_LOGS: &str = "logs";
const CF_STATE: &str = "state";

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged";
const KEY_COMMITTED: &[u8] = b"committed";

/// Write buffer size: 16MB, registry entries are small
const WRITE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

fn store_error(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    e: impl std::fmt::Display,
) -> StorageError<NodeId> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(e.to_string()))
}

fn logs_error(verb: ErrorVerb, e: impl std::fmt::Display) -> StorageError<NodeId> {
    store_error(ErrorSubject::Logs, verb, e)
}

/// Values cached in memory so that log state queries never touch disk
#[derive(Clone, Copy, Default)]
struct LogCache {
    last_log_id: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
}

/// RocksDB-based log store for Raft
pub struct RocksLogStore {
    db: Arc<DB>,
    cache: Arc<RwLock<LogCache>>,
}

impl RocksLogStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError<NodeId>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(WRITE_BUFFER_SIZE);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_LOGS, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)
            .map_err(|e| logs_error(ErrorVerb::Read, e))?;

        let store = Self {
            db: Arc::new(db),
            cache: Arc::new(RwLock::new(LogCache::default())),
        };

        let cache = LogCache {
            vote: store.read_state(KEY_VOTE, ErrorSubject::Vote)?,
            last_purged: store.read_state(KEY_LAST_PURGED, ErrorSubject::Logs)?,
            committed: store.read_state(KEY_COMMITTED, ErrorSubject::Logs)?,
            last_log_id: store.scan_last_log_id()?,
        };
        *store.cache.write().await = cache;

        info!(
            last_log = ?cache.last_log_id,
            "RocksDB log store initialized"
        );
        Ok(store)
    }

    /// Column families are created at open; a missing one means a corrupted database
    fn cf_logs(&self) -> &ColumnFamily {
        self.db
            .cf_handle(CF_LOGS)
            .expect("CF_LOGS must exist - database may be corrupted")
    }

    fn cf_state(&self) -> &ColumnFamily {
        self.db
            .cf_handle(CF_STATE)
            .expect("CF_STATE must exist - database may be corrupted")
    }

    /// Big-endian keys keep RocksDB iteration in log order
    fn index_key(index: u64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, index);
        buf
    }

    fn key_index(key: &[u8]) -> Option<u64> {
        (key.len() == 8).then(|| BigEndian::read_u64(key))
    }

    fn read_state<T: DeserializeOwned>(
        &self,
        key: &[u8],
        subject: ErrorSubject<NodeId>,
    ) -> Result<Option<T>, StorageError<NodeId>> {
        let bytes = self
            .db
            .get_cf(self.cf_state(), key)
            .map_err(|e| store_error(subject.clone(), ErrorVerb::Read, e))?;
        bytes
            .map(|b| serde_json::from_slice(&b))
            .transpose()
            .map_err(|e| store_error(subject, ErrorVerb::Read, e))
    }

    fn write_state<T: Serialize>(
        &self,
        key: &[u8],
        value: &T,
        subject: ErrorSubject<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| store_error(subject.clone(), ErrorVerb::Write, e))?;
        self.db
            .put_cf(self.cf_state(), key, bytes)
            .map_err(|e| store_error(subject, ErrorVerb::Write, e))
    }

    fn scan_last_log_id(&self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek_to_last();

        if iter.valid()
            && let Some(value) = iter.value()
        {
            let entry: Entry<TypeConfig> =
                serde_json::from_slice(value).map_err(|e| logs_error(ErrorVerb::Read, e))?;
            return Ok(Some(entry.log_id));
        }
        Ok(None)
    }

    /// Delete every log key in `[from, to)`
    fn delete_range(&self, from: u64, to: Option<u64>) -> WriteBatch {
        let mut batch = WriteBatch::default();
        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek(Self::index_key(from));

        while iter.valid() {
            if let Some(key) = iter.key() {
                if let (Some(end), Some(index)) = (to, Self::key_index(key))
                    && index >= end
                {
                    break;
                }
                batch.delete_cf(self.cf_logs(), key);
            }
            iter.next();
        }
        batch
    }
}

impl RaftLogReader<TypeConfig> for RocksLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };

        let mut entries = Vec::new();
        let mut iter = self.db.raw_iterator_cf(self.cf_logs());
        iter.seek(Self::index_key(start));

        while iter.valid() {
            let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                break;
            };
            match Self::key_index(key) {
                Some(index) if range.contains(&index) => {
                    let entry: Entry<TypeConfig> = serde_json::from_slice(value)
                        .map_err(|e| logs_error(ErrorVerb::Read, e))?;
                    entries.push(entry);
                }
                _ => break,
            }
            iter.next();
        }

        debug!("Read {} log entries from range {:?}", entries.len(), range);
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RocksLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let cache = *self.cache.read().await;
        Ok(LogState {
            last_purged_log_id: cache.last_purged,
            last_log_id: cache.last_log_id.or(cache.last_purged),
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write_state(KEY_VOTE, vote, ErrorSubject::Vote)?;
        self.cache.write().await.vote = Some(*vote);
        debug!("Saved vote: {:?}", vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.cache.read().await.vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.write_state(KEY_COMMITTED, &committed, ErrorSubject::Logs)?;
        self.cache.write().await.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.cache.read().await.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        RocksLogStore {
            db: self.db.clone(),
            cache: self.cache.clone(),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut batch = WriteBatch::default();
        let mut last_log_id = None;
        let mut count = 0usize;

        for entry in entries {
            let value = serde_json::to_vec(&entry).map_err(|e| logs_error(ErrorVerb::Write, e))?;
            batch.put_cf(self.cf_logs(), Self::index_key(entry.log_id.index), value);
            last_log_id = Some(entry.log_id);
            count += 1;
        }

        if count > 0 {
            self.db
                .write(batch)
                .map_err(|e| logs_error(ErrorVerb::Write, e))?;
            self.cache.write().await.last_log_id = last_log_id;
            debug!("Appended {} log entries", count);
        }

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        // Entries at and after log_id.index are removed
        let batch = self.delete_range(log_id.index, None);
        self.db
            .write(batch)
            .map_err(|e| logs_error(ErrorVerb::Delete, e))?;

        let last = self.scan_last_log_id()?;
        self.cache.write().await.last_log_id = last;

        debug!("Truncated logs from index {}", log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut batch = self.delete_range(0, Some(log_id.index + 1));
        let purged = serde_json::to_vec(&log_id).map_err(|e| logs_error(ErrorVerb::Write, e))?;
        batch.put_cf(self.cf_state(), KEY_LAST_PURGED, purged);

        self.db
            .write(batch)
            .map_err(|e| logs_error(ErrorVerb::Delete, e))?;

        let mut cache = self.cache.write().await;
        cache.last_purged = Some(log_id);
        if cache.last_log_id.is_none_or(|last| last.index <= log_id.index) {
            cache.last_log_id = Some(log_id);
        }

        debug!("Purged logs up to index {}", log_id.index);
        Ok(())
    }
}
