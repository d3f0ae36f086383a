//! Client resolver and shared connection cache
//!
//! `resolve` turns an address into a [`Lease`] on a live connection.
//! Leases of the same address share one physical connection; the last
//! `release` tears it down. Registry addresses follow the current leader:
//! [`Lease::connection`] re-resolves the record and reconnects when the
//! endpoint moved.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use trellis_common::{
    Address, DEFAULT_NETWORK, SymbolicAddr, TrellisError, UrlInfo, parse_address,
};

use crate::error::{ClientError, Result};
use crate::lookup::RecordLookup;

/// Where a connection should go
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    /// Registry record the endpoint was resolved from; None for direct
    /// addresses
    pub name: Option<String>,
    pub url: UrlInfo,
    pub user: Option<String>,
}

/// Opens connections to resolved endpoints
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Conn>;

    /// Called once the last lease of a connection is gone
    async fn close(&self, _conn: Arc<Self::Conn>) {}
}

/// Bounded exponential backoff for transport failures
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter = rand::random_range(0..=capped.as_millis() as u64 / 4);
        capped + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or
    /// runs out of attempts
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, ?delay, error = %e, "Retrying after transport failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

struct CacheEntry<T> {
    endpoint: Endpoint,
    conn: Arc<T>,
    refs: usize,
    /// Held while a lease swaps `conn` for a new leader
    reconnect: Arc<tokio::sync::Mutex<()>>,
}

struct Inner<C: Connector> {
    lookup: Arc<dyn RecordLookup>,
    connector: Arc<C>,
    networks: Vec<String>,
    retry: RetryPolicy,
    cache: Mutex<HashMap<String, CacheEntry<C::Conn>>>,
}

pub struct Resolver<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Resolver<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A share of a cached connection
pub struct Lease<C: Connector> {
    key: String,
    address: Address,
    conn: Arc<C::Conn>,
    inner: Arc<Inner<C>>,
    released: bool,
}

impl<C: Connector> Resolver<C> {
    /// `networks` lists the known networks; the first is the default.
    /// An empty list means [`DEFAULT_NETWORK`].
    pub fn new(lookup: Arc<dyn RecordLookup>, connector: Arc<C>, networks: Vec<String>) -> Self {
        let networks = if networks.is_empty() {
            vec![DEFAULT_NETWORK.to_string()]
        } else {
            networks
        };
        Self {
            inner: Arc::new(Inner {
                lookup,
                connector,
                networks,
                retry: RetryPolicy::default(),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replace the retry policy; only valid before the resolver is shared
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.retry = retry;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    pub fn parse(&self, address: &str) -> Result<Address> {
        let networks: Vec<&str> = self.inner.networks.iter().map(String::as_str).collect();
        Ok(parse_address(address, &networks)?)
    }

    /// Lease a connection to `address`, sharing one already open
    pub async fn resolve(&self, address: &str) -> Result<Lease<C>> {
        let address = self.parse(address)?;
        let key = cache_key(&address);

        if let Some(conn) = self.inner.acquire(&key) {
            debug!(key, "Reusing cached connection");
            return Ok(self.lease(key, address, conn));
        }

        let endpoint = self.inner.endpoint(&address).await?;
        let conn = Arc::new(self.inner.connect(&endpoint).await?);

        let (conn, surplus) = {
            let mut cache = self.inner.cache.lock();
            match cache.get_mut(&key) {
                // another resolve of the same key won the race
                Some(entry) => {
                    entry.refs += 1;
                    (entry.conn.clone(), Some(conn))
                }
                None => {
                    cache.insert(
                        key.clone(),
                        CacheEntry {
                            endpoint: endpoint.clone(),
                            conn: conn.clone(),
                            refs: 1,
                            reconnect: Arc::default(),
                        },
                    );
                    (conn, None)
                }
            }
        };
        if let Some(surplus) = surplus {
            self.inner.connector.close(surplus).await;
        } else {
            info!(key, url = %endpoint.url, "Connection opened");
        }
        Ok(self.lease(key, address, conn))
    }

    fn lease(&self, key: String, address: Address, conn: Arc<C::Conn>) -> Lease<C> {
        Lease {
            key,
            address,
            conn,
            inner: self.inner.clone(),
            released: false,
        }
    }

    /// Give a lease back; the connection is closed when no lease remains
    pub async fn release(&self, mut lease: Lease<C>) {
        lease.released = true;
        if let Some(conn) = self.inner.decrement(&lease.key) {
            info!(key = %lease.key, "Connection closed");
            self.inner.connector.close(conn).await;
        }
    }

    /// Number of leases sharing the connection of `address`
    pub fn ref_count(&self, address: &str) -> usize {
        let Ok(address) = self.parse(address) else {
            return 0;
        };
        self.inner
            .cache
            .lock()
            .get(&cache_key(&address))
            .map_or(0, |entry| entry.refs)
    }

    pub fn cached_connections(&self) -> usize {
        self.inner.cache.lock().len()
    }
}

impl<C: Connector> Inner<C> {
    fn acquire(&self, key: &str) -> Option<Arc<C::Conn>> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(key)?;
        entry.refs += 1;
        Some(entry.conn.clone())
    }

    /// Drop one reference; returns the connection when it was the last
    fn decrement(&self, key: &str) -> Option<Arc<C::Conn>> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(key)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }
        cache.remove(key).map(|entry| entry.conn)
    }

    async fn endpoint(&self, address: &Address) -> Result<Endpoint> {
        match address {
            Address::Direct(url) => Ok(Endpoint {
                name: None,
                url: url.clone(),
                user: None,
            }),
            Address::Registry(sym) => self.lookup_endpoint(sym).await,
        }
    }

    async fn lookup_endpoint(&self, sym: &SymbolicAddr) -> Result<Endpoint> {
        let record = self
            .retry
            .run("lookup", || self.lookup.resolve(&sym.network, &sym.name))
            .await?;
        if !record.is_online() {
            return Err(TrellisError::not_ready(format!(
                "service '{}' in network '{}' is not online",
                record.name, record.network
            ))
            .with_info("name", record.name)
            .into());
        }
        let mut url = record.urlinfo;
        if !sym.path.is_empty() {
            url.path = sym.path.clone();
        }
        Ok(Endpoint {
            name: Some(record.name),
            url,
            user: sym.user.clone(),
        })
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<C::Conn> {
        self.retry
            .run("connect", || self.connector.connect(endpoint))
            .await
    }

    /// Re-resolve a registry address and swap the cached connection when
    /// the endpoint moved
    async fn follow(&self, key: &str, address: &Address) -> Result<Arc<C::Conn>> {
        let Address::Registry(sym) = address else {
            return self.cached(key);
        };
        let endpoint = self.lookup_endpoint(sym).await?;

        let reconnect = {
            let cache = self.cache.lock();
            let entry = cache.get(key).ok_or_else(|| released(key))?;
            if entry.endpoint == endpoint {
                return Ok(entry.conn.clone());
            }
            entry.reconnect.clone()
        };
        let _guard = reconnect.lock().await;

        // a lease that held the lock before us may already have moved
        let current = {
            let cache = self.cache.lock();
            let entry = cache.get(key).ok_or_else(|| released(key))?;
            if entry.endpoint == endpoint {
                return Ok(entry.conn.clone());
            }
            entry.endpoint.clone()
        };

        info!(
            key,
            from = ?current.name,
            to = ?endpoint.name,
            "Leader moved, reconnecting"
        );
        let conn = Arc::new(self.connect(&endpoint).await?);
        let swapped = {
            let mut cache = self.cache.lock();
            cache.get_mut(key).map(|entry| {
                if entry.endpoint == endpoint {
                    (entry.conn.clone(), false)
                } else {
                    entry.endpoint = endpoint;
                    (std::mem::replace(&mut entry.conn, conn.clone()), true)
                }
            })
        };
        match swapped {
            Some((replaced, true)) => {
                self.connector.close(replaced).await;
                Ok(conn)
            }
            Some((cached, false)) => {
                self.connector.close(conn).await;
                Ok(cached)
            }
            None => {
                self.connector.close(conn).await;
                Err(released(key))
            }
        }
    }

    fn cached(&self, key: &str) -> Result<Arc<C::Conn>> {
        self.cache
            .lock()
            .get(key)
            .map(|entry| entry.conn.clone())
            .ok_or_else(|| released(key))
    }
}

fn released(key: &str) -> ClientError {
    TrellisError::not_found(format!("connection '{}' was released", key)).into()
}

fn cache_key(address: &Address) -> String {
    match address {
        Address::Registry(sym) => sym.cache_key(),
        Address::Direct(url) => url.to_string(),
    }
}

impl<C: Connector> Lease<C> {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Connection as of the last resolution, without a registry round trip
    pub fn current(&self) -> Arc<C::Conn> {
        self.conn.clone()
    }

    /// Connection to the current leader, reconnecting if it moved
    pub async fn connection(&mut self) -> Result<Arc<C::Conn>> {
        let conn = self.inner.follow(&self.key, &self.address).await?;
        self.conn = conn.clone();
        Ok(conn)
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(conn) = self.inner.decrement(&self.key) else {
            return;
        };
        debug!(key = %self.key, "Last lease dropped without release");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connector = self.inner.connector.clone();
            handle.spawn(async move { connector.close(conn).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use trellis_common::{ErrorKind, ServiceRecord};

    #[derive(Default)]
    struct FakeLookup {
        records: Mutex<HashMap<(String, String), ServiceRecord>>,
        /// Transport failures to return before answering
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeLookup {
        fn put(&self, name: &str, port: u16, online: bool) {
            let mut record = ServiceRecord::new("example", name, UrlInfo::new("tcp", "h", port));
            if online {
                record.online = Some("i-1".to_string());
            }
            self.records
                .lock()
                .insert(("example".to_string(), name.to_string()), record);
        }

        fn alias(&self, alias: &str, name: &str) {
            let mut records = self.records.lock();
            let record = records[&("example".to_string(), name.to_string())].clone();
            records.insert(("example".to_string(), alias.to_string()), record);
        }
    }

    #[async_trait]
    impl RecordLookup for FakeLookup {
        async fn resolve(&self, network: &str, name: &str) -> Result<ServiceRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TrellisError::transport("connection refused").into());
            }
            self.records
                .lock()
                .get(&(network.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| TrellisError::not_found(format!("no record '{}'", name)).into())
        }
    }

    #[derive(Debug)]
    struct FakeConn {
        port: u16,
        closed: AtomicBool,
    }

    #[derive(Default)]
    struct FakeConnector {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Conn = FakeConn;

        async fn connect(&self, endpoint: &Endpoint) -> Result<FakeConn> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            // give concurrent leases a chance to interleave
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            Ok(FakeConn {
                port: endpoint.url.port,
                closed: AtomicBool::new(false),
            })
        }

        async fn close(&self, conn: Arc<FakeConn>) {
            conn.closed.store(true, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn resolver() -> (Resolver<FakeConnector>, Arc<FakeLookup>, Arc<FakeConnector>) {
        let lookup = Arc::new(FakeLookup::default());
        let connector = Arc::new(FakeConnector::default());
        let resolver = Resolver::new(lookup.clone(), connector.clone(), vec!["example".to_string()])
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            });
        (resolver, lookup, connector)
    }

    #[tokio::test]
    async fn test_leases_share_one_connection() {
        let (resolver, lookup, connector) = resolver();
        lookup.put("00.svc", 4000, true);

        let a = resolver.resolve("trellis://00.svc/").await.unwrap();
        let b = resolver.resolve("trellis://00.svc.example/").await.unwrap();
        assert!(Arc::ptr_eq(&a.current(), &b.current()));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.ref_count("trellis://00.svc/"), 2);

        resolver.release(a).await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.ref_count("trellis://00.svc/"), 1);

        resolver.release(b).await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_connections(), 0);
    }

    #[tokio::test]
    async fn test_offline_record_is_not_ready() {
        let (resolver, lookup, connector) = resolver();
        lookup.put("00.svc", 4000, false);

        let err = resolver.resolve("trellis://00.svc/").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotReady);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found_without_retry() {
        let (resolver, lookup, _) = resolver();
        let err = resolver.resolve("trellis://ghost/").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried_with_a_bound() {
        let (resolver, lookup, _) = resolver();
        lookup.put("00.svc", 4000, true);

        lookup.failures.store(2, Ordering::SeqCst);
        let lease = resolver.resolve("trellis://00.svc/").await.unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
        resolver.release(lease).await;

        lookup.calls.store(0, Ordering::SeqCst);
        lookup.failures.store(10, Ordering::SeqCst);
        let err = resolver.resolve("trellis://00.svc/").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lease_follows_leader_change() {
        let (resolver, lookup, connector) = resolver();
        lookup.put("db.0", 5000, true);
        lookup.put("db.1", 5001, true);
        lookup.alias("db", "db.0");

        let mut lease = resolver.resolve("trellis://db/").await.unwrap();
        assert_eq!(lease.connection().await.unwrap().port, 5000);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);

        lookup.alias("db", "db.1");
        assert_eq!(lease.connection().await.unwrap().port, 5001);
        assert_eq!(lease.current().port, 5001);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);

        // a second lease of the alias shares the reconnected link
        let other = resolver.resolve("trellis://db/").await.unwrap();
        assert_eq!(other.current().port, 5001);
        resolver.release(other).await;
        resolver.release(lease).await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_leases_share_one_reconnect() {
        let (resolver, lookup, connector) = resolver();
        lookup.put("db.0", 5000, true);
        lookup.put("db.1", 5001, true);
        lookup.alias("db", "db.0");

        let mut a = resolver.resolve("trellis://db/").await.unwrap();
        let mut b = resolver.resolve("trellis://db/").await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);

        lookup.alias("db", "db.1");
        let (conn_a, conn_b) = tokio::join!(a.connection(), b.connection());
        let (conn_a, conn_b) = (conn_a.unwrap(), conn_b.unwrap());

        assert_eq!(conn_a.port, 5001);
        assert!(Arc::ptr_eq(&conn_a, &conn_b));
        assert!(!conn_a.closed.load(Ordering::SeqCst));
        assert!(!b.current().closed.load(Ordering::SeqCst));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        // only the link to the old leader went away
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);

        resolver.release(a).await;
        resolver.release(b).await;
        assert!(conn_b.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_direct_address_bypasses_registry() {
        let (resolver, lookup, _) = resolver();
        let mut lease = resolver.resolve("tcp://10.1.1.1:4000/").await.unwrap();
        assert_eq!(lease.connection().await.unwrap().port, 4000);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
        resolver.release(lease).await;
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_its_reference() {
        let (resolver, lookup, _) = resolver();
        lookup.put("00.svc", 4000, true);

        let a = resolver.resolve("trellis://00.svc/").await.unwrap();
        let b = resolver.resolve("trellis://00.svc/").await.unwrap();
        drop(a);
        assert_eq!(resolver.ref_count("trellis://00.svc/"), 1);
        drop(b);
        assert_eq!(resolver.cached_connections(), 0);
    }
}
