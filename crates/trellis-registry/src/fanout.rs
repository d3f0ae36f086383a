//! Peer fanout
//!
//! One logical call issued to every peer of a service identity. The peer
//! set is resolved when the call is made; each peer runs as its own task
//! with its own deadline and reports its own result. Dropping the result
//! stream aborts every task still running.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;
use trellis_common::{ErrorInfo, Result, ServiceRecord, TrellisError};

/// Buffered results per fanout before peers wait for the consumer
const RESULT_BUFFER: usize = 64;

/// Resolves the peer set of a service identity
pub trait PeerSource: Send + Sync {
    fn peers(&self, network: &str, identity: &str) -> Result<Vec<ServiceRecord>>;
}

/// Operation carried to each peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerOp {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl PeerOp {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Transport used to reach one peer
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn call(&self, peer: &ServiceRecord, op: &PeerOp) -> Result<Value>;

    /// Open a streaming call; items are yielded in the peer's order
    async fn stream(
        &self,
        peer: &ServiceRecord,
        op: &PeerOp,
    ) -> Result<BoxStream<'static, Result<Value>>>;
}

/// `(peer name, result)`
pub type PeerResult = (String, std::result::Result<Value, ErrorInfo>);

/// Lazy stream of per-peer results; ends once every peer finished
pub struct PeerResults {
    rx: mpsc::Receiver<PeerResult>,
    peers: usize,
    // aborts outstanding peer tasks on drop
    _tasks: JoinSet<()>,
}

impl PeerResults {
    /// Number of peers in the resolved set
    pub fn peer_count(&self) -> usize {
        self.peers
    }
}

impl Stream for PeerResults {
    type Item = PeerResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn offline(peer: &ServiceRecord) -> ErrorInfo {
    TrellisError::not_ready(format!("peer '{}' is offline", peer.name))
        .with_info("peer", peer.name.clone())
        .into()
}

fn timed_out(peer: &str, timeout: Duration) -> ErrorInfo {
    TrellisError::timeout(format!("peer '{}' did not answer within {:?}", peer, timeout))
        .with_info("peer", peer)
        .into()
}

fn panicked(peer: &str) -> ErrorInfo {
    TrellisError::internal(format!("call to peer '{}' panicked", peer)).into()
}

pub struct PeerFanout {
    source: Arc<dyn PeerSource>,
    client: Arc<dyn PeerClient>,
}

impl PeerFanout {
    pub fn new(source: Arc<dyn PeerSource>, client: Arc<dyn PeerClient>) -> Self {
        Self { source, client }
    }

    /// Call `op` on every peer of `identity`, each bounded by `timeout`.
    ///
    /// Only the peer set resolution can fail; peer failures arrive as
    /// `Err` items in the stream.
    pub fn call_peer_api(
        &self,
        network: &str,
        identity: &str,
        op: PeerOp,
        timeout: Duration,
    ) -> Result<PeerResults> {
        let peers = self.source.peers(network, identity)?;
        crate::metrics::record_fanout("api", peers.len());
        debug!(network, identity, method = %op.method, peers = peers.len(), "Fanout call");

        let op = Arc::new(op);
        Ok(self.spawn_all(peers, move |client, peer, tx| {
            let op = op.clone();
            async move {
                let name = peer.name.clone();
                let result = if !peer.is_online() {
                    Err(offline(&peer))
                } else {
                    let call = AssertUnwindSafe(tokio::time::timeout(timeout, client.call(&peer, &op)))
                        .catch_unwind()
                        .await;
                    match call {
                        Ok(Ok(Ok(value))) => Ok(value),
                        Ok(Ok(Err(e))) => Err(e.into()),
                        Ok(Err(_)) => Err(timed_out(&name, timeout)),
                        Err(_) => Err(panicked(&name)),
                    }
                };
                if result.is_err() {
                    crate::metrics::record_fanout_peer_error();
                }
                let _ = tx.send((name, result)).await;
            }
        }))
    }

    /// Streaming variant: every peer call is a stream, items from different
    /// peers interleave. A peer's stream ends when it completes, fails or
    /// reaches its own `timeout` deadline.
    pub fn call_peer_genr(
        &self,
        network: &str,
        identity: &str,
        op: PeerOp,
        timeout: Duration,
    ) -> Result<PeerResults> {
        let peers = self.source.peers(network, identity)?;
        crate::metrics::record_fanout("genr", peers.len());
        debug!(network, identity, method = %op.method, peers = peers.len(), "Fanout stream");

        let op = Arc::new(op);
        Ok(self.spawn_all(peers, move |client, peer, tx| {
            let op = op.clone();
            async move {
                let name = peer.name.clone();
                if !peer.is_online() {
                    crate::metrics::record_fanout_peer_error();
                    let _ = tx.send((name, Err(offline(&peer)))).await;
                    return;
                }
                let stream = AssertUnwindSafe(stream_peer(client, peer, op, timeout, tx.clone()))
                    .catch_unwind()
                    .await;
                if stream.is_err() {
                    crate::metrics::record_fanout_peer_error();
                    let _ = tx.send((name.clone(), Err(panicked(&name)))).await;
                }
            }
        }))
    }

    fn spawn_all<F, Fut>(&self, peers: Vec<ServiceRecord>, task: F) -> PeerResults
    where
        F: Fn(Arc<dyn PeerClient>, ServiceRecord, mpsc::Sender<PeerResult>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let mut tasks = JoinSet::new();
        let count = peers.len();
        for peer in peers {
            tasks.spawn(task(self.client.clone(), peer, tx.clone()));
        }
        PeerResults {
            rx,
            peers: count,
            _tasks: tasks,
        }
    }
}

async fn stream_peer(
    client: Arc<dyn PeerClient>,
    peer: ServiceRecord,
    op: Arc<PeerOp>,
    limit: Duration,
    tx: mpsc::Sender<PeerResult>,
) {
    let deadline = Instant::now() + limit;
    let name = peer.name.clone();

    let mut items = match timeout_at(deadline, client.stream(&peer, &op)).await {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => {
            crate::metrics::record_fanout_peer_error();
            let _ = tx.send((name, Err(e.into()))).await;
            return;
        }
        Err(_) => {
            crate::metrics::record_fanout_peer_error();
            let _ = tx.send((name.clone(), Err(timed_out(&name, limit)))).await;
            return;
        }
    };

    loop {
        let item = match timeout_at(deadline, items.next()).await {
            Ok(Some(Ok(value))) => Ok(value),
            Ok(Some(Err(e))) => Err(ErrorInfo::from(e)),
            Ok(None) => return,
            Err(_) => Err(timed_out(&name, limit)),
        };
        let last = item.is_err();
        if last {
            crate::metrics::record_fanout_peer_error();
        }
        if tx.send((name.clone(), item)).await.is_err() || last {
            return;
        }
    }
}

/// Collect a fanout into a vector, bounded by `limit`
pub async fn collect_within(results: PeerResults, limit: Duration) -> Result<Vec<PeerResult>> {
    timeout(limit, results.collect::<Vec<_>>())
        .await
        .map_err(|_| TrellisError::timeout(format!("fanout did not finish within {:?}", limit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trellis_common::{ErrorKind, UrlInfo};

    struct StaticPeers(Vec<ServiceRecord>);

    impl PeerSource for StaticPeers {
        fn peers(&self, _network: &str, identity: &str) -> Result<Vec<ServiceRecord>> {
            if identity == "db" {
                Ok(self.0.clone())
            } else {
                Err(TrellisError::not_found(identity.to_string()))
            }
        }
    }

    /// Answers from port 1, hangs on port 2, fails on port 3
    struct FakeClient {
        started: AtomicUsize,
        dropped: AtomicUsize,
    }

    /// Counts calls dropped before completion
    struct DropFlag<'a>(&'a AtomicUsize);

    impl Drop for DropFlag<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PeerClient for FakeClient {
        async fn call(&self, peer: &ServiceRecord, op: &PeerOp) -> Result<Value> {
            self.started.fetch_add(1, Ordering::SeqCst);
            match peer.urlinfo.port {
                1 => Ok(serde_json::json!({"peer": peer.name, "method": op.method})),
                2 => {
                    let flag = DropFlag(&self.dropped);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    std::mem::forget(flag);
                    Ok(Value::Null)
                }
                _ => Err(TrellisError::transport("connection refused")),
            }
        }

        async fn stream(
            &self,
            peer: &ServiceRecord,
            _op: &PeerOp,
        ) -> Result<BoxStream<'static, Result<Value>>> {
            match peer.urlinfo.port {
                1 => Ok(futures::stream::iter((0..3).map(|i| Ok(Value::from(i)))).boxed()),
                2 => Ok(futures::stream::iter(vec![Ok(Value::from(10))])
                    .chain(futures::stream::pending())
                    .boxed()),
                _ => Err(TrellisError::transport("connection refused")),
            }
        }
    }

    fn peer(name: &str, port: u16, online: bool) -> ServiceRecord {
        let mut record = ServiceRecord::new("example", name, UrlInfo::new("tcp", "h", port));
        record.cluster = Some("db".to_string());
        record.online = online.then(|| format!("{}-instance", name));
        record
    }

    fn fanout(peers: Vec<ServiceRecord>) -> (PeerFanout, Arc<FakeClient>) {
        let client = Arc::new(FakeClient {
            started: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        });
        (
            PeerFanout::new(Arc::new(StaticPeers(peers)), client.clone()),
            client,
        )
    }

    #[tokio::test]
    async fn test_one_reachable_one_unreachable() {
        let (fanout, _) = fanout(vec![peer("db.0", 1, true), peer("db.1", 2, true)]);
        let started = std::time::Instant::now();
        let results = fanout
            .call_peer_api("example", "db", PeerOp::new("status", Value::Null), Duration::from_millis(200))
            .unwrap();
        assert_eq!(results.peer_count(), 2);
        let results = collect_within(results, Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let ok: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
        let err: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(err.len(), 1);
        assert_eq!(ok[0].0, "db.0");
        assert_eq!(err[0].0, "db.1");
        assert_eq!(err[0].1.as_ref().unwrap_err().code, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_offline_and_failing_peers_reported() {
        let (fanout, client) = fanout(vec![
            peer("db.0", 1, true),
            peer("db.1", 1, false),
            peer("db.2", 3, true),
        ]);
        let mut results = collect_within(
            fanout
                .call_peer_api("example", "db", PeerOp::new("status", Value::Null), Duration::from_secs(1))
                .unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        results.sort_by(|a, b| a.0.cmp(&b.0));

        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1.as_ref().unwrap_err().code, ErrorKind::NotReady);
        assert_eq!(results[2].1.as_ref().unwrap_err().code, ErrorKind::Transport);
        // the offline peer is never called
        assert_eq!(client.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_identity_fails_upfront() {
        let (fanout, _) = fanout(vec![]);
        let err = fanout
            .call_peer_api("example", "web", PeerOp::new("status", Value::Null), Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_genr_preserves_per_peer_order() {
        let (fanout, _) = fanout(vec![peer("db.0", 1, true), peer("db.1", 2, true)]);
        let results = collect_within(
            fanout
                .call_peer_genr("example", "db", PeerOp::new("tail", Value::Null), Duration::from_millis(300))
                .unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let from_first: Vec<Value> = results
            .iter()
            .filter(|(name, _)| name == "db.0")
            .map(|(_, r)| r.clone().unwrap())
            .collect();
        assert_eq!(from_first, vec![Value::from(0), Value::from(1), Value::from(2)]);

        let from_second: Vec<_> = results.iter().filter(|(name, _)| name == "db.1").collect();
        assert_eq!(from_second.len(), 2);
        assert_eq!(from_second[0].1.clone().unwrap(), Value::from(10));
        assert_eq!(from_second[1].1.as_ref().unwrap_err().code, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_drop_cancels_outstanding_calls() {
        let (fanout, client) = fanout(vec![peer("db.1", 2, true)]);
        let results = fanout
            .call_peer_api("example", "db", PeerOp::new("status", Value::Null), Duration::from_secs(3600))
            .unwrap();
        while client.started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.dropped.load(Ordering::SeqCst), 0);

        drop(results);
        for _ in 0..100 {
            if client.dropped.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.dropped.load(Ordering::SeqCst), 1);
    }
}
