//! Liveness monitor
//!
//! Heartbeats set a record online (and ready when reported). A service
//! whose heartbeat is older than the TTL is marked down by a background
//! scan on the registry leader; `ready` is left as it was until the record
//! is explicitly removed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use trellis_common::{Result, ServiceRecord, TrellisError, now_millis};

use crate::store::RegistryStore;

/// Key for tracking service heartbeats
type ServiceKey = (String, String);

#[derive(Clone, Debug)]
struct Beat {
    instance: String,
    last_seen: i64,
}

pub struct LivenessMonitor {
    store: Arc<RegistryStore>,
    ttl: Duration,
    scan_interval: Duration,
    beats: DashMap<ServiceKey, Beat>,
    running: AtomicBool,
}

impl LivenessMonitor {
    pub fn new(store: Arc<RegistryStore>, ttl: Duration, scan_interval: Duration) -> Self {
        Self {
            store,
            ttl,
            scan_interval,
            beats: DashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a heartbeat. The log is only written when the online
    /// instance or readiness changes.
    pub async fn heartbeat(
        &self,
        network: &str,
        name: &str,
        instance: &str,
        ready: Option<bool>,
    ) -> Result<ServiceRecord> {
        if !self.store.is_leader() {
            return Err(TrellisError::not_leader(self.store.node().leader_addr()));
        }
        crate::metrics::record_heartbeat();

        let record = self.store.get_record(network, name)?;
        self.beats.insert(
            (network.to_string(), name.to_string()),
            Beat {
                instance: instance.to_string(),
                last_seen: now_millis(),
            },
        );

        let unchanged = record.online.as_deref() == Some(instance)
            && ready.is_none_or(|r| r == record.ready);
        if unchanged {
            return Ok(record);
        }
        let record = self.store.set_online(network, name, instance, ready).await?;
        info!(network, name, instance, ready = record.ready, "Service online");
        Ok(record)
    }

    /// Explicit loss of liveness, typically a closed session
    pub async fn mark_down(
        &self,
        network: &str,
        name: &str,
        instance: Option<&str>,
    ) -> Result<ServiceRecord> {
        let key = (network.to_string(), name.to_string());
        self.beats
            .remove_if(&key, |_, beat| instance.is_none_or(|i| i == beat.instance));
        let record = self.store.set_down(network, name, instance).await?;
        info!(network, name, ?instance, "Service down");
        Ok(record)
    }

    /// Start tracking records that are online but have no heartbeat entry,
    /// as after a registry leader change
    fn adopt_untracked(&self, now: i64) -> Result<()> {
        for record in self.store.list_records(None)? {
            let record = record.map_err(crate::store::storage_error)?;
            let Some(instance) = record.online else {
                continue;
            };
            self.beats
                .entry((record.network, record.name))
                .or_insert(Beat {
                    instance,
                    last_seen: now,
                });
        }
        Ok(())
    }

    /// Mark down every service whose heartbeat is older than the TTL;
    /// returns how many were marked down
    pub async fn expire_stale(&self) -> Result<usize> {
        if !self.store.is_leader() {
            return Ok(0);
        }
        let now = now_millis();
        self.adopt_untracked(now)?;

        let ttl = self.ttl.as_millis() as i64;
        let expired: Vec<(ServiceKey, Beat)> = self
            .beats
            .iter()
            .filter(|entry| now - entry.last_seen > ttl)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut count = 0;
        for ((network, name), beat) in expired {
            warn!(
                "Heartbeat expired for {}/{}: last seen {}ms ago, ttl={}ms",
                network,
                name,
                now - beat.last_seen,
                ttl
            );
            // a newer heartbeat may have landed since the scan
            let removed = self
                .beats
                .remove_if(&(network.clone(), name.clone()), |_, b| {
                    b.last_seen == beat.last_seen
                });
            if removed.is_none() {
                continue;
            }
            match self.store.set_down(&network, &name, Some(&beat.instance)).await {
                Ok(_) => {
                    crate::metrics::record_heartbeat_expired();
                    count += 1;
                }
                Err(e) => debug!(network, name, error = %e, "Could not mark expired service down"),
            }
        }
        Ok(count)
    }

    /// Run the expiry scan until [`LivenessMonitor::stop`] is called
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Liveness monitor already running");
            return;
        }
        info!(ttl = ?self.ttl, "Liveness monitor started");

        let mut interval = tokio::time::interval(self.scan_interval);
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if let Err(e) = self.expire_stale().await {
                warn!(error = %e, "Liveness scan failed");
            }
        }
        info!("Liveness monitor stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::single_node_store;
    use trellis_common::{ErrorKind, RecordEventKind, RegistryEvent, UrlInfo};

    async fn monitor(ttl: Duration) -> (Arc<LivenessMonitor>, Arc<RegistryStore>, tempfile::TempDir) {
        let (store, dir) = single_node_store().await;
        store
            .register("example", "00.svc", UrlInfo::new("tcp", "h", 1), None, "admin")
            .await
            .unwrap();
        let monitor = Arc::new(LivenessMonitor::new(store.clone(), ttl, Duration::from_millis(20)));
        (monitor, store, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_heartbeat_sets_online_and_ready() {
        let (monitor, store, _dir) = monitor(Duration::from_secs(60)).await;
        let record = monitor
            .heartbeat("example", "00.svc", "i-1", Some(true))
            .await
            .unwrap();
        assert_eq!(record.online.as_deref(), Some("i-1"));
        assert!(record.ready);

        let applied = store.node().last_applied_index();
        monitor.heartbeat("example", "00.svc", "i-1", None).await.unwrap();
        assert_eq!(store.node().last_applied_index(), applied);

        let err = monitor.heartbeat("example", "01.svc", "i-1", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_down_keeps_ready() {
        let (monitor, store, _dir) = monitor(Duration::from_secs(60)).await;
        monitor.heartbeat("example", "00.svc", "i-1", Some(true)).await.unwrap();
        let mut sub = store.subscribe("example");

        let stale = monitor
            .mark_down("example", "00.svc", Some("i-0"))
            .await
            .unwrap();
        assert!(stale.is_online());

        let record = monitor
            .mark_down("example", "00.svc", Some("i-1"))
            .await
            .unwrap();
        assert!(record.online.is_none());
        assert!(record.ready);
        match sub.recv().await {
            Some(RegistryEvent::Record(event)) => assert_eq!(event.kind, RecordEventKind::Down),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ttl_expiry_marks_down() {
        let (monitor, store, _dir) = monitor(Duration::from_millis(100)).await;
        monitor.heartbeat("example", "00.svc", "i-1", Some(true)).await.unwrap();
        assert_eq!(monitor.expire_stale().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(monitor.expire_stale().await.unwrap(), 1);
        let record = store.get_record("example", "00.svc").unwrap();
        assert!(record.online.is_none());
        assert!(record.ready);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_untracked_online_records_get_a_grace_period() {
        let (monitor, store, _dir) = monitor(Duration::from_millis(100)).await;
        store.set_online("example", "00.svc", "i-1", None).await.unwrap();

        assert_eq!(monitor.expire_stale().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(monitor.expire_stale().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_scan() {
        let (monitor, store, _dir) = monitor(Duration::from_millis(50)).await;
        monitor.heartbeat("example", "00.svc", "i-1", None).await.unwrap();
        let task = tokio::spawn(monitor.clone().start());

        let mut down = false;
        for _ in 0..100 {
            if !store.get_record("example", "00.svc").unwrap().is_online() {
                down = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        monitor.stop();
        task.await.unwrap();
        assert!(down);
    }
}
