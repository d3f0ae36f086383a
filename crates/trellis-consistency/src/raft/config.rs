// Raft configuration for the registry log

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the registry's Raft log
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Minimum election timeout in milliseconds (default: 1500ms);
    /// the maximum is twice this value
    pub election_timeout_ms: u64,

    /// Leader heartbeat interval in milliseconds (default: 300ms)
    pub heartbeat_interval_ms: u64,

    /// Number of applied entries between snapshots
    pub snapshot_threshold: u64,

    /// RPC request timeout in milliseconds (default: 3000ms)
    pub rpc_request_timeout_ms: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: u64,

    /// Data directory for Raft storage
    pub data_dir: PathBuf,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 1500,
            heartbeat_interval_ms: 300,
            snapshot_threshold: 5000,
            rpc_request_timeout_ms: 3000,
            max_payload_entries: 300,
            data_dir: PathBuf::from("./data/raft"),
        }
    }
}

impl RaftConfig {
    /// Config tuned for a single embedded node, used by tests and standalone mode
    pub fn standalone(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            election_timeout_ms: 150,
            heartbeat_interval_ms: 50,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_request_timeout_ms)
    }

    /// Get the log store directory
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Get the state machine directory
    pub fn state_machine_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Ensure all data directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.log_dir())?;
        std::fs::create_dir_all(self.state_machine_dir())?;
        Ok(())
    }

    /// Check timing relationships openraft relies on
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat interval must be positive".to_string());
        }
        if self.election_timeout_ms <= self.heartbeat_interval_ms {
            return Err(format!(
                "election timeout ({}ms) must exceed heartbeat interval ({}ms)",
                self.election_timeout_ms, self.heartbeat_interval_ms
            ));
        }
        if self.max_payload_entries == 0 {
            return Err("max payload entries must be positive".to_string());
        }
        Ok(())
    }

    /// Convert to openraft Config
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "trellis".to_string(),
            election_timeout_min: self.election_timeout_ms,
            election_timeout_max: self.election_timeout_ms * 2,
            heartbeat_interval: self.heartbeat_interval_ms,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_payload_entries: self.max_payload_entries,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout_ms, 1500);
        assert_eq!(config.heartbeat_interval_ms, 300);
        assert_eq!(config.max_payload_entries, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_standalone_config_is_valid() {
        let config = RaftConfig::standalone("/tmp/trellis");
        assert!(config.validate().is_ok());
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/trellis/logs"));
        assert_eq!(config.state_machine_dir(), PathBuf::from("/tmp/trellis/state"));
    }

    #[test]
    fn test_validate_rejects_inverted_timings() {
        let config = RaftConfig {
            election_timeout_ms: 100,
            heartbeat_interval_ms: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_openraft_config() {
        let config = RaftConfig::default();
        let raft_config = config.to_openraft_config();
        assert_eq!(raft_config.cluster_name, "trellis");
        assert_eq!(raft_config.election_timeout_min, 1500);
        assert_eq!(raft_config.election_timeout_max, 3000);
        assert_eq!(raft_config.heartbeat_interval, 300);
        assert!(raft_config.validate().is_ok());
    }
}
