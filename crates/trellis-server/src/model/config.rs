//! Configuration management for the Trellis server
//!
//! Layers, lowest precedence first: `conf/trellis.yml`, `TRELLIS_*`
//! environment variables (`TRELLIS_RAFT__BOOTSTRAP=false` sets
//! `raft.bootstrap`), command line flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use trellis_common::{DEFAULT_NETWORK, UrlInfo};
use trellis_consistency::{RaftConfig, calculate_node_id};
use trellis_pki::CertPolicy;
use trellis_registry::ProvisionConfig;

use crate::startup::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/trellis.yml";
pub const DEFAULT_SERVER_PORT: u16 = 8848;
pub const DEFAULT_PROVISION_PORT: u16 = 27492;

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "trellis-server", version, about = "Trellis registry server")]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: String,
    #[arg(long = "node-id")]
    pub node_id: Option<u64>,
    /// Address other registry nodes reach this one at
    #[arg(long = "advertise")]
    pub advertise: Option<String>,
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<String>,
    /// Do not bootstrap a single-node cluster on first start
    #[arg(long = "join")]
    pub join: bool,
    #[arg(long = "jwt-secret", env = "TRELLIS_JWT_SECRET")]
    pub jwt_secret: Option<String>,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    /// Load from process arguments
    pub fn new() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(args: Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name(&args.config_file).required(false))
            .add_source(
                Environment::with_prefix("TRELLIS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(v) = args.node_id {
            builder = builder.set_override("node.id", v.to_string())?;
        }
        if let Some(v) = args.advertise {
            builder = builder.set_override("node.addr", v)?;
        }
        if let Some(v) = args.port {
            builder = builder.set_override("server.port", i64::from(v))?;
        }
        if let Some(v) = args.data_dir {
            builder = builder.set_override("data_dir", v)?;
        }
        if args.join {
            builder = builder.set_override("raft.bootstrap", false)?;
        }
        if let Some(v) = args.jwt_secret {
            builder = builder.set_override("auth.secret", v)?;
        }

        Ok(Self {
            config: builder.build()?,
        })
    }

    /// Build from an in-memory YAML document
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        Ok(Self { config })
    }

    fn uint(&self, key: &str, default: u64) -> u64 {
        self.config.get_int(key).map_or(default, |v| v.max(0) as u64)
    }

    fn millis(&self, key: &str, default: u64) -> Duration {
        Duration::from_millis(self.uint(key, default))
    }

    // ========================================================================
    // Server Configuration
    // ========================================================================

    pub fn server_address(&self) -> String {
        self.config
            .get_string("server.address")
            .unwrap_or("0.0.0.0".to_string())
    }

    pub fn server_port(&self) -> u16 {
        self.config
            .get_int("server.port")
            .unwrap_or(DEFAULT_SERVER_PORT.into()) as u16
    }

    /// Address peers and clients use to reach this node
    pub fn node_addr(&self) -> String {
        self.config
            .get_string("node.addr")
            .unwrap_or(format!("127.0.0.1:{}", self.server_port()))
    }

    pub fn node_id(&self) -> u64 {
        self.config
            .get_string("node.id")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| calculate_node_id(&self.node_addr()))
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(
            self.config
                .get_string("data_dir")
                .unwrap_or("data".to_string()),
        )
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.millis("server.shutdown_timeout_ms", 5000)
    }

    // ========================================================================
    // Registry Configuration
    // ========================================================================

    /// Networks known to this registry; the first is the default
    pub fn networks(&self) -> Vec<String> {
        self.config
            .get_array("registry.networks")
            .ok()
            .map(|values| {
                values
                    .into_iter()
                    .filter_map(|v| v.into_string().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|networks| !networks.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_NETWORK.to_string()])
    }

    pub fn default_network(&self) -> String {
        self.networks()
            .into_iter()
            .next()
            .unwrap_or(DEFAULT_NETWORK.to_string())
    }

    pub fn raft_config(&self) -> RaftConfig {
        let defaults = RaftConfig::default();
        RaftConfig {
            election_timeout_ms: self.uint("raft.election_timeout_ms", defaults.election_timeout_ms),
            heartbeat_interval_ms: self.uint("raft.heartbeat_interval_ms", defaults.heartbeat_interval_ms),
            snapshot_threshold: self.uint("raft.snapshot_threshold", defaults.snapshot_threshold),
            rpc_request_timeout_ms: self.uint("raft.rpc_timeout_ms", defaults.rpc_request_timeout_ms),
            max_payload_entries: defaults.max_payload_entries,
            data_dir: self.data_dir().join("raft"),
        }
    }

    /// Bootstrap a one-node cluster when the log is empty
    pub fn raft_bootstrap(&self) -> bool {
        self.config.get_bool("raft.bootstrap").unwrap_or(true)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.millis("registry.heartbeat_ttl_ms", 15_000)
    }

    pub fn heartbeat_scan_interval(&self) -> Duration {
        self.millis("registry.scan_interval_ms", 5_000)
    }

    /// Registry URLs handed to redeemers
    pub fn registry_urls(&self) -> Vec<String> {
        self.config
            .get_array("registry.urls")
            .ok()
            .map(|values| {
                values
                    .into_iter()
                    .filter_map(|v| v.into_string().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| vec![format!("http://{}", self.node_addr())])
    }

    /// Per-peer deadline of admin fanout and handover calls
    pub fn peer_timeout(&self) -> Duration {
        self.millis("peer.timeout_ms", 5_000)
    }

    // ========================================================================
    // Provisioning Configuration
    // ========================================================================

    pub fn provision_address(&self) -> String {
        self.config
            .get_string("provision.address")
            .unwrap_or(self.server_address())
    }

    pub fn provision_port(&self) -> u16 {
        self.config
            .get_int("provision.port")
            .unwrap_or(DEFAULT_PROVISION_PORT.into()) as u16
    }

    pub fn provision_config(&self) -> ProvisionConfig {
        let scheme = self
            .config
            .get_string("provision.scheme")
            .unwrap_or("http".to_string());
        let host = self.config.get_string("provision.public_host").unwrap_or_else(|_| {
            self.node_addr()
                .rsplit_once(':')
                .map_or("127.0.0.1".to_string(), |(host, _)| host.to_string())
        });
        ProvisionConfig {
            listen: UrlInfo::new(scheme, host, self.provision_port()),
            registry_urls: self.registry_urls(),
        }
    }

    // ========================================================================
    // PKI Configuration
    // ========================================================================

    pub fn cert_policy(&self) -> CertPolicy {
        let defaults = CertPolicy::default();
        CertPolicy {
            max_subject_len: self.uint("pki.max_subject_len", defaults.max_subject_len as u64) as usize,
            ca_validity: self
                .config
                .get_int("pki.ca_validity_days")
                .map_or(defaults.ca_validity, |d| Duration::from_secs(d as u64 * 86_400)),
            cert_validity: self
                .config
                .get_int("pki.cert_validity_days")
                .map_or(defaults.cert_validity, |d| Duration::from_secs(d as u64 * 86_400)),
            capability_ttl: self.millis(
                "pki.capability_ttl_ms",
                defaults.capability_ttl.as_millis() as u64,
            ),
        }
    }

    // ========================================================================
    // Auth Configuration
    // ========================================================================

    pub fn auth_enabled(&self) -> bool {
        self.config.get_bool("auth.enabled").unwrap_or(true)
    }

    /// Base64 HMAC secret of bearer tokens
    pub fn jwt_secret(&self) -> String {
        self.config.get_string("auth.secret").unwrap_or_default()
    }

    pub fn token_ttl_seconds(&self) -> i64 {
        self.config.get_int("auth.token_ttl_seconds").unwrap_or(18_000)
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logs.path").ok(),
            self.config.get_bool("logs.console").unwrap_or(true),
            self.config.get_bool("logs.file").unwrap_or(false),
            self.config
                .get_string("logs.level")
                .unwrap_or("info".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::from_yaml("{}").unwrap();
        assert_eq!(config.server_port(), DEFAULT_SERVER_PORT);
        assert_eq!(config.node_addr(), "127.0.0.1:8848");
        assert_eq!(config.networks(), vec![DEFAULT_NETWORK]);
        assert!(config.raft_bootstrap());
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(15));
        assert_eq!(config.registry_urls(), vec!["http://127.0.0.1:8848"]);
        assert_eq!(config.cert_policy().max_subject_len, 64);
        assert_eq!(config.provision_config().listen.authority(), "127.0.0.1:27492");
    }

    #[test]
    fn test_yaml_values() {
        let config = Configuration::from_yaml(
            r#"
node:
  id: 3
  addr: 10.0.0.3:9000
server:
  port: 9000
data_dir: /var/lib/trellis
registry:
  networks: [example, prod]
  heartbeat_ttl_ms: 3000
raft:
  bootstrap: false
  election_timeout_ms: 900
provision:
  scheme: https
  port: 27500
pki:
  max_subject_len: 32
"#,
        )
        .unwrap();
        assert_eq!(config.node_id(), 3);
        assert_eq!(config.default_network(), "example");
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(3));
        assert!(!config.raft_bootstrap());

        let raft = config.raft_config();
        assert_eq!(raft.election_timeout_ms, 900);
        assert_eq!(raft.data_dir, PathBuf::from("/var/lib/trellis/raft"));

        let provision = config.provision_config();
        assert_eq!(provision.listen.to_string(), "https://10.0.0.3:27500/");
        assert_eq!(provision.registry_urls, vec!["http://10.0.0.3:9000"]);
        assert_eq!(config.cert_policy().max_subject_len, 32);
    }

    #[test]
    fn test_node_id_derives_from_addr() {
        let config = Configuration::from_yaml("node:\n  addr: 10.0.0.1:8848\n").unwrap();
        assert_eq!(config.node_id(), calculate_node_id("10.0.0.1:8848"));
    }
}
