// Registry data model
// Documents persisted by the state machine and returned over the admin surface

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TrellisError};

/// Reachability of a service endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UrlInfo {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path: String,
}

impl UrlInfo {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            path: String::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Parse `scheme://host:port/path`
    pub fn parse(input: &str) -> Result<Self> {
        let url = url::Url::parse(input)
            .map_err(|e| TrellisError::bad_argument(format!("invalid url '{}': {}", input, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| TrellisError::bad_argument(format!("url '{}' has no host", input)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TrellisError::bad_argument(format!("url '{}' has no port", input)))?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
            path: url.path().trim_start_matches('/').to_string(),
        })
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for UrlInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}",
            self.scheme,
            self.host,
            self.port,
            self.path.trim_start_matches('/')
        )
    }
}

/// A registered service instance, unique by (network, name)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub network: String,
    pub urlinfo: UrlInfo,
    /// Logical cluster alias shared by a leader and its mirrors
    #[serde(default)]
    pub cluster: Option<String>,
    /// Name of the authoritative member of the cluster, possibly `name` itself
    #[serde(default)]
    pub leader: Option<String>,
    /// Instance id of the live process, absent when offline
    #[serde(default)]
    pub online: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub created: i64,
}

impl ServiceRecord {
    pub fn new(network: impl Into<String>, name: impl Into<String>, urlinfo: UrlInfo) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
            urlinfo,
            cluster: None,
            leader: None,
            online: None,
            ready: false,
            creator: String::new(),
            created: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.is_some()
    }

    /// This record is the authoritative member of its cluster
    pub fn is_leader(&self) -> bool {
        self.leader.as_deref() == Some(self.name.as_str())
    }

    /// Identity used to group peers; a record without a cluster is its own group
    pub fn cluster_alias(&self) -> &str {
        self.cluster.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketKind {
    /// Join a new service to the registry
    Service,
    /// Enroll a user certificate
    User,
    /// Join a mirror of an existing service
    Clone,
}

impl TicketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketKind::Service => "service",
            TicketKind::User => "user",
            TicketKind::Clone => "clone",
        }
    }

    /// Certificate kind granted by redeeming a ticket of this kind
    pub fn cert_kind(&self) -> CertKind {
        match self {
            TicketKind::Service | TicketKind::Clone => CertKind::Host,
            TicketKind::User => CertKind::User,
        }
    }
}

impl Display for TicketKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TicketKind {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service" => Ok(TicketKind::Service),
            "user" => Ok(TicketKind::User),
            "clone" => Ok(TicketKind::Clone),
            other => Err(TrellisError::bad_argument(format!(
                "unknown ticket kind '{}'",
                other
            ))),
        }
    }
}

/// One-time provisioning ticket
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub iden: String,
    pub kind: TicketKind,
    pub network: String,
    /// Service or user name the ticket provisions; for clone tickets the
    /// service being mirrored
    pub target: String,
    /// Template configuration handed to the redeemer
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub created: i64,
}

/// Per-network certificate authority material
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaRecord {
    pub network: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// Hex-encoded HMAC key sealing signing capabilities
    pub cap_secret: String,
    pub created: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertKind {
    Host,
    User,
}

impl CertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertKind::Host => "host",
            CertKind::User => "user",
        }
    }
}

impl Display for CertKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sealed grant to have the network CA sign one subject.
///
/// Sealing and verification live with the CA; this is the wire document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigningCapability {
    pub network: String,
    pub subject: String,
    pub kind: CertKind,
    /// Expiry, ms since epoch
    pub expires: i64,
    pub nonce: String,
    /// Hex HMAC-SHA256 over the canonical fields
    pub mac: String,
}

/// An issued certificate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertRecord {
    pub network: String,
    pub kind: CertKind,
    pub subject: String,
    pub cert_pem: String,
    pub serial: String,
    /// SHA-256 of the DER encoding, hex
    pub fingerprint: String,
    pub issued: i64,
}

/// Revocation list entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevokedCert {
    pub network: String,
    pub fingerprint: String,
    pub serial: String,
    pub subject: String,
    pub revoked: i64,
}

/// Named, ordered group of service references
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub network: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub created: i64,
}

impl Pool {
    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlinfo_parse_and_display() {
        let url = UrlInfo::parse("https://10.0.0.7:9443/rpc").unwrap();
        assert_eq!(url.scheme, "https");
        assert_eq!(url.host, "10.0.0.7");
        assert_eq!(url.port, 9443);
        assert_eq!(url.path, "rpc");
        assert_eq!(url.to_string(), "https://10.0.0.7:9443/rpc");
        assert_eq!(url.authority(), "10.0.0.7:9443");
    }

    #[test]
    fn test_urlinfo_parse_known_default_port() {
        let url = UrlInfo::parse("http://registry.local/").unwrap();
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "");
    }

    #[test]
    fn test_urlinfo_rejects_garbage() {
        assert!(UrlInfo::parse("not a url").is_err());
    }

    #[test]
    fn test_record_leader_predicates() {
        let mut record = ServiceRecord::new("example", "db.0", UrlInfo::new("tcp", "h", 1));
        assert!(!record.is_leader());
        assert_eq!(record.cluster_alias(), "db.0");

        record.cluster = Some("db".to_string());
        record.leader = Some("db.0".to_string());
        assert!(record.is_leader());
        assert_eq!(record.cluster_alias(), "db");

        record.leader = Some("db.1".to_string());
        assert!(!record.is_leader());
    }

    #[test]
    fn test_ticket_kind_parse() {
        assert_eq!("clone".parse::<TicketKind>().unwrap(), TicketKind::Clone);
        assert_eq!(TicketKind::User.cert_kind(), CertKind::User);
        assert_eq!(TicketKind::Clone.cert_kind(), CertKind::Host);
        assert!("admin".parse::<TicketKind>().is_err());
    }

    #[test]
    fn test_record_deserialize_defaults() {
        let json = serde_json::json!({
            "name": "api",
            "network": "example",
            "urlinfo": {"scheme": "tcp", "host": "h", "port": 7},
        });
        let record: ServiceRecord = serde_json::from_value(json).unwrap();
        assert!(!record.ready);
        assert!(record.online.is_none());
        assert_eq!(record.urlinfo.path, "");
    }
}
