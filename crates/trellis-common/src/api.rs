//! Request and response documents of the Trellis HTTP surfaces
//!
//! Shared by the server handlers and the HTTP clients so both sides agree
//! on one wire shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorInfo;
use crate::model::{SigningCapability, TicketKind, UrlInfo};

/// Prefix every versioned handler is mounted under
pub const API_PREFIX: &str = "/api/v1";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub urlinfo: UrlInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

/// Explicit loss of liveness; without an instance any session is ended
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DownRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Issue a provisioning ticket.
///
/// `target` is the service to enroll (service), the user (user) or the
/// service to mirror (clone). Clone tickets carry the mirror's name in
/// `config.name`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub target: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Promote a mirror, or demote a leader
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolMemberRequest {
    pub member: String,
}

/// Optional kind filter of ticket listings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TicketKind>,
}

/// A certificate in PEM form, to revoke or validate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertRequest {
    pub cert: String,
}

/// Call `method` on every peer of a service identity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanoutRequest {
    pub method: String,
    #[serde(default)]
    pub args: Value,
    /// Use the streaming call; every peer may answer several items
    #[serde(default)]
    pub stream: bool,
    /// Per-peer deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One answer of a fanout; exactly one of `value` and `error` is set
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerReply {
    pub peer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// One-time provisioning URL returned by the admin API
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvisionUrl {
    pub iden: String,
    pub kind: TicketKind,
    pub network: String,
    pub url: String,
}

/// Everything a redeemer needs to enroll
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    pub kind: TicketKind,
    pub network: String,
    pub target: String,
    pub config: Map<String, Value>,
    pub ca_cert: String,
    pub capability: SigningCapability,
    /// Bearer token bound to (network, name), minted by the provisioning
    /// listener when the registry enforces auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Redemption {
    /// Name the redeemer enrolls as
    pub fn name(&self) -> &str {
        self.config
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&self.target)
    }

    /// Registry URLs handed out with the ticket
    pub fn registry_urls(&self) -> Vec<String> {
        self.config
            .get("registry")
            .and_then(Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Leader address a clone follows
    pub fn mirror(&self) -> Option<&str> {
        self.config.get("mirror").and_then(Value::as_str)
    }
}

/// Have the network CA sign `csr` under a redeemed capability
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignRequest {
    pub capability: SigningCapability,
    pub csr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sans: Vec<String>,
}

/// Promotion state of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ClusterState {
    Normal { leader: Option<String> },
    Promoting { candidate: String },
    Demoting { leader: String },
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Normal { leader: Some(leader) } => write!(f, "normal (leader {})", leader),
            ClusterState::Normal { leader: None } => f.write_str("normal (no leader)"),
            ClusterState::Promoting { candidate } => write!(f, "promoting {}", candidate),
            ClusterState::Demoting { leader } => write!(f, "demoting {}", leader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_are_omitted() {
        let body = HeartbeatRequest {
            instance: "i-1".to_string(),
            ready: None,
        };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"instance":"i-1"}"#);

        let parsed: TopologyRequest = serde_json::from_str(r#"{"name":"db.1"}"#).unwrap();
        assert_eq!(parsed.name, "db.1");
        assert_eq!(parsed.graceful, None);
    }

    #[test]
    fn test_fanout_request_defaults() {
        let parsed: FanoutRequest = serde_json::from_str(r#"{"method":"status"}"#).unwrap();
        assert_eq!(parsed.args, Value::Null);
        assert!(!parsed.stream);
        assert!(parsed.timeout_ms.is_none());
    }

    #[test]
    fn test_provision_request_defaults_config() {
        let parsed: ProvisionRequest = serde_json::from_str(r#"{"target":"00.svc"}"#).unwrap();
        assert!(parsed.config.is_empty());
        assert!(parsed.network.is_none());
    }

    fn redemption(config: Value) -> Redemption {
        Redemption {
            kind: TicketKind::Clone,
            network: "example".to_string(),
            target: "db.0".to_string(),
            config: config.as_object().cloned().unwrap_or_default(),
            ca_cert: String::new(),
            capability: SigningCapability {
                network: "example".to_string(),
                subject: "db.1".to_string(),
                kind: crate::model::CertKind::Host,
                expires: 0,
                nonce: String::new(),
                mac: String::new(),
            },
            token: None,
        }
    }

    #[test]
    fn test_redemption_config_accessors() {
        let r = redemption(serde_json::json!({
            "name": "db.1",
            "registry": ["http://10.0.0.1:8848"],
            "mirror": "trellis://db.0.example/",
        }));
        assert_eq!(r.name(), "db.1");
        assert_eq!(r.registry_urls(), vec!["http://10.0.0.1:8848"]);
        assert_eq!(r.mirror(), Some("trellis://db.0.example/"));

        let bare = redemption(serde_json::json!({}));
        assert_eq!(bare.name(), "db.0");
        assert!(bare.registry_urls().is_empty());
        assert!(bare.mirror().is_none());
        assert!(!serde_json::to_string(&bare).unwrap().contains("token"));
    }
}
