//! Provisioning tickets
//!
//! A ticket is a one-time bearer grant: issuing one appends it to the log,
//! redeeming or revoking it deletes it through the log, so at most one
//! redemption of an iden can ever succeed. Redemption hands back the
//! network CA certificate and a signing capability scoped to the ticket's
//! subject.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};
pub use trellis_common::api::{ProvisionUrl, Redemption};
use trellis_common::{
    CertRecord, DEFAULT_NETWORK, Result, Ticket, TicketKind, TrellisError, UrlInfo, now_millis,
    validate_name,
};
use trellis_consistency::RaftRequest;
use trellis_pki::{CertAuthority, SignConstraints, SigningCapability};

use crate::store::{RegistryStore, expect_doc, not_found, storage_error};

/// Length of a ticket iden in hex characters
pub const IDEN_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct ProvisionConfig {
    /// Public address of the provisioning listener
    pub listen: UrlInfo,
    /// Registry URLs handed to redeemers
    pub registry_urls: Vec<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            listen: UrlInfo::new("http", "127.0.0.1", 27492),
            registry_urls: Vec::new(),
        }
    }
}

pub struct Provisioner {
    store: Arc<RegistryStore>,
    ca: Arc<CertAuthority>,
    config: ProvisionConfig,
}

fn config_name(config: &Map<String, Value>) -> Option<&str> {
    config.get("name").and_then(Value::as_str)
}

impl Provisioner {
    pub fn new(store: Arc<RegistryStore>, ca: Arc<CertAuthority>, config: ProvisionConfig) -> Self {
        Self { store, ca, config }
    }

    pub fn authority(&self) -> &Arc<CertAuthority> {
        &self.ca
    }

    fn ticket_url(&self, iden: &str) -> String {
        format!(
            "{}://{}/{}",
            self.config.listen.scheme,
            self.config.listen.authority(),
            iden
        )
    }

    /// Issue a ticket and return its one-time URL.
    ///
    /// Clone tickets need `config.name`, the name of the new mirror, and an
    /// existing target. A target outside any cluster becomes the leader of
    /// a new cluster named after itself.
    pub async fn issue(
        &self,
        kind: TicketKind,
        network: Option<&str>,
        target: &str,
        config: Map<String, Value>,
        creator: &str,
    ) -> Result<ProvisionUrl> {
        let network = network.unwrap_or(DEFAULT_NETWORK);
        validate_name("network", network)?;
        validate_name(kind.as_str(), target)?;

        if kind == TicketKind::Clone {
            self.prepare_clone(network, target, &config).await?;
        }

        let ticket = Ticket {
            iden: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            network: network.to_string(),
            target: target.to_string(),
            config,
            creator: creator.to_string(),
            created: now_millis(),
        };
        let iden = ticket.iden.clone();
        self.store
            .submit(RaftRequest::TicketIssue { ticket })
            .await?
            .into_unit()?;

        crate::metrics::record_ticket_issued(kind.as_str());
        info!(%kind, network, target, creator, "Provisioning ticket issued");
        Ok(ProvisionUrl {
            url: self.ticket_url(&iden),
            iden,
            kind,
            network: network.to_string(),
        })
    }

    async fn prepare_clone(
        &self,
        network: &str,
        target: &str,
        config: &Map<String, Value>,
    ) -> Result<()> {
        let mirror = config_name(config)
            .ok_or_else(|| TrellisError::bad_argument("clone tickets require config.name"))?;
        validate_name("mirror", mirror)?;
        if mirror == target {
            return Err(TrellisError::bad_argument("a mirror cannot clone itself"));
        }
        if self.store.find_record(network, mirror)?.is_some() {
            return Err(TrellisError::already_exists(format!(
                "service '{}' already exists in network '{}'",
                mirror, network
            )));
        }

        let mut record = self
            .store
            .find_record(network, target)?
            .ok_or_else(|| not_found(network, target))?;
        if record.cluster.is_none() {
            record.cluster = Some(target.to_string());
            record.leader = Some(target.to_string());
            self.store.put_record(network, target, record).await?;
            info!(network, cluster = target, "Service promoted to cluster leader for cloning");
        }
        Ok(())
    }

    /// Redeem a ticket. The ticket is deleted through the log before any
    /// trust material is produced; a second redemption fails NotFound.
    pub async fn redeem(&self, iden: &str) -> Result<Redemption> {
        if iden.len() != IDEN_LEN || !iden.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TrellisError::bad_argument("malformed ticket iden"));
        }

        let ticket: Ticket = expect_doc(
            self.store
                .submit(RaftRequest::TicketRedeem {
                    iden: iden.to_string(),
                })
                .await?,
        )?;

        let Ticket {
            kind,
            network,
            target,
            mut config,
            ..
        } = ticket;

        let subject = match kind {
            TicketKind::Service | TicketKind::User => target.clone(),
            TicketKind::Clone => config_name(&config)
                .map(str::to_string)
                .ok_or_else(|| TrellisError::internal("clone ticket lost its mirror name"))?,
        };

        let ca_cert = self.ca.ca_cert_pem(&network).await?;
        let capability = self
            .ca
            .issue_capability(&network, &subject, kind.cert_kind())
            .await?;

        config.insert("name".to_string(), Value::from(subject.clone()));
        config.insert("network".to_string(), Value::from(network.clone()));
        config.insert(
            "registry".to_string(),
            Value::from(self.config.registry_urls.clone()),
        );
        if kind == TicketKind::Clone {
            let cluster = self
                .store
                .find_record(&network, &target)?
                .and_then(|r| r.cluster)
                .unwrap_or_else(|| target.clone());
            config.insert(
                "mirror".to_string(),
                Value::from(format!("trellis://{}.{}/", cluster, network)),
            );
            config.insert("cluster".to_string(), Value::from(cluster));
        }

        crate::metrics::record_ticket_redeemed(kind.as_str());
        info!(%kind, network = %network, subject = %subject, "Provisioning ticket redeemed");
        Ok(Redemption {
            kind,
            network,
            target,
            config,
            ca_cert,
            capability,
            token: None,
        })
    }

    pub async fn revoke(&self, iden: &str) -> Result<()> {
        let ticket: Ticket = expect_doc(
            self.store
                .submit(RaftRequest::TicketRevoke {
                    iden: iden.to_string(),
                })
                .await?,
        )?;
        info!(kind = %ticket.kind, target = %ticket.target, "Provisioning ticket revoked");
        Ok(())
    }

    pub fn list_tickets(&self, kind: Option<TicketKind>) -> Result<Vec<Ticket>> {
        self.store
            .reader()
            .list_tickets(kind)
            .map_err(storage_error)
    }

    /// Revoke every ticket, or every ticket of one kind
    pub async fn clear_tickets(&self, kind: Option<TicketKind>) -> Result<usize> {
        let cleared: usize =
            expect_doc(self.store.submit(RaftRequest::TicketClear { kind }).await?)?;
        if cleared > 0 {
            warn!(?kind, cleared, "Provisioning tickets cleared");
        }
        Ok(cleared)
    }

    /// Sign a CSR strictly for the capability's subject
    pub async fn sign(
        &self,
        capability: &SigningCapability,
        csr_pem: &str,
        sans: Vec<String>,
    ) -> Result<CertRecord> {
        self.ca
            .sign_with_capability(capability, csr_pem, &SignConstraints::with_sans(sans))
            .await
    }
}
