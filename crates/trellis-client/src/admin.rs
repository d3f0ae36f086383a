//! Admin and service API client
//!
//! Typed methods for every registry endpoint.

use serde_json::{Map, Value};
use trellis_common::api::{
    API_PREFIX, CertRequest, CreatePoolRequest, DownRequest, FanoutRequest, HeartbeatRequest,
    NetworkQuery, PeerReply, PoolMemberRequest, ProvisionRequest, RegisterRequest, TicketQuery,
    TopologyRequest,
};
use trellis_common::{Pool, RevokedCert, ServiceRecord, Ticket, TicketKind, UrlInfo};

use crate::error::Result;
use crate::http::TrellisHttpClient;
use crate::model::{ClearedTickets, ClusterState, ProvisionUrl};

pub struct AdminClient {
    http_client: TrellisHttpClient,
}

impl AdminClient {
    pub fn new(http_client: TrellisHttpClient) -> Self {
        Self { http_client }
    }

    pub fn http_client(&self) -> &TrellisHttpClient {
        &self.http_client
    }

    // ============== Service APIs ==============

    pub async fn list_services(&self, network: Option<&str>) -> Result<Vec<ServiceRecord>> {
        self.http_client
            .get_with_query(
                &format!("{}/services", API_PREFIX),
                &NetworkQuery {
                    network: network.map(str::to_string),
                },
            )
            .await
    }

    pub async fn get_service(&self, network: &str, name: &str) -> Result<ServiceRecord> {
        self.http_client
            .get(&format!("{}/services/{}/{}", API_PREFIX, network, name))
            .await
    }

    pub async fn delete_service(&self, network: &str, name: &str) -> Result<()> {
        let _: Value = self
            .http_client
            .delete(&format!("{}/services/{}/{}", API_PREFIX, network, name))
            .await?;
        Ok(())
    }

    pub async fn register(
        &self,
        network: &str,
        name: &str,
        urlinfo: UrlInfo,
        cluster: Option<String>,
    ) -> Result<ServiceRecord> {
        self.http_client
            .put_json(
                &format!("{}/services/{}/{}", API_PREFIX, network, name),
                &RegisterRequest { urlinfo, cluster },
            )
            .await
    }

    pub async fn heartbeat(
        &self,
        network: &str,
        name: &str,
        instance: &str,
        ready: Option<bool>,
    ) -> Result<ServiceRecord> {
        self.http_client
            .post_json(
                &format!("{}/services/{}/{}/heartbeat", API_PREFIX, network, name),
                &HeartbeatRequest {
                    instance: instance.to_string(),
                    ready,
                },
            )
            .await
    }

    /// Explicitly end a session
    pub async fn mark_down(
        &self,
        network: &str,
        name: &str,
        instance: Option<&str>,
    ) -> Result<ServiceRecord> {
        self.http_client
            .post_json(
                &format!("{}/services/{}/{}/down", API_PREFIX, network, name),
                &DownRequest {
                    instance: instance.map(str::to_string),
                },
            )
            .await
    }

    pub async fn resolve(&self, network: &str, name: &str) -> Result<ServiceRecord> {
        self.http_client
            .get(&format!("{}/resolve/{}/{}", API_PREFIX, network, name))
            .await
    }

    // ============== Provisioning APIs ==============

    pub async fn provision(
        &self,
        kind: TicketKind,
        network: Option<&str>,
        target: &str,
        config: Map<String, Value>,
    ) -> Result<ProvisionUrl> {
        self.http_client
            .post_json(
                &format!("{}/provision/{}", API_PREFIX, kind),
                &ProvisionRequest {
                    network: network.map(str::to_string),
                    target: target.to_string(),
                    config,
                },
            )
            .await
    }

    /// Ticket for a mirror named `name` of `target`
    pub async fn provision_clone(
        &self,
        network: Option<&str>,
        target: &str,
        name: &str,
    ) -> Result<ProvisionUrl> {
        let mut config = Map::new();
        config.insert("name".to_string(), Value::from(name));
        self.provision(TicketKind::Clone, network, target, config).await
    }

    pub async fn list_tickets(&self, kind: Option<TicketKind>) -> Result<Vec<Ticket>> {
        self.http_client
            .get_with_query(&format!("{}/provision", API_PREFIX), &TicketQuery { kind })
            .await
    }

    pub async fn revoke_ticket(&self, iden: &str) -> Result<()> {
        let _: Value = self
            .http_client
            .delete(&format!("{}/provision/{}", API_PREFIX, iden))
            .await?;
        Ok(())
    }

    pub async fn clear_tickets(&self, kind: Option<TicketKind>) -> Result<usize> {
        let path = match kind {
            Some(kind) => format!("{}/provision?kind={}", API_PREFIX, kind),
            None => format!("{}/provision", API_PREFIX),
        };
        let cleared: ClearedTickets = self.http_client.delete(&path).await?;
        Ok(cleared.cleared)
    }

    // ============== Topology APIs ==============

    pub async fn promote(&self, request: &TopologyRequest) -> Result<ServiceRecord> {
        self.http_client
            .post_json(&format!("{}/topology/promote", API_PREFIX), request)
            .await
    }

    pub async fn demote(&self, request: &TopologyRequest) -> Result<ServiceRecord> {
        self.http_client
            .post_json(&format!("{}/topology/demote", API_PREFIX), request)
            .await
    }

    pub async fn cluster_state(&self, network: &str, cluster: &str) -> Result<ClusterState> {
        self.http_client
            .get(&format!("{}/topology/{}/{}", API_PREFIX, network, cluster))
            .await
    }

    // ============== Pool APIs ==============

    pub async fn create_pool(&self, network: &str, name: &str) -> Result<Pool> {
        self.http_client
            .post_json(
                &format!("{}/pools/{}", API_PREFIX, network),
                &CreatePoolRequest {
                    name: name.to_string(),
                },
            )
            .await
    }

    pub async fn delete_pool(&self, network: &str, name: &str) -> Result<()> {
        let _: Value = self
            .http_client
            .delete(&format!("{}/pools/{}/{}", API_PREFIX, network, name))
            .await?;
        Ok(())
    }

    pub async fn get_pool(&self, network: &str, name: &str) -> Result<Pool> {
        self.http_client
            .get(&format!("{}/pools/{}/{}", API_PREFIX, network, name))
            .await
    }

    pub async fn list_pools(&self, network: &str) -> Result<Vec<Pool>> {
        self.http_client
            .get(&format!("{}/pools/{}", API_PREFIX, network))
            .await
    }

    pub async fn add_pool_member(&self, network: &str, pool: &str, member: &str) -> Result<Pool> {
        self.http_client
            .post_json(
                &format!("{}/pools/{}/{}/members", API_PREFIX, network, pool),
                &PoolMemberRequest {
                    member: member.to_string(),
                },
            )
            .await
    }

    pub async fn del_pool_member(&self, network: &str, pool: &str, member: &str) -> Result<Pool> {
        self.http_client
            .delete(&format!(
                "{}/pools/{}/{}/members/{}",
                API_PREFIX, network, pool, member
            ))
            .await
    }

    // ============== Certificate APIs ==============

    pub async fn revoke_cert(&self, network: &str, cert_pem: &str) -> Result<RevokedCert> {
        self.http_client
            .post_json(
                &format!("{}/certs/{}/revoke", API_PREFIX, network),
                &CertRequest {
                    cert: cert_pem.to_string(),
                },
            )
            .await
    }

    pub async fn validate_cert(&self, network: &str, cert_pem: &str) -> Result<Value> {
        self.http_client
            .post_json(
                &format!("{}/certs/{}/validate", API_PREFIX, network),
                &CertRequest {
                    cert: cert_pem.to_string(),
                },
            )
            .await
    }

    // ============== Fanout APIs ==============

    /// Call a method on every peer of `identity`; one reply per answer
    pub async fn fanout(
        &self,
        network: &str,
        identity: &str,
        request: &FanoutRequest,
    ) -> Result<Vec<PeerReply>> {
        self.http_client
            .post_json(
                &format!("{}/fanout/{}/{}", API_PREFIX, network, identity),
                request,
            )
            .await
    }

    pub async fn list_revocations(&self, network: &str) -> Result<Vec<RevokedCert>> {
        self.http_client
            .get(&format!("{}/certs/{}/revocations", API_PREFIX, network))
            .await
    }
}
