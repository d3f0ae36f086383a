// Admin surface: records, provisioning tickets, topology, pools,
// certificates and peer fanout. Every handler demands the admin role.

use std::time::Duration;

use actix_web::{HttpRequest, delete, get, post, web};
use serde_json::json;
use tracing::info;
use trellis_common::api::{
    CertRequest, CreatePoolRequest, FanoutRequest, NetworkQuery, PeerReply, PoolMemberRequest,
    ProvisionRequest, TicketQuery, TopologyRequest,
};
use trellis_common::{ServiceRecord, TicketKind, TrellisError};
use trellis_registry::fanout::collect_within;
use trellis_registry::{PeerOp, PromoteOptions};

use crate::middleware::{Role, require};
use crate::model::ApiResult;
use crate::model::response::{ok, ok_empty};
use crate::state::AppState;

/// Slack granted to a whole fanout over its per-peer deadline
const FANOUT_SLACK: Duration = Duration::from_secs(1);

// ============== Records ==============

#[get("/services")]
pub async fn list_services(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<NetworkQuery>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let records = data
        .store
        .list_records(query.network.as_deref())?
        .collect::<anyhow::Result<Vec<ServiceRecord>>>()
        .map_err(|e| TrellisError::storage(e.to_string()))?;
    ok(records)
}

#[get("/services/{network}/{name}")]
pub async fn get_service(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let (network, name) = path.into_inner();
    ok(data.store.get_record(&network, &name)?)
}

#[delete("/services/{network}/{name}")]
pub async fn delete_service(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> ApiResult {
    let claims = require(&req, Role::Admin)?;
    let (network, name) = path.into_inner();
    data.store.del_record(&network, &name).await?;
    info!(%network, %name, by = %claims.sub, "Service deleted");
    ok_empty()
}

// ============== Provisioning ==============

#[post("/provision/{kind}")]
pub async fn issue_ticket(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ProvisionRequest>,
) -> ApiResult {
    let claims = require(&req, Role::Admin)?;
    let kind: TicketKind = path.parse()?;
    let ProvisionRequest {
        network,
        target,
        config,
    } = body.into_inner();
    let network = data.network_or_default(network.as_deref());

    let url = data
        .provisioner
        .issue(kind, Some(&network), &target, config, &claims.sub)
        .await?;
    ok(url)
}

#[get("/provision")]
pub async fn list_tickets(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<TicketQuery>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    ok(data.provisioner.list_tickets(query.kind)?)
}

#[delete("/provision/{iden}")]
pub async fn revoke_ticket(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    data.provisioner.revoke(&path).await?;
    ok_empty()
}

#[delete("/provision")]
pub async fn clear_tickets(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<TicketQuery>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let cleared = data.provisioner.clear_tickets(query.kind).await?;
    ok(json!({ "cleared": cleared }))
}

// ============== Topology ==============

fn promote_options(request: &TopologyRequest) -> PromoteOptions {
    let mut options = if request.graceful.unwrap_or(true) {
        PromoteOptions::default()
    } else {
        PromoteOptions::forced()
    };
    if let Some(ms) = request.timeout_ms {
        options.timeout = Duration::from_millis(ms);
    }
    options
}

#[post("/topology/promote")]
pub async fn promote(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: web::Json<TopologyRequest>,
) -> ApiResult {
    let claims = require(&req, Role::Admin)?;
    let network = data.network_or_default(body.network.as_deref());
    let options = promote_options(&body);
    info!(%network, candidate = %body.name, graceful = options.graceful, by = %claims.sub, "Promotion requested");
    ok(data.topology.promote(&network, &body.name, &options).await?)
}

#[post("/topology/demote")]
pub async fn demote(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: web::Json<TopologyRequest>,
) -> ApiResult {
    let claims = require(&req, Role::Admin)?;
    let network = data.network_or_default(body.network.as_deref());
    let options = promote_options(&body);
    info!(%network, leader = %body.name, by = %claims.sub, "Demotion requested");
    ok(data.topology.demote(&network, &body.name, &options).await?)
}

#[get("/topology/{network}/{cluster}")]
pub async fn cluster_state(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let (network, cluster) = path.into_inner();
    ok(data.topology.cluster_state(&network, &cluster)?)
}

// ============== Pools ==============

#[get("/pools/{network}")]
pub async fn list_pools(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    ok(data.pools.list_pools(&path)?)
}

#[post("/pools/{network}")]
pub async fn create_pool(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CreatePoolRequest>,
) -> ApiResult {
    let claims = require(&req, Role::Admin)?;
    ok(data.pools.create_pool(&path, &body.name, &claims.sub).await?)
}

#[get("/pools/{network}/{pool}")]
pub async fn get_pool(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let (network, pool) = path.into_inner();
    ok(data.pools.get_pool(&network, &pool)?)
}

#[delete("/pools/{network}/{pool}")]
pub async fn delete_pool(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let (network, pool) = path.into_inner();
    data.pools.del_pool(&network, &pool).await?;
    ok_empty()
}

#[post("/pools/{network}/{pool}/members")]
pub async fn add_pool_member(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<PoolMemberRequest>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let (network, pool) = path.into_inner();
    ok(data.pools.add_member(&network, &pool, &body.member).await?)
}

#[delete("/pools/{network}/{pool}/members/{member}")]
pub async fn del_pool_member(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let (network, pool, member) = path.into_inner();
    ok(data.pools.del_member(&network, &pool, &member).await?)
}

// ============== Certificates ==============

#[post("/certs/{network}/revoke")]
pub async fn revoke_cert(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CertRequest>,
) -> ApiResult {
    let claims = require(&req, Role::Admin)?;
    let revoked = data
        .provisioner
        .authority()
        .revoke(&path, &body.cert)
        .await?;
    info!(network = %path, fingerprint = %revoked.fingerprint, by = %claims.sub, "Certificate revoked");
    ok(revoked)
}

#[post("/certs/{network}/validate")]
pub async fn validate_cert(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CertRequest>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    ok(data
        .provisioner
        .authority()
        .validate(&path, &body.cert)
        .await?)
}

#[get("/certs/{network}/revocations")]
pub async fn list_revocations(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    ok(data.provisioner.authority().list_revocations(&path).await?)
}

// ============== Fanout ==============

#[post("/fanout/{network}/{identity}")]
pub async fn fanout(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<FanoutRequest>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let (network, identity) = path.into_inner();
    let FanoutRequest {
        method,
        args,
        stream,
        timeout_ms,
    } = body.into_inner();
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| data.configuration.peer_timeout());

    let op = PeerOp::new(method, args);
    let results = if stream {
        data.fanout.call_peer_genr(&network, &identity, op, timeout)?
    } else {
        data.fanout.call_peer_api(&network, &identity, op, timeout)?
    };
    let replies: Vec<PeerReply> = collect_within(results, timeout + FANOUT_SLACK)
        .await?
        .into_iter()
        .map(|(peer, result)| match result {
            Ok(value) => PeerReply {
                peer,
                value: Some(value),
                error: None,
            },
            Err(error) => PeerReply {
                peer,
                value: None,
                error: Some(error),
            },
        })
        .collect();
    ok(replies)
}
