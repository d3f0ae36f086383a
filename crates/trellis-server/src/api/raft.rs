// Raft RPC endpoints and cluster management
// The RPC handlers answer with the serialized openraft Result, as the
// HTTP network layer of trellis-consistency expects.

use std::collections::{BTreeMap, BTreeSet};

use actix_web::{HttpRequest, HttpResponse, Scope, get, post, web};
use openraft::BasicNode;
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trellis_common::TrellisError;
use trellis_consistency::raft::network::RAFT_PATH;
use trellis_consistency::{NodeId, TypeConfig};

use crate::middleware::{Role, require};
use crate::model::ApiResult;
use crate::model::response::{ok, ok_empty};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
struct InitRequest {
    /// Initial voters, node id to address; empty means this node alone
    #[serde(default)]
    members: BTreeMap<NodeId, String>,
}

#[derive(Debug, Deserialize)]
struct LearnerRequest {
    node_id: NodeId,
    addr: String,
}

#[derive(Debug, Deserialize)]
struct MembershipRequest {
    members: BTreeSet<NodeId>,
}

#[derive(Debug, Serialize)]
struct NodeStatus {
    node_id: NodeId,
    addr: String,
    is_leader: bool,
    leader: Option<String>,
    term: u64,
    last_applied: Option<u64>,
    voters: Vec<NodeId>,
}

#[post("/append")]
async fn append(
    data: web::Data<AppState>,
    body: web::Json<AppendEntriesRequest<TypeConfig>>,
) -> HttpResponse {
    let res = data.node.raft().append_entries(body.into_inner()).await;
    HttpResponse::Ok().json(res)
}

#[post("/vote")]
async fn vote(data: web::Data<AppState>, body: web::Json<VoteRequest<NodeId>>) -> HttpResponse {
    debug!(candidate = ?body.vote, "Vote requested");
    let res = data.node.raft().vote(body.into_inner()).await;
    HttpResponse::Ok().json(res)
}

#[post("/snapshot")]
async fn snapshot(
    data: web::Data<AppState>,
    body: web::Json<InstallSnapshotRequest<TypeConfig>>,
) -> HttpResponse {
    let res = data.node.raft().install_snapshot(body.into_inner()).await;
    HttpResponse::Ok().json(res)
}

fn ensure_leader(data: &AppState) -> Result<(), TrellisError> {
    if data.node.is_leader() {
        Ok(())
    } else {
        Err(TrellisError::not_leader(data.node.leader_addr()))
    }
}

#[post("/init")]
async fn init(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: Option<web::Json<InitRequest>>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    let mut members: BTreeMap<NodeId, BasicNode> = body
        .map(|b| b.into_inner().members)
        .unwrap_or_default()
        .into_iter()
        .map(|(id, addr)| (id, BasicNode { addr }))
        .collect();
    if members.is_empty() {
        members.insert(
            data.node.node_id(),
            BasicNode {
                addr: data.node.addr().to_string(),
            },
        );
    }
    data.node.initialize(members).await?;
    ok_empty()
}

#[post("/learner")]
async fn add_learner(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: web::Json<LearnerRequest>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    ensure_leader(&data)?;
    let LearnerRequest { node_id, addr } = body.into_inner();
    info!(node_id, %addr, "Adding learner");
    data.node.add_learner(node_id, addr).await?;
    ok_empty()
}

#[post("/membership")]
async fn change_membership(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: web::Json<MembershipRequest>,
) -> ApiResult {
    require(&req, Role::Admin)?;
    ensure_leader(&data)?;
    if body.members.is_empty() {
        return Err(TrellisError::bad_argument("membership cannot be empty").into());
    }
    info!(members = ?body.members, "Changing membership");
    data.node.change_membership(body.into_inner().members).await?;
    ok_empty()
}

#[get("/metrics")]
async fn metrics(data: web::Data<AppState>) -> ApiResult {
    let node = &data.node;
    crate::metrics::record_raft_state(node);
    let raft_metrics = node.metrics();
    let voters = raft_metrics
        .membership_config
        .membership()
        .voter_ids()
        .collect();
    ok(NodeStatus {
        node_id: node.node_id(),
        addr: node.addr().to_string(),
        is_leader: node.is_leader(),
        leader: node.leader_addr(),
        term: node.current_term(),
        last_applied: node.last_applied_index(),
        voters,
    })
}

pub fn routes() -> Scope {
    web::scope(&format!("/{}", RAFT_PATH))
        .service(append)
        .service(vote)
        .service(snapshot)
        .service(init)
        .service(add_learner)
        .service(change_membership)
        .service(metrics)
}
