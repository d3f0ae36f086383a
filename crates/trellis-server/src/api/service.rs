// Service surface: self-registration, heartbeats and resolution.
// A service token only acts on the record named by its network and subject.

use actix_web::{HttpRequest, get, post, put, web};
use tracing::debug;
use trellis_common::api::{DownRequest, HeartbeatRequest, RegisterRequest};

use crate::middleware::{Role, require, require_self_or_admin};
use crate::model::ApiResult;
use crate::model::response::ok;
use crate::state::AppState;

#[put("/services/{network}/{name}")]
pub async fn register(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<RegisterRequest>,
) -> ApiResult {
    let (network, name) = path.into_inner();
    let claims = require_self_or_admin(&req, &network, &name)?;
    let RegisterRequest { urlinfo, cluster } = body.into_inner();

    let record = data
        .store
        .register(&network, &name, urlinfo, cluster, &claims.sub)
        .await?;
    ok(record)
}

#[post("/services/{network}/{name}/heartbeat")]
pub async fn heartbeat(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<HeartbeatRequest>,
) -> ApiResult {
    let (network, name) = path.into_inner();
    require_self_or_admin(&req, &network, &name)?;

    let record = data
        .liveness
        .heartbeat(&network, &name, &body.instance, body.ready)
        .await?;
    ok(record)
}

#[post("/services/{network}/{name}/down")]
pub async fn down(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<DownRequest>,
) -> ApiResult {
    let (network, name) = path.into_inner();
    require_self_or_admin(&req, &network, &name)?;

    let record = data
        .liveness
        .mark_down(&network, &name, body.instance.as_deref())
        .await?;
    ok(record)
}

/// Resolve a name or cluster alias to the record currently answering it,
/// as of the latest committed write
#[get("/resolve/{network}/{name}")]
pub async fn resolve(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> ApiResult {
    require(&req, Role::User)?;
    let (network, name) = path.into_inner();
    // followers answer NotLeader so a resolution never lags a promotion
    data.node.linearizable_read().await?;
    let record = data.store.resolve_record(&network, &name)?;
    debug!(%network, %name, resolved = %record.name, "Resolved");
    ok(record)
}
