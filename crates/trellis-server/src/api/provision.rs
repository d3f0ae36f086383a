// Provisioning listener: redeem a one-time URL, then sign a CSR with the
// capability it returned. Possession of the URL is the credential.

use actix_web::{HttpRequest, Scope, post, web};
use tracing::info;
use trellis_common::TicketKind;
use trellis_common::api::SignRequest;

use crate::middleware::Role;
use crate::model::ApiResult;
use crate::model::response::ok;
use crate::state::AppState;

#[post("/sign")]
async fn sign(data: web::Data<AppState>, body: web::Json<SignRequest>) -> ApiResult {
    let SignRequest {
        capability,
        csr,
        sans,
    } = body.into_inner();
    let cert = data.provisioner.sign(&capability, &csr, sans).await?;
    info!(network = %cert.network, subject = %cert.subject, serial = %cert.serial, "Certificate signed");
    ok(cert)
}

#[post("/{iden}")]
async fn redeem(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult {
    let peer = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();
    let mut redemption = data.provisioner.redeem(&path).await?;
    let role = match redemption.kind {
        TicketKind::User => Role::User,
        TicketKind::Service | TicketKind::Clone => Role::Service,
    };
    redemption.token = data
        .authenticator
        .as_ref()
        .map(|auth| auth.encode_scoped(redemption.name(), &redemption.network, role))
        .transpose()?;
    info!(%peer, kind = %redemption.kind, network = %redemption.network, target = %redemption.target, "Ticket redeemed");
    ok(redemption)
}

pub fn routes() -> Scope {
    // sign is registered first so it is not taken for a ticket iden
    web::scope("").service(sign).service(redeem)
}
