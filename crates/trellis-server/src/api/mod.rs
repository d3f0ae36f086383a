//! HTTP surfaces of the registry node
//!
//! - [`routes`]: the versioned admin and service API under `/api/v1`
//! - [`raft::routes`]: raft RPC and cluster management under `/raft`
//! - [`provision::routes`]: the provisioning listener, served on its own port

pub mod admin;
pub mod provision;
pub mod raft;
pub mod service;

use actix_web::{Scope, web};
use trellis_common::api::API_PREFIX;

pub fn routes() -> Scope {
    web::scope(API_PREFIX)
        // service surface
        .service(service::register)
        .service(service::heartbeat)
        .service(service::down)
        .service(service::resolve)
        // admin surface
        .service(admin::list_services)
        .service(admin::get_service)
        .service(admin::delete_service)
        .service(admin::issue_ticket)
        .service(admin::list_tickets)
        .service(admin::revoke_ticket)
        .service(admin::clear_tickets)
        .service(admin::promote)
        .service(admin::demote)
        .service(admin::cluster_state)
        .service(admin::list_pools)
        .service(admin::create_pool)
        .service(admin::get_pool)
        .service(admin::delete_pool)
        .service(admin::add_pool_member)
        .service(admin::del_pool_member)
        .service(admin::revoke_cert)
        .service(admin::validate_cert)
        .service(admin::list_revocations)
        .service(admin::fanout)
}
