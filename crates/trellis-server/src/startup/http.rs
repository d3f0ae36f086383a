//! HTTP server setup for the main and provisioning listeners.

use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, web};

use crate::{
    api,
    middleware::{Authentication, TracingMiddleware},
    model::response::json_error_handler,
    state::AppState,
};

/// Largest accepted request body; raft snapshots travel through it
const MAX_JSON_PAYLOAD: usize = 64 * 1024 * 1024;

/// Creates and binds the main HTTP server.
///
/// Serves the admin and service API under `/api/v1` and raft RPC under
/// `/raft`, all behind bearer authentication.
pub fn main_server(
    app_state: Arc<AppState>,
    address: String,
    port: u16,
) -> Result<Server, std::io::Error> {
    let authenticator = app_state.authenticator.clone();
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Authentication::new(authenticator.clone()))
            .wrap(TracingMiddleware)
            .app_data(web::Data::from(app_state.clone()))
            .app_data(
                web::JsonConfig::default()
                    .limit(MAX_JSON_PAYLOAD)
                    .error_handler(json_error_handler),
            )
            .service(api::routes())
            .service(api::raft::routes())
    })
    .disable_signals()
    .bind((address, port))?
    .run())
}

/// Creates and binds the provisioning listener.
///
/// Unauthenticated: a one-time URL is its own credential.
pub fn provision_server(
    app_state: Arc<AppState>,
    address: String,
    port: u16,
) -> Result<Server, std::io::Error> {
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(TracingMiddleware)
            .app_data(web::Data::from(app_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .service(api::provision::routes())
    })
    .disable_signals()
    .bind((address, port))?
    .run())
}
