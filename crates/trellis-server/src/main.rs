// Trellis registry node entry point

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use trellis_server::{
    AppState, Configuration, metrics,
    startup::{
        self, GracefulShutdown, init_logging, run_with_shutdown, wait_for_shutdown_signal,
    },
};

/// Time a fresh single-node cluster gets to elect itself
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let configuration = Configuration::new()?;
    let _logging_guard = init_logging(&configuration.logging_config())?;
    metrics::init_metrics();

    let app_state = Arc::new(AppState::build(configuration.clone()).await?);
    let node = app_state.node.clone();

    if configuration.raft_bootstrap() {
        node.bootstrap_single(BOOTSTRAP_TIMEOUT).await?;
        info!(node_id = node.node_id(), "Registry log bootstrapped");
    } else {
        info!(
            node_id = node.node_id(),
            "Waiting to be added to an existing registry cluster"
        );
    }

    let graceful_shutdown =
        GracefulShutdown::new(wait_for_shutdown_signal(), configuration.shutdown_timeout());

    let liveness = app_state.liveness.clone();
    tokio::spawn(run_with_shutdown(
        liveness.clone().start(),
        graceful_shutdown.signal().subscribe(),
    ));

    let server_address = configuration.server_address();
    let server_port = configuration.server_port();
    info!("Starting registry server on {}:{}", server_address, server_port);
    let main = startup::main_server(app_state.clone(), server_address, server_port)?;

    let provision_address = configuration.provision_address();
    let provision_port = configuration.provision_port();
    info!(
        "Starting provisioning listener on {}:{}",
        provision_address, provision_port
    );
    let provision = startup::provision_server(app_state.clone(), provision_address, provision_port)?;

    let main_handle = main.handle();
    let provision_handle = provision.handle();

    tokio::select! {
        result = async { tokio::try_join!(main, provision) } => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = graceful_shutdown.wait() => {
            info!("All servers shutting down gracefully");
        }
    }

    liveness.stop();
    graceful_shutdown
        .run_hook("HTTP listeners", async {
            tokio::join!(main_handle.stop(true), provision_handle.stop(true));
        })
        .await;
    graceful_shutdown
        .run_hook("Raft node", async {
            if let Err(e) = node.shutdown().await {
                error!("Raft shutdown failed: {}", e);
            }
        })
        .await;

    info!("Trellis server shutdown complete");
    Ok(())
}
