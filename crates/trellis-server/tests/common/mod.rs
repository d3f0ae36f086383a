// Registry nodes served on real listeners

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use tempfile::TempDir;
use trellis_common::EventBus;
use trellis_consistency::{NodeId, RaftConfig, RaftNodeBuilder};
use trellis_server::middleware::Role;
use trellis_server::startup::{main_server, provision_server};
use trellis_server::{AppState, Configuration};

pub const SECRET: &str = "dHJlbGxpcy10ZXN0LXNlY3JldC0wMTIzNDU2Nzg5YWJjZGVm";

static NEXT_PORT: AtomicU16 = AtomicU16::new(42900);

pub struct TestNode {
    pub state: Arc<AppState>,
    /// Main listener, also the raft address
    pub addr: String,
    pub provision_addr: String,
    _dir: TempDir,
}

impl TestNode {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn admin_token(&self) -> String {
        self.state
            .authenticator
            .as_ref()
            .unwrap()
            .encode("root", Role::Admin)
            .unwrap()
    }
}

/// Open a raft node that has not joined any cluster and serve both of
/// its listeners
pub async fn spawn_node(node_id: NodeId) -> TestNode {
    let dir = TempDir::new().unwrap();
    let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    let provision_port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    let addr = format!("127.0.0.1:{port}");
    let configuration = Configuration::from_yaml(&format!(
        "node:\n  addr: {addr}\nprovision:\n  port: {provision_port}\nregistry:\n  networks: [example]\nauth:\n  secret: {SECRET}\n"
    ))
    .unwrap();

    let events = EventBus::default();
    let node = RaftNodeBuilder::new()
        .node_id(node_id)
        .addr(addr.clone())
        .config(RaftConfig::standalone(dir.path()))
        .events(events.clone())
        .build()
        .await
        .unwrap();
    let state = Arc::new(AppState::assemble(configuration, Arc::new(node), events).unwrap());

    actix_rt::spawn(main_server(state.clone(), "127.0.0.1".to_string(), port).unwrap());
    actix_rt::spawn(
        provision_server(state.clone(), "127.0.0.1".to_string(), provision_port).unwrap(),
    );

    TestNode {
        state,
        addr,
        provision_addr: format!("127.0.0.1:{provision_port}"),
        _dir: dir,
    }
}
