// Raft consensus module for the Trellis registry
// Every registry mutation is a RaftRequest appended to the replicated log

pub mod config;
pub mod log_store;
pub mod network;
pub mod node;
pub mod reader;
pub mod request;
pub mod state_machine;
pub mod types;

// Re-export commonly used types
pub use config::RaftConfig;
pub use node::{RaftNode, RaftNodeBuilder};
pub use request::{RaftRequest, RaftResponse};
pub use types::{NodeId, Raft, RaftMetrics, ServerState, TypeConfig, calculate_node_id};
