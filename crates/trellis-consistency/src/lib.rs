//! Trellis Consistency - Replicated registry log
//!
//! This crate provides:
//! - Raft node lifecycle on top of openraft
//! - RocksDB log storage
//! - The registry state machine applying commands in log order
//! - A read-only reader over the state machine's column families
//! - HTTP transport for raft RPC between registry nodes

#![allow(clippy::result_large_err)]

pub mod raft;

// Re-export commonly used types
pub use raft::types::*;

// Re-export reader and state machine
pub use raft::reader::{RecordCursor, RocksDbReader};
pub use raft::state_machine::RocksStateMachine;

// Re-export Raft node, config and commands
pub use raft::config::RaftConfig;
pub use raft::node::{RaftNode, RaftNodeBuilder};
pub use raft::request::{RaftRequest, RaftResponse};
