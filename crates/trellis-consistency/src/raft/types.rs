// openraft type configuration of the registry log

use std::io::Cursor;

use super::request::{RaftRequest, RaftResponse};

pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = RaftRequest,
        R = RaftResponse,
        NodeId = NodeId,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

pub type Raft = openraft::Raft<TypeConfig>;

/// One registry command as stored in the log
pub type Entry = openraft::Entry<TypeConfig>;

pub type LogId = openraft::LogId<NodeId>;

pub type StoredMembership = openraft::StoredMembership<NodeId, openraft::BasicNode>;

pub type RaftMetrics = openraft::RaftMetrics<NodeId, openraft::BasicNode>;

pub type ServerState = openraft::ServerState;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Node id derived from the node's raft address.
///
/// FNV-1a keeps the id identical across builds and restarts, so a node that
/// keeps its address keeps its membership slot.
pub fn calculate_node_id(addr: &str) -> NodeId {
    addr.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}
