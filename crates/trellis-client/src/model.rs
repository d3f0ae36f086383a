//! Response documents of the Trellis HTTP surfaces

use serde::{Deserialize, Serialize};

pub use trellis_common::api::{ClusterState, ProvisionUrl, Redemption, SignRequest};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClearedTickets {
    pub cleared: usize,
}
