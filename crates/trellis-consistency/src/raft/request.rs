// Raft request and response types
// These are the registry commands that go through Raft consensus

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_common::{
    CaRecord, CertRecord, ErrorKind, Pool, RevokedCert, ServiceRecord, Ticket, TicketKind,
    TrellisError,
};

/// All operations that go through Raft consensus.
///
/// Commands carry every timestamp and generated value they need so that
/// applying them is deterministic on every replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RaftRequest {
    // ==================== Record Operations ====================
    /// Create or replace a service record
    RecordPut { record: ServiceRecord },

    /// Remove a service record
    RecordDelete { network: String, name: String },

    /// Mark a record online for a live instance
    RecordOnline {
        network: String,
        name: String,
        instance: String,
        ready: Option<bool>,
    },

    /// Clear the online marker; with `instance` set only that instance's
    /// marker is cleared
    RecordDown {
        network: String,
        name: String,
        instance: Option<String>,
    },

    /// Set the ready flag
    RecordReady {
        network: String,
        name: String,
        ready: bool,
    },

    /// Point every member of a cluster at a new leader
    ClusterLeader {
        network: String,
        cluster: String,
        leader: String,
    },

    // ==================== Ticket Operations ====================
    /// Store a freshly issued provisioning ticket
    TicketIssue { ticket: Ticket },

    /// Consume a ticket; fails NotFound if it was already consumed
    TicketRedeem { iden: String },

    /// Delete a ticket without redeeming it
    TicketRevoke { iden: String },

    /// Delete every ticket, optionally only of one kind
    TicketClear { kind: Option<TicketKind> },

    // ==================== CA Operations ====================
    /// Store a network's CA; the first committed CA wins
    CaPut { ca: CaRecord },

    /// Record an issued certificate
    CertIssue { cert: CertRecord },

    /// Append to a network's revocation list
    CertRevoke { revoked: RevokedCert },

    // ==================== Pool Operations ====================
    PoolCreate { pool: Pool },

    PoolDelete { network: String, name: String },

    PoolMemberAdd {
        network: String,
        pool: String,
        member: String,
    },

    PoolMemberDelete {
        network: String,
        pool: String,
        member: String,
    },
}

impl RaftRequest {
    /// Get the operation type name for logging
    pub fn op_type(&self) -> &'static str {
        match self {
            RaftRequest::RecordPut { .. } => "RecordPut",
            RaftRequest::RecordDelete { .. } => "RecordDelete",
            RaftRequest::RecordOnline { .. } => "RecordOnline",
            RaftRequest::RecordDown { .. } => "RecordDown",
            RaftRequest::RecordReady { .. } => "RecordReady",
            RaftRequest::ClusterLeader { .. } => "ClusterLeader",
            RaftRequest::TicketIssue { .. } => "TicketIssue",
            RaftRequest::TicketRedeem { .. } => "TicketRedeem",
            RaftRequest::TicketRevoke { .. } => "TicketRevoke",
            RaftRequest::TicketClear { .. } => "TicketClear",
            RaftRequest::CaPut { .. } => "CaPut",
            RaftRequest::CertIssue { .. } => "CertIssue",
            RaftRequest::CertRevoke { .. } => "CertRevoke",
            RaftRequest::PoolCreate { .. } => "PoolCreate",
            RaftRequest::PoolDelete { .. } => "PoolDelete",
            RaftRequest::PoolMemberAdd { .. } => "PoolMemberAdd",
            RaftRequest::PoolMemberDelete { .. } => "PoolMemberDelete",
        }
    }
}

/// Response from applying a command
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RaftResponse {
    /// Whether the operation succeeded
    pub success: bool,
    /// JSON-encoded result document
    pub data: Option<Vec<u8>>,
    /// Error or status message
    pub message: Option<String>,
    /// Error code when the state machine rejected the command
    pub error: Option<ErrorKind>,
}

impl RaftResponse {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn success_with_data(data: Vec<u8>) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    /// Successful response carrying a JSON document
    pub fn success_with<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(data) => Self::success_with_data(data),
            Err(e) => Self::failure(ErrorKind::Internal, format!("encode response: {}", e)),
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            error: Some(kind),
        }
    }

    /// Convert into a typed result, decoding the data document
    pub fn into_result<T: DeserializeOwned>(self) -> Result<Option<T>, TrellisError> {
        if !self.success {
            return Err(TrellisError::new(
                self.error.unwrap_or(ErrorKind::Internal),
                self.message.unwrap_or_else(|| "command rejected".to_string()),
            ));
        }
        match self.data {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| TrellisError::internal(format!("decode response: {}", e))),
            None => Ok(None),
        }
    }

    /// Convert into a result, ignoring any data document
    pub fn into_unit(self) -> Result<(), TrellisError> {
        self.into_result::<serde_json::Value>().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::UrlInfo;

    #[test]
    fn test_raft_request_serialization() {
        let req = RaftRequest::RecordPut {
            record: ServiceRecord::new("example", "api", UrlInfo::new("tcp", "10.0.0.1", 7000)),
        };

        let serialized = serde_json::to_string(&req).unwrap();
        let deserialized: RaftRequest = serde_json::from_str(&serialized).unwrap();

        assert_eq!(req.op_type(), deserialized.op_type());
    }

    #[test]
    fn test_raft_response_into_result() {
        let ok = RaftResponse::success_with(&serde_json::json!({"n": 3}));
        let value: Option<serde_json::Value> = ok.into_result().unwrap();
        assert_eq!(value.unwrap()["n"], 3);

        let failure = RaftResponse::failure(ErrorKind::NotFound, "ticket 'x' not found");
        let err = failure.into_unit().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "ticket 'x' not found");
    }

    #[test]
    fn test_raft_response_without_kind_is_internal() {
        let resp = RaftResponse {
            success: false,
            ..Default::default()
        };
        assert_eq!(resp.into_unit().unwrap_err().kind, ErrorKind::Internal);
    }
}
