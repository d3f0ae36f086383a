//! Error types for Trellis
//!
//! This module defines:
//! - `ErrorKind`: the machine-readable error taxonomy
//! - `TrellisError`: typed error carrying a kind, a message and a structured info map
//! - `ErrorInfo`: the serializable error document returned over HTTP and by fanout

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine-readable error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    /// Transient: the target exists but has no live endpoint yet
    NotReady,
    /// A conflicting promotion or demotion is in progress
    Busy,
    Revoked,
    BadArgument,
    AuthDeny,
    Timeout,
    /// The local node is not the log leader
    NotLeader,
    BadCert,
    SchemaViolation,
    Transport,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::NotReady => "NotReady",
            ErrorKind::Busy => "Busy",
            ErrorKind::Revoked => "Revoked",
            ErrorKind::BadArgument => "BadArgument",
            ErrorKind::AuthDeny => "AuthDeny",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NotLeader => "NotLeader",
            ErrorKind::BadCert => "BadCert",
            ErrorKind::SchemaViolation => "SchemaViolation",
            ErrorKind::Transport => "Transport",
            ErrorKind::Storage => "Storage",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Errors a caller may retry without changing the request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotReady | ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::NotLeader
        )
    }

    /// HTTP status code for this kind
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::Busy => 409,
            ErrorKind::NotReady => 503,
            ErrorKind::Revoked | ErrorKind::AuthDeny | ErrorKind::BadCert => 403,
            ErrorKind::BadArgument | ErrorKind::SchemaViolation => 400,
            ErrorKind::Timeout => 408,
            ErrorKind::NotLeader => 421,
            ErrorKind::Transport => 502,
            ErrorKind::Storage | ErrorKind::Internal => 500,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Typed Trellis error
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct TrellisError {
    pub kind: ErrorKind,
    pub message: String,
    pub info: BTreeMap<String, Value>,
}

pub type Result<T> = std::result::Result<T, TrellisError>;

impl TrellisError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            info: BTreeMap::new(),
        }
    }

    /// Attach a structured detail to the error
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotReady, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn revoked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Revoked, message)
    }

    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArgument, message)
    }

    pub fn auth_deny(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthDeny, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn bad_cert(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadCert, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The local node cannot accept a mutation; `leader` is the address of
    /// the current log leader when one is known.
    pub fn not_leader(leader: Option<String>) -> Self {
        let err = Self::new(ErrorKind::NotLeader, "this node is not the registry leader");
        match leader {
            Some(addr) => err.with_info("leader", addr),
            None => err,
        }
    }

    /// Leader address carried by a NotLeader error
    pub fn leader_hint(&self) -> Option<&str> {
        if self.kind != ErrorKind::NotLeader {
            return None;
        }
        self.info.get("leader").and_then(Value::as_str)
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.kind,
            message: self.message.clone(),
            info: self.info.clone(),
        }
    }
}

impl From<serde_json::Error> for TrellisError {
    fn from(e: serde_json::Error) -> Self {
        TrellisError::new(ErrorKind::SchemaViolation, e.to_string())
    }
}

/// Serializable error document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, Value>,
}

impl From<TrellisError> for ErrorInfo {
    fn from(err: TrellisError) -> Self {
        ErrorInfo {
            code: err.kind,
            message: err.message,
            info: err.info,
        }
    }
}

impl From<ErrorInfo> for TrellisError {
    fn from(doc: ErrorInfo) -> Self {
        TrellisError {
            kind: doc.code,
            message: doc.message,
            info: doc.info,
        }
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
