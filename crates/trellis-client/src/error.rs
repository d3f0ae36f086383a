//! Client error types for the Trellis SDK

use trellis_common::{ErrorInfo, ErrorKind, TrellisError};

/// Error type for Trellis client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error document returned by a registry, or raised locally with the
    /// same taxonomy
    #[error(transparent)]
    Trellis(#[from] TrellisError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Taxonomy code of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Trellis(e) => e.kind,
            ClientError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            ClientError::Http(e) if e.is_decode() => ErrorKind::SchemaViolation,
            ClientError::Http(_) => ErrorKind::Transport,
            ClientError::Status { .. } => ErrorKind::Transport,
            ClientError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Worth retrying with backoff: the peer could not be reached or did
    /// not answer, as opposed to answering authoritatively
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }

    pub fn into_trellis(self) -> TrellisError {
        match self {
            ClientError::Trellis(e) => e,
            other => TrellisError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<ErrorInfo> for ClientError {
    fn from(doc: ErrorInfo) -> Self {
        ClientError::Trellis(doc.into())
    }
}
