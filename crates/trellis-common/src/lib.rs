//! Trellis Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Trellis components:
//! - HTTP request bodies shared by server and clients
//! - Error taxonomy and the structured error document
//! - Registry data model (service records, tickets, CA material, pools)
//! - Name validation and symbolic address parsing
//! - Topic-keyed event bus for registry notifications

pub mod api;
pub mod error;
pub mod event;
pub mod model;
pub mod naming;

// Re-exports for convenience
pub use error::{ErrorInfo, ErrorKind, Result, TrellisError};
pub use event::{
    EventBus, PoolEvent, PoolEventKind, RecordEvent, RecordEventKind, RegistryEvent, Subscription,
    Topic,
};
pub use model::{
    CaRecord, CertKind, CertRecord, Pool, RevokedCert, ServiceRecord, SigningCapability, Ticket,
    TicketKind, UrlInfo,
};
pub use naming::{Address, SymbolicAddr, parse_address, validate_name};

/// Network used when an address or request does not name one
pub const DEFAULT_NETWORK: &str = "default";

/// Scheme of symbolic addresses resolved through the registry
pub const TRELLIS_SCHEME: &str = "trellis";

/// Separator between key segments in persisted column families
pub const KEY_SEPARATOR: &str = "@@";

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
