//! Trellis Client - Rust SDK for Trellis services
//!
//! This crate provides:
//! - The resolver turning `trellis://` addresses into shared, leader-following connections
//! - HTTP client with bearer auth, failover and leader redirects
//! - Enrollment through one-time provisioning URLs
//! - Typed admin and service API client

pub mod admin;
pub mod enroll;
pub mod error;
pub mod http;
pub mod lookup;
pub mod model;
pub mod resolver;

pub use admin::AdminClient;
pub use enroll::{EnrollClient, Enrollment};
pub use error::{ClientError, Result};
pub use http::{HttpClientConfig, TrellisHttpClient};
pub use lookup::{HttpRecordLookup, RecordLookup};
pub use model::{ClusterState, ProvisionUrl, Redemption, SignRequest};
pub use resolver::{Connector, Endpoint, Lease, Resolver, RetryPolicy};
