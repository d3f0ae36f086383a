//! Trellis PKI - Per-network certificate authority
//!
//! This crate provides:
//! - Lazy CA creation per network, persisted through a [`CaStorage`]
//! - CSR signing for host and user certificates under a [`CertPolicy`]
//! - Revocation lists and certificate validation
//! - Signing capabilities scoped to one subject

pub mod authority;
pub mod capability;
pub mod policy;
pub mod storage;
pub mod x509;

pub use authority::CertAuthority;
pub use capability::CapabilitySeal;
pub use trellis_common::SigningCapability;
pub use policy::{CertPolicy, SignConstraints};
pub use storage::{CaStorage, MemoryCaStorage};
pub use x509::{CertInfo, CsrInfo, build_csr};
