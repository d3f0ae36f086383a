//! Trellis Server - registry node
//!
//! This crate provides:
//! - Layered configuration and per-component logging
//! - Bearer token authentication for the admin and service surfaces
//! - HTTP handlers over the registry, provisioning, topology and pool services
//! - Raft RPC endpoints and the HTTP transport to consuming services

pub mod api;
pub mod metrics;
pub mod middleware;
pub mod model;
pub mod peer;
pub mod startup;
pub mod state;

pub use model::Configuration;
pub use state::AppState;
