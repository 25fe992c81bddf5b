//! kvmd-cloud Protocol Buffers
//!
//! Generated protobuf code for the agent-facing cloud APIs.
//!
//! This crate contains:
//! - `HiveForAgent`: registration, proxy discovery and DNS record forwarding
//! - `ProxyForAgent`: the push events channel and per-connection data streams
//! - the shared `Event` schema used by both events channels

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod metadata;

/// kvmd-cloud v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("kvmd_cloud.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;
