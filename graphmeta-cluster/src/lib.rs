//! Cluster topology state for the graphmeta control plane.
//!
//! Two authoritative records live here, both materialized in the KV
//! substrate:
//! - The host registry: which storage nodes exist and when each last
//!   heartbeated. The active-host set is derived from heartbeat freshness.
//! - The allocation map: which hosts hold each partition's replicas.

pub mod allocation;
pub mod hosts;

// Re-export main types
pub use allocation::{AllocationMap, HostParts};
pub use hosts::{HostDirectory, HostInfo};
