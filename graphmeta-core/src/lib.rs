//! Core types for the graphmeta control plane.
//!
//! This crate carries everything the other graphmeta crates agree on:
//! - Cluster ids and the host address type
//! - The unified error taxonomy returned by every control-plane operation
//! - The durable key layout written to the metadata KV store
//! - The typed configuration value codec

pub mod error;
pub mod keys;
pub mod time;
pub mod types;
pub mod value;

// Re-export main types
pub use error::{MetaError, Result};
pub use types::{HostAddr, PartitionId, PlanId, SpaceId};
pub use value::{ConfigMode, ConfigModule, ConfigType, ConfigValue};
