//! Key/value substrate for the graphmeta control plane.
//!
//! The control plane keeps all durable state (cluster topology, balance
//! plans, config items) in an ordered key/value store. This crate defines
//! the contract the rest of graphmeta consumes and ships `MemoryKv`, an
//! in-process engine used by tests and embedded deployments.

pub mod memory;
pub mod store;

// Re-export main types
pub use memory::MemoryKv;
pub use store::{KvStats, KvStore};
