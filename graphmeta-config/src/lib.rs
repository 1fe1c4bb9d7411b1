//! Dynamic configuration for the graphmeta control plane.
//!
//! Typed, per-module configuration items live in the metadata KV store;
//! participating processes declare the items that govern their runtime
//! flags, push the declarations once at startup, and poll for changes,
//! rebinding locally held variables when a value moves.
//!
//! - `store`: item CRUD and list-by-module over the KV substrate
//! - `manager`: node-side declarations, typed flag handles and the
//!   polling worker

pub mod manager;
pub mod store;

// Re-export main types
pub use manager::{
    BoolFlag, ConfigManager, ConfigSource, DoubleFlag, Int64Flag, StringFlag,
};
pub use store::{ConfigItem, ConfigStore};
