//! Error taxonomy for graphmeta
//!
//! Every control-plane operation resolves to `Ok(_)` or one of the variants
//! below. Components translate substrate failures into these directly and
//! never swallow one.

use thiserror::Error;

use crate::types::{PartitionId, SpaceId};

/// Result type alias for graphmeta operations
pub type Result<T> = std::result::Result<T, MetaError>;

/// Unified error type for the graphmeta control plane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Existed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("kv leader changed")]
    LeaderChanged,

    #[error("kv store failure: {0}")]
    StoreFailure(String),

    #[error("a balance plan is already running")]
    BalancerRunning,

    #[error("no valid host for partition {partition} of space {space}")]
    NoValidHost {
        space: SpaceId,
        partition: PartitionId,
    },

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MetaError {
    /// True for errors raised by the KV substrate rather than the caller.
    pub fn is_store_error(&self) -> bool {
        matches!(self, MetaError::LeaderChanged | MetaError::StoreFailure(_))
    }
}
