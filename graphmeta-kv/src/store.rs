//! KV store trait
//!
//! The contract the control plane requires of its durable substrate:
//! point get, atomic multi-key put, removes and ordered range scans, all
//! linearizable against each other. Keys are byte strings under total
//! lexicographic order.

use async_trait::async_trait;
use bytes::Bytes;
use graphmeta_core::Result;

/// Operation counters for a store
#[derive(Debug, Clone, Copy, Default)]
pub struct KvStats {
    /// Number of live keys
    pub key_count: u64,

    /// Number of get operations served
    pub gets: u64,

    /// Number of write batches applied
    pub puts: u64,

    /// Number of remove operations (single and ranged)
    pub removes: u64,

    /// Number of scans served
    pub scans: u64,
}

/// Async ordered key/value store
///
/// All implementations must be `Send + Sync`; every operation is
/// linearizable with respect to every other.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Point lookup.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Apply all pairs atomically: either every pair is visible or none is.
    async fn multi_put(&self, pairs: Vec<(Bytes, Bytes)>) -> Result<()>;

    /// Remove a single key. Removing an absent key is not an error.
    async fn remove(&self, key: &[u8]) -> Result<()>;

    /// Remove every key in `[begin, end)`.
    async fn remove_range(&self, begin: &[u8], end: &[u8]) -> Result<()>;

    /// Ordered snapshot of every pair in `[begin, end)`.
    async fn scan(&self, begin: &[u8], end: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Operation counters.
    async fn stats(&self) -> Result<KvStats>;
}

/// Convenience: single-pair put through the atomic batch path.
pub async fn put<S: KvStore + ?Sized>(store: &S, key: Bytes, value: Bytes) -> Result<()> {
    store.multi_put(vec![(key, value)]).await
}
