//! Partition allocation map
//!
//! The authoritative mapping `(space, partition) -> peer set`, stored one
//! key per partition under `0x01 | space(4) | partition(4)`. The value is
//! the packed peer list, `ip(4) | port(4)` per host. Space descriptors are
//! not stored separately; the set of spaces is whatever the allocation map
//! mentions.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::keys;
use graphmeta_core::types::{HostAddr, PartitionId, SpaceId};
use tracing::debug;

use graphmeta_kv::store::put;
use graphmeta_kv::KvStore;

/// Per-host partition lists for one space, plus the replica total.
///
/// This is the balancer's working view: every host that holds at least one
/// partition appears, whether or not it is still alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostParts {
    pub parts: BTreeMap<HostAddr, Vec<PartitionId>>,
    /// Total number of replicas in the space (partition count x replica
    /// factor).
    pub total_parts: u32,
}

impl HostParts {
    /// Partition count currently attributed to `host`.
    pub fn count(&self, host: &HostAddr) -> usize {
        self.parts.get(host).map_or(0, Vec::len)
    }
}

pub fn encode_peers(peers: &[HostAddr]) -> Bytes {
    let mut buf = BytesMut::with_capacity(peers.len() * 8);
    for peer in peers {
        buf.put_slice(&peer.to_bytes());
    }
    buf.freeze()
}

pub fn decode_peers(raw: &[u8]) -> Result<Vec<HostAddr>> {
    if raw.len() % 8 != 0 {
        return Err(MetaError::StoreFailure(format!(
            "peer list of {} bytes",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .filter_map(HostAddr::from_bytes)
        .collect())
}

/// Allocation map access over the KV substrate
pub struct AllocationMap<S> {
    store: Arc<S>,
}

impl<S: KvStore> AllocationMap<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Peer set of one partition, or `None` if the partition is unknown.
    pub async fn peers(&self, space: SpaceId, partition: PartitionId) -> Result<Option<Vec<HostAddr>>> {
        let raw = self.store.get(&keys::partition_key(space, partition)).await?;
        raw.map(|v| decode_peers(&v)).transpose()
    }

    /// Overwrite one partition's peer set in a single atomic write.
    pub async fn set_peers(
        &self,
        space: SpaceId,
        partition: PartitionId,
        peers: &[HostAddr],
    ) -> Result<()> {
        put(
            &*self.store,
            keys::partition_key(space, partition),
            encode_peers(peers),
        )
        .await
    }

    /// Flip one peer set from `from` to `to` in a single atomic write.
    ///
    /// This is the balance task's commit point: readers observe either the
    /// old peer set or the new one, never an intermediate.
    pub async fn replace_peer(
        &self,
        space: SpaceId,
        partition: PartitionId,
        from: HostAddr,
        to: HostAddr,
    ) -> Result<()> {
        let peers = self
            .peers(space, partition)
            .await?
            .ok_or_else(|| MetaError::NotFound(format!("partition {space}/{partition}")))?;

        if peers.contains(&to) {
            return Err(MetaError::Existed(format!(
                "host {to} already holds partition {space}/{partition}"
            )));
        }
        let mut next: Vec<HostAddr> = peers.into_iter().filter(|p| *p != from).collect();
        next.push(to);

        debug!(space, partition, from = %from, to = %to, "flipping peer set");
        self.set_peers(space, partition, &next).await
    }

    /// Every partition of one space with its peer set.
    pub async fn space_parts(
        &self,
        space: SpaceId,
    ) -> Result<BTreeMap<PartitionId, Vec<HostAddr>>> {
        let prefix = keys::partition_space_prefix(space);
        let end = keys::prefix_end(&prefix);
        let pairs = self.store.scan(&prefix, &end).await?;

        let mut parts = BTreeMap::new();
        for (key, value) in pairs {
            let (_, partition) = keys::parse_partition_key(&key).ok_or_else(|| {
                MetaError::StoreFailure(format!("malformed partition key {}", hex::encode(&key)))
            })?;
            parts.insert(partition, decode_peers(&value)?);
        }
        Ok(parts)
    }

    /// Distinct space ids present in the allocation map, ascending.
    pub async fn spaces(&self) -> Result<Vec<SpaceId>> {
        let prefix = keys::partition_prefix();
        let end = keys::prefix_end(&prefix);
        let pairs = self.store.scan(&prefix, &end).await?;

        let mut spaces = Vec::new();
        for (key, _) in pairs {
            if let Some((space, _)) = keys::parse_partition_key(&key) {
                if spaces.last() != Some(&space) {
                    spaces.push(space);
                }
            }
        }
        Ok(spaces)
    }

    /// Materialize `host -> partitions` for one space, inactive hosts
    /// included, so losses are visible to the planner.
    pub async fn host_parts(&self, space: SpaceId) -> Result<HostParts> {
        let parts = self.space_parts(space).await?;

        let mut out = HostParts::default();
        for (partition, peers) in parts {
            for peer in peers {
                out.parts.entry(peer).or_default().push(partition);
                out.total_parts += 1;
            }
        }
        Ok(out)
    }
}
