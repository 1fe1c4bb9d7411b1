//! Host registry and heartbeat bookkeeping
//!
//! Each storage node is registered under `0x02 | ip(4) | port(4)` with its
//! last heartbeat as the value (8 bytes, little-endian nanoseconds since
//! epoch). A host is active when its heartbeat is within the liveness
//! window; the active set is the balancer's read-only input.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::keys;
use graphmeta_core::types::HostAddr;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use graphmeta_kv::store::put;
use graphmeta_kv::KvStore;

/// A registered host and its last heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub addr: HostAddr,
    /// Nanoseconds since epoch of the most recent heartbeat
    pub last_heartbeat_ns: u64,
}

impl HostInfo {
    /// Whether the host counts as live at `now_ns`.
    pub fn is_active(&self, now_ns: u64, window: Duration) -> bool {
        now_ns.saturating_sub(self.last_heartbeat_ns) <= window.as_nanos() as u64
    }
}

fn encode_heartbeat(ts_ns: u64) -> Bytes {
    Bytes::copy_from_slice(&ts_ns.to_le_bytes())
}

fn decode_heartbeat(raw: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| MetaError::StoreFailure(format!("host record of {} bytes", raw.len())))?;
    Ok(u64::from_le_bytes(arr))
}

/// Registry of storage nodes over the KV substrate
pub struct HostDirectory<S> {
    store: Arc<S>,
}

impl<S: KvStore> HostDirectory<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Register a host, stamping its first heartbeat. Re-registering an
    /// existing host just refreshes the heartbeat.
    pub async fn register(&self, addr: HostAddr, now_ns: u64) -> Result<()> {
        debug!(host = %addr, "registering host");
        put(&*self.store, keys::host_key(addr), encode_heartbeat(now_ns)).await
    }

    /// Refresh a registered host's heartbeat.
    pub async fn heartbeat(&self, addr: HostAddr, now_ns: u64) -> Result<()> {
        let key = keys::host_key(addr);
        if self.store.get(&key).await?.is_none() {
            warn!(host = %addr, "heartbeat from unregistered host");
            return Err(MetaError::NotFound(format!("host {addr}")));
        }
        put(&*self.store, key, encode_heartbeat(now_ns)).await
    }

    /// Every registered host, ordered by address.
    pub async fn list_hosts(&self) -> Result<Vec<HostInfo>> {
        let prefix = keys::host_prefix();
        let end = keys::prefix_end(&prefix);
        let pairs = self.store.scan(&prefix, &end).await?;

        let mut hosts = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let addr = keys::parse_host_key(&key).ok_or_else(|| {
                MetaError::StoreFailure(format!("malformed host key {}", hex::encode(&key)))
            })?;
            hosts.push(HostInfo {
                addr,
                last_heartbeat_ns: decode_heartbeat(&value)?,
            });
        }
        Ok(hosts)
    }

    /// Hosts whose heartbeat at `now_ns` is within `window`, ordered by
    /// address.
    pub async fn active_hosts(&self, now_ns: u64, window: Duration) -> Result<Vec<HostAddr>> {
        let hosts = self.list_hosts().await?;
        Ok(hosts
            .into_iter()
            .filter(|h| h.is_active(now_ns, window))
            .map(|h| h.addr)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphmeta_kv::MemoryKv;
    use std::net::Ipv4Addr;

    fn addr(last: u8, port: u32) -> HostAddr {
        HostAddr::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    const SEC: u64 = 1_000_000_000;

    #[tokio::test]
    async fn test_register_and_list() {
        let dir = HostDirectory::new(Arc::new(MemoryKv::new()));
        dir.register(addr(2, 9779), 5 * SEC).await.unwrap();
        dir.register(addr(1, 9779), 7 * SEC).await.unwrap();

        let hosts = dir.list_hosts().await.unwrap();
        assert_eq!(hosts.len(), 2);
        // Scan order is address order.
        assert_eq!(hosts[0].addr, addr(1, 9779));
        assert_eq!(hosts[0].last_heartbeat_ns, 7 * SEC);
        assert_eq!(hosts[1].addr, addr(2, 9779));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let dir = HostDirectory::new(Arc::new(MemoryKv::new()));
        let err = dir.heartbeat(addr(1, 9779), SEC).await.unwrap_err();
        assert!(matches!(err, MetaError::NotFound(_)));

        dir.register(addr(1, 9779), SEC).await.unwrap();
        dir.heartbeat(addr(1, 9779), 2 * SEC).await.unwrap();
        let hosts = dir.list_hosts().await.unwrap();
        assert_eq!(hosts[0].last_heartbeat_ns, 2 * SEC);
    }

    #[tokio::test]
    async fn test_active_hosts_filters_stale() {
        let dir = HostDirectory::new(Arc::new(MemoryKv::new()));
        dir.register(addr(1, 9779), 10 * SEC).await.unwrap();
        dir.register(addr(2, 9779), 100 * SEC).await.unwrap();

        let window = Duration::from_secs(30);
        let active = dir.active_hosts(110 * SEC, window).await.unwrap();
        assert_eq!(active, vec![addr(2, 9779)]);

        // Both fresh when the clock sits just past the earlier beat.
        let active = dir.active_hosts(11 * SEC, window).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn test_heartbeat_value_is_little_endian() {
        let raw = encode_heartbeat(0x0102_0304_0506_0708);
        assert_eq!(&raw[..], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(decode_heartbeat(&raw).unwrap(), 0x0102_0304_0506_0708);
    }
}
