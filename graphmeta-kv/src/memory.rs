//! In-memory KV engine
//!
//! Ordered map behind a `parking_lot` lock. Used for testing and for
//! single-process deployments; linearizability falls out of the lock.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use graphmeta_core::Result;
use parking_lot::RwLock;

use crate::store::{KvStats, KvStore};

/// In-memory ordered key/value store
pub struct MemoryKv {
    /// Key space, lexicographically ordered
    entries: RwLock<BTreeMap<Bytes, Bytes>>,

    /// Operation counters
    gets: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
    scans: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read();
        Ok(entries.get(key).cloned())
    }

    async fn multi_put(&self, pairs: Vec<(Bytes, Bytes)>) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        for (key, value) in pairs {
            entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, key: &[u8]) -> Result<()> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        entries.remove(key);
        Ok(())
    }

    async fn remove_range(&self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let doomed: Vec<Bytes> = entries
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn scan(&self, begin: &[u8], end: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn stats(&self) -> Result<KvStats> {
        let entries = self.entries.read();
        Ok(KvStats {
            key_count: entries.len() as u64,
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::put;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_put_get() {
        let kv = MemoryKv::new();
        put(&kv, b("k1"), b("v1")).await.unwrap();
        assert_eq!(kv.get(b"k1").await.unwrap(), Some(b("v1")));
        assert_eq!(kv.get(b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multi_put_is_batched() {
        let kv = MemoryKv::new();
        kv.multi_put(vec![(b("a"), b("1")), (b("b"), b("2")), (b("c"), b("3"))])
            .await
            .unwrap();
        let stats = kv.stats().await.unwrap();
        assert_eq!(stats.key_count, 3);
        assert_eq!(stats.puts, 1);
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_half_open() {
        let kv = MemoryKv::new();
        kv.multi_put(vec![(b("a"), b("1")), (b("c"), b("3")), (b("b"), b("2"))])
            .await
            .unwrap();

        let pairs = kv.scan(b"a", b"c").await.unwrap();
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref()]);
    }

    #[tokio::test]
    async fn test_remove_and_remove_range() {
        let kv = MemoryKv::new();
        kv.multi_put(vec![
            (b("p1"), b("x")),
            (b("p2"), b("x")),
            (b("p3"), b("x")),
            (b("q1"), b("x")),
        ])
        .await
        .unwrap();

        kv.remove(b"q1").await.unwrap();
        assert_eq!(kv.get(b"q1").await.unwrap(), None);

        kv.remove_range(b"p1", b"p3").await.unwrap();
        assert_eq!(kv.get(b"p1").await.unwrap(), None);
        assert_eq!(kv.get(b"p2").await.unwrap(), None);
        assert_eq!(kv.get(b"p3").await.unwrap(), Some(b("x")));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_key() {
        let kv = MemoryKv::new();
        put(&kv, b("k"), b("old")).await.unwrap();
        put(&kv, b("k"), b("new")).await.unwrap();
        assert_eq!(kv.get(b"k").await.unwrap(), Some(b("new")));
        assert_eq!(kv.stats().await.unwrap().key_count, 1);
    }
}
