//! Durable key layout
//!
//! Every key written by the control plane starts with a one-byte type tag,
//! followed by fixed-width fields in network byte order. The layout is the
//! persistence contract: nothing else is written to the store.
//!
//! - `0x01 | space(4) | partition(4)`        partition peer set
//! - `0x02 | ip(4) | port(4)`                host registration / heartbeat
//! - `0x10 | plan_id(8)`                     balance plan header
//! - `0x11 | plan_id(8) | task_index(4)`     balance task record
//! - `0x20 | module(1) | name_len(2) | name` config item

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{HostAddr, PartitionId, PlanId, SpaceId};
use crate::value::ConfigModule;

pub const TAG_PARTITION: u8 = 0x01;
pub const TAG_HOST: u8 = 0x02;
pub const TAG_PLAN: u8 = 0x10;
pub const TAG_TASK: u8 = 0x11;
pub const TAG_CONFIG: u8 = 0x20;

/// Key of one partition's peer set.
pub fn partition_key(space: SpaceId, partition: PartitionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(TAG_PARTITION);
    buf.put_u32(space);
    buf.put_u32(partition);
    buf.freeze()
}

pub fn parse_partition_key(key: &[u8]) -> Option<(SpaceId, PartitionId)> {
    if key.len() != 9 || key[0] != TAG_PARTITION {
        return None;
    }
    let space = u32::from_be_bytes(key[1..5].try_into().ok()?);
    let partition = u32::from_be_bytes(key[5..9].try_into().ok()?);
    Some((space, partition))
}

/// Prefix covering every partition of one space.
pub fn partition_space_prefix(space: SpaceId) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(TAG_PARTITION);
    buf.put_u32(space);
    buf.freeze()
}

/// Prefix covering the allocation map of every space.
pub fn partition_prefix() -> Bytes {
    Bytes::from_static(&[TAG_PARTITION])
}

/// Key of one host registration record.
pub fn host_key(addr: HostAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(TAG_HOST);
    buf.put_slice(&addr.to_bytes());
    buf.freeze()
}

pub fn parse_host_key(key: &[u8]) -> Option<HostAddr> {
    if key.len() != 9 || key[0] != TAG_HOST {
        return None;
    }
    HostAddr::from_bytes(&key[1..])
}

pub fn host_prefix() -> Bytes {
    Bytes::from_static(&[TAG_HOST])
}

/// Key of one balance plan header.
pub fn plan_key(plan_id: PlanId) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(TAG_PLAN);
    buf.put_u64(plan_id);
    buf.freeze()
}

pub fn parse_plan_key(key: &[u8]) -> Option<PlanId> {
    if key.len() != 9 || key[0] != TAG_PLAN {
        return None;
    }
    Some(u64::from_be_bytes(key[1..9].try_into().ok()?))
}

pub fn plan_prefix() -> Bytes {
    Bytes::from_static(&[TAG_PLAN])
}

/// Key of one balance task record.
pub fn task_key(plan_id: PlanId, index: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_u8(TAG_TASK);
    buf.put_u64(plan_id);
    buf.put_u32(index);
    buf.freeze()
}

pub fn parse_task_key(key: &[u8]) -> Option<(PlanId, u32)> {
    if key.len() != 13 || key[0] != TAG_TASK {
        return None;
    }
    let plan_id = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let index = u32::from_be_bytes(key[9..13].try_into().ok()?);
    Some((plan_id, index))
}

/// Prefix covering every task of one plan.
pub fn task_plan_prefix(plan_id: PlanId) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(TAG_TASK);
    buf.put_u64(plan_id);
    buf.freeze()
}

pub fn task_prefix() -> Bytes {
    Bytes::from_static(&[TAG_TASK])
}

/// Key of one config item.
pub fn config_key(module: ConfigModule, name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + name.len());
    buf.put_u8(TAG_CONFIG);
    buf.put_u8(module.as_u8());
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
    buf.freeze()
}

pub fn parse_config_key(key: &[u8]) -> Option<(ConfigModule, String)> {
    if key.len() < 4 || key[0] != TAG_CONFIG {
        return None;
    }
    let module = ConfigModule::from_u8(key[1])?;
    let name_len = u16::from_be_bytes(key[2..4].try_into().ok()?) as usize;
    if key.len() != 4 + name_len {
        return None;
    }
    let name = std::str::from_utf8(&key[4..]).ok()?.to_string();
    Some((module, name))
}

pub fn config_prefix() -> Bytes {
    Bytes::from_static(&[TAG_CONFIG])
}

/// Exclusive upper bound for a prefix scan: the prefix with its last
/// non-0xff byte incremented. Control-plane prefixes never consist solely
/// of 0xff bytes, so this always yields a bound.
pub fn prefix_end(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Bytes::from(end);
        }
        end.pop();
    }
    // Unbounded; callers only pass tagged prefixes so this is unreachable
    // in practice, but a full-range bound keeps it total.
    Bytes::from_static(&[0xff])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_partition_key_roundtrip() {
        let key = partition_key(3, 17);
        assert_eq!(key[0], TAG_PARTITION);
        assert_eq!(parse_partition_key(&key), Some((3, 17)));
        assert!(parse_partition_key(&key[..5]).is_none());
    }

    #[test]
    fn test_partition_keys_sort_by_space_then_partition() {
        let a = partition_key(1, 200);
        let b = partition_key(2, 1);
        assert!(a < b);
    }

    #[test]
    fn test_host_key_roundtrip() {
        let addr = HostAddr::new(Ipv4Addr::new(192, 168, 1, 5), 44500);
        assert_eq!(parse_host_key(&host_key(addr)), Some(addr));
    }

    #[test]
    fn test_task_key_roundtrip() {
        let key = task_key(987654321, 4);
        assert_eq!(parse_task_key(&key), Some((987654321, 4)));
        assert!(key.starts_with(&task_plan_prefix(987654321)));
    }

    #[test]
    fn test_config_key_roundtrip() {
        let key = config_key(ConfigModule::Storage, "load_config_interval_secs");
        let (module, name) = parse_config_key(&key).unwrap();
        assert_eq!(module, ConfigModule::Storage);
        assert_eq!(name, "load_config_interval_secs");
    }

    #[test]
    fn test_config_key_rejects_truncated_name() {
        let key = config_key(ConfigModule::Graph, "abcdef");
        assert!(parse_config_key(&key[..key.len() - 1]).is_none());
    }

    #[test]
    fn test_prefix_end_bounds_scan() {
        let prefix = partition_space_prefix(7);
        let end = prefix_end(&prefix);
        let inside = partition_key(7, u32::MAX);
        let outside = partition_key(8, 0);
        assert!(inside < end);
        assert!(outside >= end);
    }

    #[test]
    fn test_prefix_end_carries_over_0xff() {
        assert_eq!(&prefix_end(&[0x01, 0xff])[..], &[0x02]);
    }
}
