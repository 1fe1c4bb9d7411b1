//! Admin client
//!
//! The administrative surface the balancer drives storage nodes through.
//! A partition move decomposes into leader transfer, learner add, catch-up,
//! membership change and removal; the task state machine issues one call
//! per step so every step can be checkpointed. Retries and timeouts are the
//! caller's responsibility.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::types::{HostAddr, PartitionId, SpaceId};
use parking_lot::Mutex;

/// Per-step administrative operations on storage nodes
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Move leadership for the partition off `src`.
    async fn transfer_leader(&self, space: SpaceId, partition: PartitionId, src: HostAddr)
        -> Result<()>;

    /// Create the partition's replica on `host`, optionally as a learner.
    async fn add_part(
        &self,
        space: SpaceId,
        partition: PartitionId,
        host: HostAddr,
        as_learner: bool,
    ) -> Result<()>;

    /// Attach `dst` to the replication group as a learner.
    async fn add_learner(&self, space: SpaceId, partition: PartitionId, dst: HostAddr)
        -> Result<()>;

    /// Block until `dst` has caught up with the group's data.
    async fn wait_caught_up(&self, space: SpaceId, partition: PartitionId, dst: HostAddr)
        -> Result<()>;

    /// Promote (`add = true`) or retire (`add = false`) `host` as a voting
    /// member of the replication group.
    async fn member_change(
        &self,
        space: SpaceId,
        partition: PartitionId,
        host: HostAddr,
        add: bool,
    ) -> Result<()>;

    /// Drop the partition's replica from `src`.
    async fn remove_part(&self, space: SpaceId, partition: PartitionId, src: HostAddr)
        -> Result<()>;
}

/// Kind of administrative step, for recording and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminOp {
    TransferLeader,
    AddPart,
    AddLearner,
    WaitCaughtUp,
    MemberChangeAdd,
    MemberChangeRemove,
    RemovePart,
}

/// One recorded administrative call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminCall {
    pub op: AdminOp,
    pub space: SpaceId,
    pub partition: PartitionId,
    pub host: HostAddr,
}

/// In-process admin client for tests
///
/// Records every call in order, optionally fails configured step kinds and
/// simulates per-call latency.
#[derive(Default)]
pub struct RecordingAdminClient {
    calls: Mutex<Vec<AdminCall>>,
    fail_ops: Mutex<HashSet<AdminOp>>,
    latency: Mutex<Option<Duration>>,
}

impl RecordingAdminClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail_on(&self, op: AdminOp) {
        self.fail_ops.lock().insert(op);
    }

    /// Simulate `latency` on every subsequent call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Calls recorded so far, in issue order.
    pub fn calls(&self) -> Vec<AdminCall> {
        self.calls.lock().clone()
    }

    /// Recorded calls touching one partition, in issue order.
    pub fn calls_for(&self, space: SpaceId, partition: PartitionId) -> Vec<AdminCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.space == space && c.partition == partition)
            .copied()
            .collect()
    }

    async fn record(
        &self,
        op: AdminOp,
        space: SpaceId,
        partition: PartitionId,
        host: HostAddr,
    ) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().push(AdminCall {
            op,
            space,
            partition,
            host,
        });
        if self.fail_ops.lock().contains(&op) {
            return Err(MetaError::Unknown(format!(
                "injected failure for {op:?} on {space}/{partition}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AdminClient for RecordingAdminClient {
    async fn transfer_leader(
        &self,
        space: SpaceId,
        partition: PartitionId,
        src: HostAddr,
    ) -> Result<()> {
        self.record(AdminOp::TransferLeader, space, partition, src).await
    }

    async fn add_part(
        &self,
        space: SpaceId,
        partition: PartitionId,
        host: HostAddr,
        _as_learner: bool,
    ) -> Result<()> {
        self.record(AdminOp::AddPart, space, partition, host).await
    }

    async fn add_learner(
        &self,
        space: SpaceId,
        partition: PartitionId,
        dst: HostAddr,
    ) -> Result<()> {
        self.record(AdminOp::AddLearner, space, partition, dst).await
    }

    async fn wait_caught_up(
        &self,
        space: SpaceId,
        partition: PartitionId,
        dst: HostAddr,
    ) -> Result<()> {
        self.record(AdminOp::WaitCaughtUp, space, partition, dst).await
    }

    async fn member_change(
        &self,
        space: SpaceId,
        partition: PartitionId,
        host: HostAddr,
        add: bool,
    ) -> Result<()> {
        let op = if add {
            AdminOp::MemberChangeAdd
        } else {
            AdminOp::MemberChangeRemove
        };
        self.record(op, space, partition, host).await
    }

    async fn remove_part(
        &self,
        space: SpaceId,
        partition: PartitionId,
        src: HostAddr,
    ) -> Result<()> {
        self.record(AdminOp::RemovePart, space, partition, src).await
    }
}
