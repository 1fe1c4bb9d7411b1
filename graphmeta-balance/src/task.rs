//! Balance task
//!
//! One atomic partition move `(space, partition, src -> dst)` expressed as
//! a forward-only state machine. Every state names the side effect it is
//! about to perform; after the effect succeeds the advanced record is
//! persisted in a single write, so a restarted process resumes exactly
//! where the previous one stopped. `UpdatePartMeta` is the commit point:
//! the partition's peer set flips from src to dst in one atomic write.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use graphmeta_cluster::AllocationMap;
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::keys;
use graphmeta_core::time::wall_clock_ns;
use graphmeta_core::types::{HostAddr, PartitionId, PlanId, SpaceId};
use graphmeta_kv::KvStore;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::admin::AdminClient;

/// Step the task will perform next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Start,
    ChangeLeader,
    AddPart,
    AddLearner,
    CatchUpData,
    MemberChangeAdd,
    MemberChangeRemove,
    UpdatePartMeta,
    RemovePart,
    End,
}

impl TaskState {
    pub fn as_u8(self) -> u8 {
        match self {
            TaskState::Start => 0x01,
            TaskState::ChangeLeader => 0x02,
            TaskState::AddPart => 0x03,
            TaskState::AddLearner => 0x04,
            TaskState::CatchUpData => 0x05,
            TaskState::MemberChangeAdd => 0x06,
            TaskState::MemberChangeRemove => 0x07,
            TaskState::UpdatePartMeta => 0x08,
            TaskState::RemovePart => 0x09,
            TaskState::End => 0x0a,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(TaskState::Start),
            0x02 => Some(TaskState::ChangeLeader),
            0x03 => Some(TaskState::AddPart),
            0x04 => Some(TaskState::AddLearner),
            0x05 => Some(TaskState::CatchUpData),
            0x06 => Some(TaskState::MemberChangeAdd),
            0x07 => Some(TaskState::MemberChangeRemove),
            0x08 => Some(TaskState::UpdatePartMeta),
            0x09 => Some(TaskState::RemovePart),
            0x0a => Some(TaskState::End),
            _ => None,
        }
    }

    fn next(self) -> TaskState {
        match self {
            TaskState::Start => TaskState::ChangeLeader,
            TaskState::ChangeLeader => TaskState::AddPart,
            TaskState::AddPart => TaskState::AddLearner,
            TaskState::AddLearner => TaskState::CatchUpData,
            TaskState::CatchUpData => TaskState::MemberChangeAdd,
            TaskState::MemberChangeAdd => TaskState::MemberChangeRemove,
            TaskState::MemberChangeRemove => TaskState::UpdatePartMeta,
            TaskState::UpdatePartMeta => TaskState::RemovePart,
            TaskState::RemovePart => TaskState::End,
            TaskState::End => TaskState::End,
        }
    }
}

/// Terminal disposition of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            TaskStatus::InProgress => 0x00,
            TaskStatus::Succeeded => 0x01,
            TaskStatus::Failed => 0x02,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(TaskStatus::InProgress),
            0x01 => Some(TaskStatus::Succeeded),
            0x02 => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Shared handles a task needs to advance
pub struct TaskContext<S, A> {
    pub store: Arc<S>,
    pub admin: Arc<A>,
    /// Per-step timeout for admin calls; a timeout fails the task.
    pub step_timeout: Duration,
}

impl<S, A> TaskContext<S, A> {
    pub fn new(store: Arc<S>, admin: Arc<A>, step_timeout: Duration) -> Self {
        Self {
            store,
            admin,
            step_timeout,
        }
    }
}

/// One persisted partition move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceTask {
    pub plan_id: PlanId,
    /// Position inside the plan; forms the task's KV key.
    pub index: u32,
    pub space: SpaceId,
    pub partition: PartitionId,
    pub src: HostAddr,
    pub dst: HostAddr,
    pub state: TaskState,
    pub status: TaskStatus,
    pub start_ts: u64,
    pub end_ts: u64,
}

impl BalanceTask {
    pub fn new(
        plan_id: PlanId,
        index: u32,
        space: SpaceId,
        partition: PartitionId,
        src: HostAddr,
        dst: HostAddr,
    ) -> Self {
        debug_assert_ne!(src, dst);
        Self {
            plan_id,
            index,
            space,
            partition,
            src,
            dst,
            state: TaskState::Start,
            status: TaskStatus::InProgress,
            start_ts: 0,
            end_ts: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != TaskStatus::InProgress
    }

    /// Durable record: `state(1) | status(1) | space(4) | partition(4) |
    /// src_ip(4) | src_port(4) | dst_ip(4) | dst_port(4) | start_ts(8) |
    /// end_ts(8)`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(42);
        buf.put_u8(self.state.as_u8());
        buf.put_u8(self.status.as_u8());
        buf.put_u32(self.space);
        buf.put_u32(self.partition);
        buf.put_slice(&self.src.to_bytes());
        buf.put_slice(&self.dst.to_bytes());
        buf.put_u64(self.start_ts);
        buf.put_u64(self.end_ts);
        buf.freeze()
    }

    pub fn decode(plan_id: PlanId, index: u32, raw: &[u8]) -> Result<Self> {
        if raw.len() != 42 {
            return Err(MetaError::StoreFailure(format!(
                "task record of {} bytes",
                raw.len()
            )));
        }
        let state = TaskState::from_u8(raw[0])
            .ok_or_else(|| MetaError::StoreFailure(format!("task state 0x{:02x}", raw[0])))?;
        let status = TaskStatus::from_u8(raw[1])
            .ok_or_else(|| MetaError::StoreFailure(format!("task status 0x{:02x}", raw[1])))?;
        let space = u32::from_be_bytes(raw[2..6].try_into().unwrap());
        let partition = u32::from_be_bytes(raw[6..10].try_into().unwrap());
        let src = HostAddr::from_bytes(&raw[10..18])
            .ok_or_else(|| MetaError::StoreFailure("task src host".to_string()))?;
        let dst = HostAddr::from_bytes(&raw[18..26])
            .ok_or_else(|| MetaError::StoreFailure("task dst host".to_string()))?;
        let start_ts = u64::from_be_bytes(raw[26..34].try_into().unwrap());
        let end_ts = u64::from_be_bytes(raw[34..42].try_into().unwrap());
        Ok(Self {
            plan_id,
            index,
            space,
            partition,
            src,
            dst,
            state,
            status,
            start_ts,
            end_ts,
        })
    }

    async fn checkpoint<S: KvStore>(&self, store: &S) -> Result<()> {
        store
            .multi_put(vec![(keys::task_key(self.plan_id, self.index), self.encode())])
            .await
    }

    /// Side effect of the current state. `Start` and `End` have none.
    async fn step<S: KvStore, A: AdminClient>(&self, ctx: &TaskContext<S, A>) -> Result<()> {
        let admin = &ctx.admin;
        let fut = async {
            match self.state {
                TaskState::Start | TaskState::End => Ok(()),
                TaskState::ChangeLeader => {
                    admin.transfer_leader(self.space, self.partition, self.src).await
                }
                TaskState::AddPart => {
                    admin.add_part(self.space, self.partition, self.dst, true).await
                }
                TaskState::AddLearner => {
                    admin.add_learner(self.space, self.partition, self.dst).await
                }
                TaskState::CatchUpData => {
                    admin.wait_caught_up(self.space, self.partition, self.dst).await
                }
                TaskState::MemberChangeAdd => {
                    admin.member_change(self.space, self.partition, self.dst, true).await
                }
                TaskState::MemberChangeRemove => {
                    admin.member_change(self.space, self.partition, self.src, false).await
                }
                TaskState::UpdatePartMeta => self.commit_allocation(ctx).await,
                TaskState::RemovePart => {
                    admin.remove_part(self.space, self.partition, self.src).await
                }
            }
        };
        match timeout(ctx.step_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(MetaError::Unknown(format!(
                "step {:?} timed out after {:?}",
                self.state, ctx.step_timeout
            ))),
        }
    }

    /// Flip the allocation map from src to dst.
    ///
    /// A crash between this write and its checkpoint re-runs the state, so
    /// an already-flipped peer set counts as done.
    async fn commit_allocation<S: KvStore, A>(&self, ctx: &TaskContext<S, A>) -> Result<()> {
        let alloc = AllocationMap::new(ctx.store.clone());
        let peers = alloc
            .peers(self.space, self.partition)
            .await?
            .ok_or_else(|| {
                MetaError::NotFound(format!("partition {}/{}", self.space, self.partition))
            })?;
        if peers.contains(&self.dst) && !peers.contains(&self.src) {
            return Ok(());
        }
        alloc
            .replace_peer(self.space, self.partition, self.src, self.dst)
            .await
    }

    /// Drive the task from its current state to a terminal status,
    /// persisting a checkpoint after every transition.
    pub async fn run<S: KvStore, A: AdminClient>(
        &mut self,
        ctx: &TaskContext<S, A>,
    ) -> TaskStatus {
        if self.is_terminal() {
            return self.status;
        }
        if self.start_ts == 0 {
            self.start_ts = wall_clock_ns();
        }

        info!(
            plan_id = self.plan_id,
            space = self.space,
            partition = self.partition,
            src = %self.src,
            dst = %self.dst,
            state = ?self.state,
            "running balance task"
        );

        loop {
            if let Err(e) = self.step(ctx).await {
                warn!(
                    plan_id = self.plan_id,
                    space = self.space,
                    partition = self.partition,
                    state = ?self.state,
                    error = %e,
                    "balance task step failed"
                );
                self.fail(ctx).await;
                return self.status;
            }

            if self.state == TaskState::End {
                self.status = TaskStatus::Succeeded;
                self.end_ts = wall_clock_ns();
            } else {
                self.state = self.state.next();
            }

            if let Err(e) = self.checkpoint(&*ctx.store).await {
                error!(
                    plan_id = self.plan_id,
                    index = self.index,
                    error = %e,
                    "failed to checkpoint balance task"
                );
                self.status = TaskStatus::Failed;
                self.end_ts = wall_clock_ns();
                return self.status;
            }

            if self.is_terminal() {
                info!(
                    plan_id = self.plan_id,
                    space = self.space,
                    partition = self.partition,
                    "balance task succeeded"
                );
                return self.status;
            }
        }
    }

    /// Mark the task failed where it stands and persist the disposition.
    pub(crate) async fn fail<S: KvStore, A>(&mut self, ctx: &TaskContext<S, A>) {
        self.status = TaskStatus::Failed;
        self.end_ts = wall_clock_ns();
        if let Err(e) = self.checkpoint(&*ctx.store).await {
            error!(
                plan_id = self.plan_id,
                index = self.index,
                error = %e,
                "failed to persist task failure"
            );
        }
    }
}
