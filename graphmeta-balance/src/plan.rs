//! Balance plan
//!
//! A plan is one balancer invocation's worth of tasks, persisted as a
//! header record plus one record per task. Tasks touching the same
//! partition form an equivalence class and run strictly in order; classes
//! run concurrently under a semaphore. A plan is terminal once every task
//! is terminal, and succeeds only if every task succeeded. After the first
//! failure no further task starts; in-flight classes finish on their own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::keys;
use graphmeta_core::types::{HostAddr, PartitionId, PlanId, SpaceId};
use graphmeta_kv::store::put;
use graphmeta_kv::KvStore;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::admin::AdminClient;
use crate::task::{BalanceTask, TaskContext, TaskState, TaskStatus};

/// Disposition of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl PlanStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            PlanStatus::InProgress => 0x00,
            PlanStatus::Succeeded => 0x01,
            PlanStatus::Failed => 0x02,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PlanStatus::InProgress),
            0x01 => Some(PlanStatus::Succeeded),
            0x02 => Some(PlanStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != PlanStatus::InProgress
    }
}

/// Reportable view of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub space: SpaceId,
    pub partition: PartitionId,
    pub src: HostAddr,
    pub dst: HostAddr,
    pub state: TaskState,
    pub status: TaskStatus,
    pub start_ts: u64,
    pub end_ts: u64,
}

/// Reportable view of one plan
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub tasks: Vec<TaskSummary>,
}

/// One balancer invocation's worth of move tasks
#[derive(Debug)]
pub struct BalancePlan {
    pub id: PlanId,
    pub status: PlanStatus,
    pub tasks: Vec<BalanceTask>,
}

impl BalancePlan {
    pub fn new(id: PlanId, tasks: Vec<BalanceTask>) -> Self {
        Self {
            id,
            status: PlanStatus::InProgress,
            tasks,
        }
    }

    /// Header record: `status(1) | task_count(4)`.
    pub fn encode_header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.status.as_u8());
        buf.put_u32(self.tasks.len() as u32);
        buf.freeze()
    }

    pub fn decode_header(raw: &[u8]) -> Result<(PlanStatus, u32)> {
        if raw.len() != 5 {
            return Err(MetaError::StoreFailure(format!(
                "plan header of {} bytes",
                raw.len()
            )));
        }
        let status = PlanStatus::from_u8(raw[0])
            .ok_or_else(|| MetaError::StoreFailure(format!("plan status 0x{:02x}", raw[0])))?;
        let count = u32::from_be_bytes(raw[1..5].try_into().unwrap());
        Ok((status, count))
    }

    /// Persist header and every task record in one atomic batch. Dispatch
    /// only happens after this write succeeds.
    pub async fn save<S: KvStore>(&self, store: &S) -> Result<()> {
        let mut pairs = Vec::with_capacity(self.tasks.len() + 1);
        pairs.push((keys::plan_key(self.id), self.encode_header()));
        for task in &self.tasks {
            pairs.push((keys::task_key(self.id, task.index), task.encode()));
        }
        store.multi_put(pairs).await
    }

    async fn save_header<S: KvStore>(&self, store: &S) -> Result<()> {
        put(store, keys::plan_key(self.id), self.encode_header()).await
    }

    /// Reload a plan and its tasks from the store.
    ///
    /// Task records without a header mean a torn or tampered store and are
    /// surfaced as `StoreFailure`.
    pub async fn load<S: KvStore>(store: &S, plan_id: PlanId) -> Result<Self> {
        let header = store.get(&keys::plan_key(plan_id)).await?;

        let prefix = keys::task_plan_prefix(plan_id);
        let end = keys::prefix_end(&prefix);
        let records = store.scan(&prefix, &end).await?;

        let Some(header) = header else {
            if records.is_empty() {
                return Err(MetaError::NotFound(format!("balance plan {plan_id}")));
            }
            error!(plan_id, tasks = records.len(), "task records without a plan header");
            return Err(MetaError::StoreFailure(format!(
                "balance plan {plan_id} is corrupt: {} task records but no header",
                records.len()
            )));
        };

        let (status, count) = Self::decode_header(&header)?;
        let mut tasks = Vec::with_capacity(records.len());
        for (key, value) in records {
            let (_, index) = keys::parse_task_key(&key).ok_or_else(|| {
                MetaError::StoreFailure(format!("malformed task key {}", hex::encode(&key)))
            })?;
            tasks.push(BalanceTask::decode(plan_id, index, &value)?);
        }
        if tasks.len() != count as usize {
            warn!(
                plan_id,
                expected = count,
                found = tasks.len(),
                "plan header task count disagrees with task records"
            );
        }

        Ok(Self {
            id: plan_id,
            status,
            tasks,
        })
    }

    /// Group tasks by `(space, partition)` preserving in-plan order.
    fn classes(&mut self) -> BTreeMap<(SpaceId, PartitionId), Vec<BalanceTask>> {
        let mut classes: BTreeMap<(SpaceId, PartitionId), Vec<BalanceTask>> = BTreeMap::new();
        for task in self.tasks.drain(..) {
            classes
                .entry((task.space, task.partition))
                .or_default()
                .push(task);
        }
        classes
    }

    /// Drive every non-terminal task to a terminal state and persist the
    /// final plan status.
    #[instrument(skip(self, ctx), fields(plan_id = self.id))]
    pub async fn run<S, A>(&mut self, ctx: Arc<TaskContext<S, A>>, max_concurrent: usize) -> PlanStatus
    where
        S: KvStore + 'static,
        A: AdminClient + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let failed = Arc::new(AtomicBool::new(
            self.tasks.iter().any(|t| t.status == TaskStatus::Failed),
        ));

        info!(tasks = self.tasks.len(), "dispatching balance plan");

        let mut handles = Vec::new();
        for (class, tasks) in self.classes() {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let failed = failed.clone();
            handles.push(tokio::spawn(async move {
                run_class(class, tasks, ctx, semaphore, failed).await
            }));
        }

        let mut finished: Vec<BalanceTask> = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(tasks) => finished.extend(tasks),
                Err(e) => {
                    error!(error = %e, "balance class worker panicked");
                    failed.store(true, Ordering::SeqCst);
                }
            }
        }
        finished.sort_by_key(|t| t.index);
        self.tasks = finished;

        let all_succeeded = self.tasks.iter().all(|t| t.status == TaskStatus::Succeeded);
        self.status = if all_succeeded && !failed.load(Ordering::SeqCst) {
            PlanStatus::Succeeded
        } else {
            PlanStatus::Failed
        };

        if let Err(e) = self.save_header(&*ctx.store).await {
            error!(plan_id = self.id, error = %e, "failed to persist final plan status");
        }

        info!(
            plan_id = self.id,
            status = ?self.status,
            succeeded = self.tasks.iter().filter(|t| t.status == TaskStatus::Succeeded).count(),
            failed = self.tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(),
            "balance plan finished"
        );
        self.status
    }

    pub fn summary(&self) -> PlanSummary {
        let succeeded = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count();
        let failed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        PlanSummary {
            plan_id: self.id,
            status: self.status,
            total: self.tasks.len(),
            succeeded,
            failed,
            in_progress: self.tasks.len() - succeeded - failed,
            tasks: self
                .tasks
                .iter()
                .map(|t| TaskSummary {
                    space: t.space,
                    partition: t.partition,
                    src: t.src,
                    dst: t.dst,
                    state: t.state,
                    status: t.status,
                    start_ts: t.start_ts,
                    end_ts: t.end_ts,
                })
                .collect(),
        }
    }
}

/// Execute one equivalence class strictly in order.
async fn run_class<S, A>(
    class: (SpaceId, PartitionId),
    mut tasks: Vec<BalanceTask>,
    ctx: Arc<TaskContext<S, A>>,
    semaphore: Arc<Semaphore>,
    failed: Arc<AtomicBool>,
) -> Vec<BalanceTask>
where
    S: KvStore,
    A: AdminClient,
{
    // Semaphore is never closed while workers run.
    let _permit = semaphore.acquire().await.expect("semaphore closed");

    for task in &mut tasks {
        if task.is_terminal() {
            continue;
        }
        if failed.load(Ordering::SeqCst) {
            // The plan already failed; park the task as failed instead of
            // starting new work.
            warn!(
                space = class.0,
                partition = class.1,
                index = task.index,
                "skipping task after plan failure"
            );
            task.fail(&ctx).await;
            continue;
        }
        if task.run(&ctx).await == TaskStatus::Failed {
            failed.store(true, Ordering::SeqCst);
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminOp, RecordingAdminClient};
    use graphmeta_cluster::AllocationMap;
    use graphmeta_kv::MemoryKv;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn addr(last: u8) -> HostAddr {
        HostAddr::new(Ipv4Addr::new(10, 0, 0, last), 9779)
    }

    fn ctx() -> Arc<TaskContext<MemoryKv, RecordingAdminClient>> {
        Arc::new(TaskContext::new(
            Arc::new(MemoryKv::new()),
            Arc::new(RecordingAdminClient::new()),
            Duration::from_secs(30),
        ))
    }

    #[test]
    fn test_header_roundtrip() {
        let plan = BalancePlan::new(42, vec![]);
        let (status, count) = BalancePlan::decode_header(&plan.encode_header()).unwrap();
        assert_eq!(status, PlanStatus::InProgress);
        assert_eq!(count, 0);
        assert!(BalancePlan::decode_header(&[0x00]).is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let ctx = ctx();
        let tasks = vec![
            BalanceTask::new(7, 0, 1, 1, addr(1), addr(2)),
            BalanceTask::new(7, 1, 1, 2, addr(1), addr(3)),
        ];
        let plan = BalancePlan::new(7, tasks);
        plan.save(&*ctx.store).await.unwrap();

        let loaded = BalancePlan::load(&*ctx.store, 7).await.unwrap();
        assert_eq!(loaded.status, PlanStatus::InProgress);
        assert_eq!(loaded.tasks.len(), 2);
        assert_eq!(loaded.tasks[1].partition, 2);
    }

    #[tokio::test]
    async fn test_load_missing_plan_is_not_found() {
        let ctx = ctx();
        let err = BalancePlan::load(&*ctx.store, 99).await.unwrap_err();
        assert!(matches!(err, MetaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_tasks_without_header_is_corrupt() {
        let ctx = ctx();
        let task = BalanceTask::new(8, 0, 1, 1, addr(1), addr(2));
        put(&*ctx.store, keys::task_key(8, 0), task.encode())
            .await
            .unwrap();

        let err = BalancePlan::load(&*ctx.store, 8).await.unwrap_err();
        assert!(matches!(err, MetaError::StoreFailure(_)));
    }

    #[tokio::test]
    async fn test_run_executes_all_classes_and_persists_status() {
        let ctx = ctx();
        let alloc = AllocationMap::new(ctx.store.clone());
        alloc.set_peers(1, 1, &[addr(1), addr(2)]).await.unwrap();
        alloc.set_peers(1, 2, &[addr(1), addr(2)]).await.unwrap();

        let tasks = vec![
            BalanceTask::new(9, 0, 1, 1, addr(2), addr(3)),
            BalanceTask::new(9, 1, 1, 2, addr(2), addr(4)),
        ];
        let mut plan = BalancePlan::new(9, tasks);
        plan.save(&*ctx.store).await.unwrap();

        let status = plan.run(ctx.clone(), 4).await;
        assert_eq!(status, PlanStatus::Succeeded);

        let loaded = BalancePlan::load(&*ctx.store, 9).await.unwrap();
        assert_eq!(loaded.status, PlanStatus::Succeeded);
        assert!(loaded.tasks.iter().all(|t| t.status == TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_same_partition_tasks_run_in_order() {
        let ctx = ctx();
        let alloc = AllocationMap::new(ctx.store.clone());
        alloc.set_peers(1, 1, &[addr(1), addr(2)]).await.unwrap();

        // Two chained moves of the same partition: 2 -> 3, then 3 -> 4.
        let tasks = vec![
            BalanceTask::new(10, 0, 1, 1, addr(2), addr(3)),
            BalanceTask::new(10, 1, 1, 1, addr(3), addr(4)),
        ];
        let mut plan = BalancePlan::new(10, tasks);
        plan.save(&*ctx.store).await.unwrap();

        let status = plan.run(ctx.clone(), 4).await;
        assert_eq!(status, PlanStatus::Succeeded);

        let peers = alloc.peers(1, 1).await.unwrap().unwrap();
        assert!(peers.contains(&addr(1)));
        assert!(peers.contains(&addr(4)));

        // The second move's steps all come after the first move finished.
        let calls = ctx.admin.calls_for(1, 1);
        let first_remove = calls
            .iter()
            .position(|c| c.op == AdminOp::RemovePart && c.host == addr(2))
            .unwrap();
        let second_leader = calls
            .iter()
            .position(|c| c.op == AdminOp::TransferLeader && c.host == addr(3))
            .unwrap();
        assert!(first_remove < second_leader);
    }

    #[tokio::test]
    async fn test_one_failed_task_fails_the_plan() {
        let ctx = ctx();
        let alloc = AllocationMap::new(ctx.store.clone());
        alloc.set_peers(1, 1, &[addr(1), addr(2)]).await.unwrap();
        alloc.set_peers(1, 2, &[addr(1), addr(2)]).await.unwrap();
        ctx.admin.fail_on(AdminOp::WaitCaughtUp);

        let tasks = vec![
            BalanceTask::new(11, 0, 1, 1, addr(2), addr(3)),
            BalanceTask::new(11, 1, 1, 2, addr(2), addr(4)),
        ];
        let mut plan = BalancePlan::new(11, tasks);
        plan.save(&*ctx.store).await.unwrap();

        let status = plan.run(ctx.clone(), 4).await;
        assert_eq!(status, PlanStatus::Failed);

        let loaded = BalancePlan::load(&*ctx.store, 11).await.unwrap();
        assert_eq!(loaded.status, PlanStatus::Failed);
        assert!(loaded.tasks.iter().all(|t| t.is_terminal()));
    }

    #[tokio::test]
    async fn test_resume_skips_terminal_tasks() {
        let ctx = ctx();
        let alloc = AllocationMap::new(ctx.store.clone());
        alloc.set_peers(1, 2, &[addr(1), addr(2)]).await.unwrap();

        let mut done = BalanceTask::new(12, 0, 1, 1, addr(2), addr(3));
        done.state = TaskState::End;
        done.status = TaskStatus::Succeeded;
        let pending = BalanceTask::new(12, 1, 1, 2, addr(2), addr(4));

        let mut plan = BalancePlan::new(12, vec![done, pending]);
        plan.save(&*ctx.store).await.unwrap();

        let status = plan.run(ctx.clone(), 1).await;
        assert_eq!(status, PlanStatus::Succeeded);

        // Nothing was re-issued for the already-finished partition.
        assert!(ctx.admin.calls_for(1, 1).is_empty());
        assert_eq!(ctx.admin.calls_for(1, 2).len(), 7);
    }

    #[test]
    fn test_summary_counts() {
        let mut failed = BalanceTask::new(13, 0, 1, 1, addr(1), addr(2));
        failed.status = TaskStatus::Failed;
        let pending = BalanceTask::new(13, 1, 1, 2, addr(1), addr(3));

        let plan = BalancePlan::new(13, vec![failed, pending]);
        let summary = plan.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.in_progress, 1);
        assert_eq!(summary.succeeded, 0);
    }
}
