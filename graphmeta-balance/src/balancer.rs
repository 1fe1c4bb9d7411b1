//! Balancer
//!
//! Process-wide singleton orchestrator. `balance()` resumes the newest
//! non-terminal plan if one survives in the store, otherwise diffs the
//! allocation map against the active-host set, builds a plan, persists it
//! and dispatches it in the background. Exclusivity is an atomic flag: it
//! is set before dispatch and cleared when the plan reaches a terminal
//! state, and a second `balance()` in between is rejected.
//!
//! Plan construction itself is a pure function over `(host_parts,
//! active_hosts)` so tests drive it without a store or an admin client.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graphmeta_cluster::{AllocationMap, HostDirectory, HostParts};
use graphmeta_core::error::{MetaError, Result};
use graphmeta_core::keys;
use graphmeta_core::time::wall_clock_ns;
use graphmeta_core::types::{HostAddr, PartitionId, PlanId, SpaceId};
use graphmeta_kv::KvStore;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::admin::AdminClient;
use crate::plan::{BalancePlan, PlanStatus, PlanSummary};
use crate::task::{BalanceTask, TaskContext};

/// Balancer tuning knobs
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Per-step timeout for admin calls
    pub step_timeout: Duration,

    /// Concurrent partition classes per plan; 1 degenerates to a single
    /// worker
    pub task_concurrency: usize,

    /// Heartbeat freshness window defining the active-host set
    pub liveness_window: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            task_concurrency: 4,
            liveness_window: Duration::from_secs(60),
        }
    }
}

/// One desired partition move, before it becomes a persisted task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartMove {
    pub space: SpaceId,
    pub partition: PartitionId,
    pub src: HostAddr,
    pub dst: HostAddr,
}

/// Singleton balance orchestrator
pub struct Balancer<S, A> {
    store: Arc<S>,
    admin: Arc<A>,
    config: BalancerConfig,
    /// Shared with the background driver, which clears it at plan end.
    running: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<PlanStatus>>>,
    current_plan: Mutex<Option<PlanId>>,
}

impl<S, A> Balancer<S, A>
where
    S: KvStore + 'static,
    A: AdminClient + 'static,
{
    pub fn new(store: Arc<S>, admin: Arc<A>, config: BalancerConfig) -> Self {
        Self {
            store,
            admin,
            config,
            running: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
            current_plan: Mutex::new(None),
        }
    }

    /// Whether a plan is currently in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start or resume balancing; returns the id of the dispatched plan.
    #[instrument(skip(self))]
    pub async fn balance(&self) -> Result<PlanId> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MetaError::BalancerRunning);
        }

        let plan = match self.prepare_plan().await {
            Ok(plan) => plan,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let plan_id = plan.id;
        *self.current_plan.lock() = Some(plan_id);
        self.dispatch(plan);
        Ok(plan_id)
    }

    /// Summary of a persisted plan.
    pub async fn status(&self, plan_id: PlanId) -> Result<PlanSummary> {
        let plan = BalancePlan::load(&*self.store, plan_id).await?;
        Ok(plan.summary())
    }

    /// Summary of the plan this balancer most recently dispatched, if any.
    pub async fn preview(&self) -> Result<Option<PlanSummary>> {
        let plan_id = *self.current_plan.lock();
        match plan_id {
            Some(plan_id) => Ok(Some(self.status(plan_id).await?)),
            None => Ok(None),
        }
    }

    /// Reserved.
    pub fn rollback(&self, plan_id: PlanId) -> Result<()> {
        Err(MetaError::Unknown(format!(
            "rollback of balance plan {plan_id} is not implemented"
        )))
    }

    /// Reserved.
    pub fn execute(&self, plan_id: PlanId) -> Result<()> {
        Err(MetaError::Unknown(format!(
            "executing balance plan {plan_id} from outside is not implemented"
        )))
    }

    /// Await the in-flight plan, if any, and return its final status.
    pub async fn join(&self) -> Option<PlanStatus> {
        let handle = self.driver.lock().take()?;
        match handle.await {
            Ok(status) => Some(status),
            Err(e) => {
                error!(error = %e, "balance driver panicked");
                self.running.store(false, Ordering::SeqCst);
                Some(PlanStatus::Failed)
            }
        }
    }

    /// Resume the newest non-terminal plan, or build a fresh one.
    async fn prepare_plan(&self) -> Result<BalancePlan> {
        if let Some(plan) = self.recover().await? {
            info!(plan_id = plan.id, tasks = plan.tasks.len(), "resuming balance plan");
            return Ok(plan);
        }
        self.build_plan().await
    }

    /// Scan persisted plan headers for an interrupted plan.
    async fn recover(&self) -> Result<Option<BalancePlan>> {
        let prefix = keys::plan_prefix();
        let end = keys::prefix_end(&prefix);
        let headers = self.store.scan(&prefix, &end).await?;

        let mut newest: Option<PlanId> = None;
        let mut known: BTreeSet<PlanId> = BTreeSet::new();
        for (key, value) in &headers {
            let Some(plan_id) = keys::parse_plan_key(key) else {
                warn!(key = %hex::encode(key), "malformed plan header key");
                continue;
            };
            known.insert(plan_id);
            let (status, _) = BalancePlan::decode_header(value)?;
            if !status.is_terminal() {
                newest = Some(newest.map_or(plan_id, |n: PlanId| n.max(plan_id)));
            }
        }

        // Task records whose plan header is gone are corrupt; report them
        // rather than resurrecting half a plan.
        let task_prefix = keys::task_prefix();
        let task_end = keys::prefix_end(&task_prefix);
        for (key, _) in self.store.scan(&task_prefix, &task_end).await? {
            if let Some((plan_id, index)) = keys::parse_task_key(&key) {
                if !known.contains(&plan_id) {
                    error!(plan_id, index, "balance task record without a plan header");
                }
            }
        }

        match newest {
            Some(plan_id) => Ok(Some(BalancePlan::load(&*self.store, plan_id).await?)),
            None => Ok(None),
        }
    }

    /// Diff allocation against the active set and persist a new plan.
    async fn build_plan(&self) -> Result<BalancePlan> {
        let now = wall_clock_ns();
        let hosts = HostDirectory::new(self.store.clone());
        let alloc = AllocationMap::new(self.store.clone());

        let active = hosts.active_hosts(now, self.config.liveness_window).await?;
        let spaces = alloc.spaces().await?;

        let plan_id: PlanId = now;
        let mut tasks = Vec::new();
        for space in spaces {
            let host_parts = alloc.host_parts(space).await?;
            for mv in build_balance_moves(space, &host_parts, &active)? {
                let index = tasks.len() as u32;
                tasks.push(BalanceTask::new(
                    plan_id, index, mv.space, mv.partition, mv.src, mv.dst,
                ));
            }
        }

        if tasks.is_empty() {
            info!("allocation already balanced, nothing to move");
            return Err(MetaError::Unknown("the cluster is balanced".to_string()));
        }

        let plan = BalancePlan::new(plan_id, tasks);
        plan.save(&*self.store).await?;
        info!(plan_id, tasks = plan.tasks.len(), "balance plan persisted");
        Ok(plan)
    }

    /// Run the plan in the background; the running flag drops with it.
    fn dispatch(&self, mut plan: BalancePlan) {
        let ctx = Arc::new(TaskContext::new(
            self.store.clone(),
            self.admin.clone(),
            self.config.step_timeout,
        ));
        let concurrency = self.config.task_concurrency;
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            let status = plan.run(ctx, concurrency).await;
            running.store(false, Ordering::SeqCst);
            status
        });
        *self.driver.lock() = Some(handle);
    }
}

/// Compute the moves that bring one space's allocation back to balance.
///
/// Pure over its inputs and deterministic: identical `(host_parts, active)`
/// yield an identical move list. Two passes:
/// 1. Loss: every partition held by a host outside the active set moves to
///    the active host with the fewest partitions that does not already
///    hold it.
/// 2. Spread: while the fullest host holds more than `ceil(avg)` and the
///    emptiest fewer than `floor(avg)`, move the smallest movable
///    partition from the fullest to the emptiest. Host ties break by
///    address.
pub fn build_balance_moves(
    space: SpaceId,
    host_parts: &HostParts,
    active: &[HostAddr],
) -> Result<Vec<PartMove>> {
    let active_set: BTreeSet<HostAddr> = active.iter().copied().collect();
    let mut parts: BTreeMap<HostAddr, Vec<PartitionId>> = host_parts.parts.clone();

    if parts.is_empty() {
        return Ok(Vec::new());
    }

    let lost: Vec<HostAddr> = parts
        .keys()
        .filter(|h| !active_set.contains(h))
        .copied()
        .collect();
    let newly_added: Vec<HostAddr> = active_set
        .iter()
        .filter(|h| !parts.contains_key(h))
        .copied()
        .collect();
    for host in &newly_added {
        parts.insert(*host, Vec::new());
    }
    info!(
        space,
        lost = lost.len(),
        newly_added = newly_added.len(),
        active = active_set.len(),
        "computed host diff"
    );

    let mut moves = Vec::new();

    // Loss pass: drain every partition off the dead hosts.
    for src in lost {
        let orphaned = parts.remove(&src).unwrap_or_default();
        for partition in orphaned {
            let dst = pick_minimal_host(&parts, &active_set, partition).ok_or(
                MetaError::NoValidHost { space, partition },
            )?;
            parts.get_mut(&dst).expect("active host present").push(partition);
            moves.push(PartMove {
                space,
                partition,
                src,
                dst,
            });
        }
    }

    // Spread pass: level the survivors toward the average.
    let total: usize = parts.values().map(Vec::len).sum();
    if parts.is_empty() || total == 0 {
        return Ok(moves);
    }
    let avg = total as f64 / parts.len() as f64;
    let high = avg.ceil() as usize;
    let low = avg.floor() as usize;

    loop {
        let mut order: Vec<HostAddr> = parts.keys().copied().collect();
        order.sort_by_key(|h| (std::cmp::Reverse(parts[h].len()), *h));
        let top = order[0];
        let bottom = *order.last().expect("nonempty");
        if parts[&top].len() <= high || parts[&bottom].len() >= low {
            break;
        }

        let candidate = parts[&top]
            .iter()
            .copied()
            .filter(|p| !parts[&bottom].contains(p))
            .min();
        let Some(partition) = candidate else {
            // Everything on the fullest host already sits on the emptiest;
            // no legal move remains.
            warn!(space, top = %top, bottom = %bottom, "no movable partition between extremes");
            break;
        };

        parts.get_mut(&top).expect("present").retain(|p| *p != partition);
        parts.get_mut(&bottom).expect("present").push(partition);
        moves.push(PartMove {
            space,
            partition,
            src: top,
            dst: bottom,
        });
    }

    Ok(moves)
}

/// Active host with the fewest partitions that does not already hold
/// `partition`; ties break by address.
fn pick_minimal_host(
    parts: &BTreeMap<HostAddr, Vec<PartitionId>>,
    active: &BTreeSet<HostAddr>,
    partition: PartitionId,
) -> Option<HostAddr> {
    parts
        .iter()
        .filter(|(host, held)| active.contains(*host) && !held.contains(&partition))
        .min_by_key(|(host, held)| (held.len(), **host))
        .map(|(host, _)| *host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> HostAddr {
        HostAddr::new(Ipv4Addr::new(10, 0, 0, last), 9779)
    }

    fn host_parts(entries: &[(HostAddr, &[PartitionId])]) -> HostParts {
        let mut hp = HostParts::default();
        for (host, parts) in entries {
            hp.parts.insert(*host, parts.to_vec());
            hp.total_parts += parts.len() as u32;
        }
        hp
    }

    #[test]
    fn test_lost_host_drains_to_minimal_hosts() {
        // P1:[A,B] P2:[B,C] P3:[A,C], B is gone.
        let hp = host_parts(&[
            (addr(1), &[1, 3]),
            (addr(2), &[1, 2]),
            (addr(3), &[2, 3]),
        ]);
        let active = vec![addr(1), addr(3)];

        let moves = build_balance_moves(1, &hp, &active).unwrap();
        assert_eq!(moves.len(), 2);
        // P1 cannot land on A (already a peer), so it goes to C; then P2
        // goes to A, the emptier survivor.
        assert_eq!(
            moves[0],
            PartMove { space: 1, partition: 1, src: addr(2), dst: addr(3) }
        );
        assert_eq!(
            moves[1],
            PartMove { space: 1, partition: 2, src: addr(2), dst: addr(1) }
        );
    }

    #[test]
    fn test_no_valid_host_when_survivors_hold_everything() {
        // Replica factor 2 with a single survivor: nowhere to put B's data.
        let hp = host_parts(&[(addr(1), &[1]), (addr(2), &[1])]);
        let active = vec![addr(1)];

        let err = build_balance_moves(1, &hp, &active).unwrap_err();
        assert_eq!(err, MetaError::NoValidHost { space: 1, partition: 1 });
    }

    #[test]
    fn test_rebalance_levels_new_host() {
        let hp = host_parts(&[(addr(1), &[1, 2, 3, 4, 5, 6])]);
        let active = vec![addr(1), addr(2)];

        let moves = build_balance_moves(1, &hp, &active).unwrap();
        assert_eq!(moves.len(), 3);
        for mv in &moves {
            assert_eq!(mv.src, addr(1));
            assert_eq!(mv.dst, addr(2));
        }
        // Smallest partitions move first, deterministically.
        let moved: Vec<PartitionId> = moves.iter().map(|m| m.partition).collect();
        assert_eq!(moved, vec![1, 2, 3]);
    }

    #[test]
    fn test_rebalance_uneven_total_leaves_ceil_floor_split() {
        let hp = host_parts(&[(addr(1), &[1, 2, 3, 4, 5, 6, 7])]);
        let active = vec![addr(1), addr(2)];

        let moves = build_balance_moves(1, &hp, &active).unwrap();
        // 7 replicas over 2 hosts settles at 4/3.
        assert_eq!(moves.len(), 3);
    }

    #[test]
    fn test_balanced_allocation_yields_no_moves() {
        let hp = host_parts(&[(addr(1), &[1, 2]), (addr(2), &[3, 4])]);
        let active = vec![addr(1), addr(2)];
        assert!(build_balance_moves(1, &hp, &active).unwrap().is_empty());
    }

    #[test]
    fn test_moves_never_have_equal_src_dst_and_are_deterministic() {
        let hp = host_parts(&[
            (addr(1), &[1, 2, 3, 4]),
            (addr(2), &[1, 2]),
            (addr(3), &[3]),
        ]);
        let active = vec![addr(1), addr(2), addr(3), addr(4)];

        let first = build_balance_moves(1, &hp, &active).unwrap();
        let second = build_balance_moves(1, &hp, &active).unwrap();
        assert_eq!(first, second);
        for mv in &first {
            assert_ne!(mv.src, mv.dst);
        }
    }

    #[test]
    fn test_empty_space_is_a_no_op() {
        let hp = HostParts::default();
        assert!(build_balance_moves(1, &hp, &[addr(1)]).unwrap().is_empty());
    }
}
