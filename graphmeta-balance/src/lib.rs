//! Partition balancer for the graphmeta control plane.
//!
//! Given the current allocation of partitions to hosts and the set of live
//! hosts, the balancer produces and durably executes a balance plan: an
//! ordered collection of atomic move-partition tasks with crash-safe
//! resumption and one-plan-at-a-time exclusivity.
//!
//! - `admin`: the per-step administrative client storage nodes answer to
//! - `task`: one partition move as a checkpointed state machine
//! - `plan`: a persisted bundle of tasks with dispatch and resumption
//! - `balancer`: the singleton orchestrator and the plan construction
//!   algorithm

pub mod admin;
pub mod balancer;
pub mod plan;
pub mod task;

// Re-export main types
pub use admin::{AdminCall, AdminClient, AdminOp, RecordingAdminClient};
pub use balancer::{build_balance_moves, Balancer, BalancerConfig, PartMove};
pub use plan::{BalancePlan, PlanStatus, PlanSummary, TaskSummary};
pub use task::{BalanceTask, TaskContext, TaskState, TaskStatus};
