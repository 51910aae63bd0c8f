use serde::{Deserialize, Serialize};
use std::fmt;

use crate::license::pool::LicenseRequest;
use crate::sched::dependency::Dependency;
use crate::state::partition::PartKey;
use crate::state::reservation::ResvKey;
use crate::util::bitmap::NodeBitmap;

/// Stable numeric job identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signal numbers used by the preemption and gang machinery.
pub mod signal {
    pub const SIGKILL: i32 = 9;
    pub const SIGUSR1: i32 = 10;
    pub const SIGTERM: i32 = 15;
    pub const SIGCONT: i32 = 18;
}

/// Base job state. The `completing` flag on [`Job`] is orthogonal and may
/// coexist with any terminal state while epilog teardown runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Complete,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Cancelled | JobState::Timeout | JobState::NodeFail)
    }
}

/// Why a pending job is not running, or why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    None,
    Resources,
    Priority,
    BeginTime,
    Dependency,
    DependencyNeverSatisfied,
    Licenses,
    Held,
    HeldUser,
    FrontEndDown,
    Cleaning,
    PartitionDown,
    PartitionNodeLimit,
    PartitionTimeLimit,
    ReservedNodes,
    BadConstraints,
    InvalidAccount,
    InvalidQos,
    AssocResourceLimit,
    MaxRequeue,
    LaunchFailed,
}

/// Per-job resource request, matched against partitions and nodes by the
/// selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub cpus_per_task: u16,
    pub tasks_per_node: u16,
    pub mem_per_cpu: Option<u64>,
    pub mem_per_node: Option<u64>,
    pub tmp_disk: u64,
    pub features: Option<String>,
    /// Nodes that must be part of any allocation.
    pub required_nodes: Option<NodeBitmap>,
}

/// Resources held by a running or suspended job.
#[derive(Debug, Clone)]
pub struct JobAllocation {
    pub node_bitmap: NodeBitmap,
    /// CPUs allocated per node, one entry per set bit of `node_bitmap`,
    /// in node-index order.
    pub cpus_per_node: Vec<u16>,
    /// Core-granular footprint over the cluster core space. Present only
    /// when the partition schedules at socket/core granularity.
    pub core_bitmap: Option<NodeBitmap>,
}

impl JobAllocation {
    pub fn node_count(&self) -> usize {
        self.node_bitmap.count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WarnSignal {
    pub signal: i32,
    pub warn_time: u32,
    pub sent: bool,
}

/// A job record. Created by submission machinery outside the core; the
/// scheduler mutates state, reason, timing and allocation fields.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub user_id: u32,
    pub account: Option<String>,
    pub qos: Option<String>,

    pub state: JobState,
    pub completing: bool,
    pub reason: Reason,
    /// Scalar priority; zero means held.
    pub priority: u32,
    /// Per-partition priority vector indexed by position in `part_keys`.
    pub priority_vector: Option<Vec<u32>>,

    /// Scheduling partition. For multi-partition submissions this is the
    /// currently tried partition; `part_keys` holds primary + alternates.
    pub part_key: Option<PartKey>,
    pub part_keys: Vec<PartKey>,
    pub resv_key: Option<ResvKey>,

    pub request: ResourceRequest,
    pub licenses: Option<String>,
    pub license_list: Vec<LicenseRequest>,
    /// Licenses whose shortage drove the last busy verdict; consumed by the
    /// preemption engine when reclaim_licenses is enabled.
    pub licenses_to_preempt: Vec<u16>,
    /// Checkpointable string of the licenses actually taken.
    pub licenses_allocated: Option<String>,

    pub depend_list: Vec<Dependency>,
    pub dependency: Option<String>,
    pub orig_dependency: Option<String>,
    pub expanding_job_id: Option<JobId>,

    /// Hetjob membership: `het_leader` on every component names the leader,
    /// `het_components` is non-empty only on the leader itself.
    pub het_leader: Option<JobId>,
    pub het_components: Vec<JobId>,

    pub array_job_id: Option<u32>,
    pub array_task_id: Option<u32>,

    pub submit_time: i64,
    pub begin_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub preempt_time: i64,
    pub suspend_time: i64,
    pub time_limit_secs: Option<i64>,

    pub alloc: Option<JobAllocation>,
    pub exit_code: i32,
    pub special_exit: bool,

    pub batch: bool,
    pub requeue_allowed: bool,
    pub requeue_count: u32,

    pub warn: Option<WarnSignal>,

    pub prolog_running: bool,
    pub epilog_running: bool,
    /// Node count still to be cleaned up while completing.
    pub completing_node_cnt: u32,

    /// Set while a preemption decision in the current cycle already
    /// scheduled this job's removal; cleared at queue build.
    pub preempt_in_progress: bool,

    /// Last signal delivered through the control layer, kept for
    /// observability and tests.
    pub last_signal: Option<i32>,
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, user_id: u32, priority: u32) -> Job {
        Job {
            id,
            name: name.into(),
            user_id,
            account: None,
            qos: None,
            state: JobState::Pending,
            completing: false,
            reason: Reason::None,
            priority,
            priority_vector: None,
            part_key: None,
            part_keys: Vec::new(),
            resv_key: None,
            request: ResourceRequest { min_nodes: 1, max_nodes: 1, min_cpus: 1, max_cpus: 1, cpus_per_task: 1, ..ResourceRequest::default() },
            licenses: None,
            license_list: Vec::new(),
            licenses_to_preempt: Vec::new(),
            licenses_allocated: None,
            depend_list: Vec::new(),
            dependency: None,
            orig_dependency: None,
            expanding_job_id: None,
            het_leader: None,
            het_components: Vec::new(),
            array_job_id: None,
            array_task_id: None,
            submit_time: 0,
            begin_time: 0,
            start_time: 0,
            end_time: 0,
            preempt_time: 0,
            suspend_time: 0,
            time_limit_secs: None,
            alloc: None,
            exit_code: 0,
            special_exit: false,
            batch: true,
            requeue_allowed: true,
            requeue_count: 0,
            warn: None,
            prolog_running: false,
            epilog_running: false,
            completing_node_cnt: 0,
            preempt_in_progress: false,
            last_signal: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.state == JobState::Suspended
    }

    /// Terminal in any way (success, failure, cancellation, ...).
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Finished with a zero exit code.
    pub fn completed_ok(&self) -> bool {
        self.state == JobState::Complete && self.exit_code == 0
    }

    pub fn is_held(&self) -> bool {
        self.priority == 0
    }

    pub fn is_array_task(&self) -> bool {
        self.array_task_id.is_some()
    }

    pub fn is_het_leader(&self) -> bool {
        !self.het_components.is_empty()
    }

    pub fn is_het_member(&self) -> bool {
        self.het_leader.is_some() || self.is_het_leader()
    }

    /// Transition to Failed with the fixed exit code used for permanent
    /// infeasibility; priority drops to zero so the job cannot re-queue.
    pub fn fail_never_runnable(&mut self, reason: Reason, now: i64) {
        self.state = JobState::Failed;
        self.reason = reason;
        self.exit_code = 1;
        self.start_time = now;
        self.end_time = now;
        self.priority = 0;
    }
}
