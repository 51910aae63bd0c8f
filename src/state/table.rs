use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::license::pool::LicensePool;
use crate::state::job::{signal, Job, JobId, JobState, Reason};
use crate::state::node::NodeTable;
use crate::state::partition::PartitionTable;
use crate::state::reservation::ReservationTable;

/// Ordered job collection. Iteration order is submission order because ids
/// are assigned monotonically.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: BTreeMap<JobId, Job>,
}

impl JobTable {
    pub fn new() -> JobTable {
        JobTable { jobs: BTreeMap::new() }
    }

    pub fn insert(&mut self, job: Job) -> JobId {
        let id = job.id;
        self.jobs.insert(id, job);
        id
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.jobs.remove(&id)
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobId, &Job)> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&JobId, &mut Job)> {
        self.jobs.iter_mut()
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    /// Resolve a dependency target: a plain job id, or an array task when
    /// `task_id` names a specific task of array `job_id`.
    pub fn find_dependency_target(&self, job_id: u32, task_id: Option<u32>) -> Option<&Job> {
        match task_id {
            None => self.jobs.get(&JobId(job_id)),
            Some(task) => self.jobs.values().find(|j| j.array_job_id == Some(job_id) && j.array_task_id == Some(task)),
        }
    }

    pub fn array_tasks(&self, array_job_id: u32) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(move |j| j.array_job_id == Some(array_job_id))
    }

    /// Any task of the array still pending.
    pub fn array_pending(&self, array_job_id: u32) -> bool {
        self.array_tasks(array_job_id).any(|j| j.is_pending())
    }

    /// Every task of the array reached a terminal state.
    pub fn array_completed(&self, array_job_id: u32) -> bool {
        let mut tasks = self.array_tasks(array_job_id).peekable();
        tasks.peek().is_some() && self.array_tasks(array_job_id).all(|j| j.is_finished())
    }

    /// Every task of the array finished successfully.
    pub fn array_complete(&self, array_job_id: u32) -> bool {
        self.array_completed(array_job_id) && self.array_tasks(array_job_id).all(|j| j.completed_ok())
    }

    /// Next pending task of an array after one of its tasks started; used
    /// for array amplification within a cycle.
    pub fn next_pending_array_task(&self, array_job_id: u32) -> Option<JobId> {
        self.array_tasks(array_job_id).filter(|j| j.is_pending()).map(|j| j.id).min()
    }

    /// Singleton dependency test: no other pending/running/suspended job
    /// with the same owner and name and a lower id may exist.
    pub fn singleton_ready(&self, job: &Job) -> bool {
        !self.jobs.values().any(|other| {
            other.id != job.id
                && other.user_id == job.user_id
                && other.name == job.name
                && (other.is_running() || other.is_suspended() || (other.is_pending() && other.id < job.id))
        })
    }
}

/// Shared cluster state: one RwLock per table, plus the narrow mutex used
/// to serialise dependency insertions that touch other jobs' lists.
#[derive(Debug)]
pub struct ClusterState {
    pub jobs: RwLock<JobTable>,
    pub nodes: RwLock<NodeTable>,
    pub parts: RwLock<PartitionTable>,
    pub resvs: RwLock<ReservationTable>,
    pub depend_lock: Mutex<()>,
    /// Set when licenses, reservations or completions changed and another
    /// scheduling pass should run promptly.
    sched_kick: AtomicBool,
    /// Inflight RPC count maintained by the surrounding server; the
    /// scheduler defers cycles when it exceeds max_rpc_cnt.
    rpc_inflight: AtomicUsize,
}

impl ClusterState {
    pub fn new(jobs: JobTable, nodes: NodeTable, parts: PartitionTable, resvs: ReservationTable) -> ClusterState {
        ClusterState {
            jobs: RwLock::new(jobs),
            nodes: RwLock::new(nodes),
            parts: RwLock::new(parts),
            resvs: RwLock::new(resvs),
            depend_lock: Mutex::new(()),
            sched_kick: AtomicBool::new(false),
            rpc_inflight: AtomicUsize::new(0),
        }
    }

    pub fn kick_scheduler(&self) {
        self.sched_kick.store(true, Ordering::SeqCst);
    }

    pub fn take_sched_kick(&self) -> bool {
        self.sched_kick.swap(false, Ordering::SeqCst)
    }

    pub fn set_rpc_inflight(&self, count: usize) {
        self.rpc_inflight.store(count, Ordering::SeqCst);
    }

    pub fn rpc_inflight(&self) -> usize {
        self.rpc_inflight.load(Ordering::SeqCst)
    }
}

/// Job control primitives shared by the gang scheduler, the preemption
/// engine and external user requests. All of them expect the caller to
/// hold the job write lock and pass the table in.
pub mod ops {
    use super::*;

    /// Pause a running job. Returns Ok(false) if it was already suspended.
    pub fn suspend_job(jobs: &mut JobTable, id: JobId, now: i64) -> Result<bool> {
        let job = jobs.get_mut(id).ok_or(Error::JobNotFound(id.0))?;
        match job.state {
            JobState::Suspended => Ok(false),
            JobState::Running => {
                job.state = JobState::Suspended;
                job.suspend_time = now;
                log::debug!("gang: suspending job {}", id);
                Ok(true)
            }
            _ => Err(Error::InvalidJobState(id.0)),
        }
    }

    /// Resume a suspended job. Returns Ok(false) if it was already running.
    pub fn resume_job(jobs: &mut JobTable, id: JobId) -> Result<bool> {
        let job = jobs.get_mut(id).ok_or(Error::JobNotFound(id.0))?;
        match job.state {
            JobState::Running => Ok(false),
            JobState::Suspended => {
                job.state = JobState::Running;
                job.suspend_time = 0;
                log::debug!("gang: resuming job {}", id);
                Ok(true)
            }
            _ => Err(Error::InvalidJobState(id.0)),
        }
    }

    /// Deliver a signal. SIGKILL terminates the job: the record moves to
    /// Cancelled with the completing flag raised until epilog teardown
    /// finishes, and its licenses return to the pool.
    pub fn signal_job(jobs: &mut JobTable, pool: &LicensePool, id: JobId, sig: i32, now: i64) -> Result<()> {
        let job = jobs.get_mut(id).ok_or(Error::JobNotFound(id.0))?;
        job.last_signal = Some(sig);
        if sig != signal::SIGKILL {
            return Ok(());
        }
        if job.is_finished() {
            return Ok(());
        }
        job.state = JobState::Cancelled;
        job.end_time = now;
        job.completing = true;
        job.completing_node_cnt = job.alloc.as_ref().map(|a| a.node_count() as u32).unwrap_or(0);
        pool.job_return(job);
        Ok(())
    }

    /// Return a job to Pending without destroying its record. Licenses are
    /// returned and the allocation dropped.
    pub fn requeue_job(jobs: &mut JobTable, pool: &LicensePool, id: JobId, now: i64) -> Result<()> {
        let job = jobs.get_mut(id).ok_or(Error::JobNotFound(id.0))?;
        if !job.batch || !job.requeue_allowed {
            return Err(Error::InvalidJobState(id.0));
        }
        if !(job.is_running() || job.is_suspended()) {
            return Err(Error::InvalidJobState(id.0));
        }
        pool.job_return(job);
        job.state = JobState::Pending;
        job.reason = Reason::None;
        job.alloc = None;
        job.start_time = 0;
        job.end_time = 0;
        job.preempt_time = 0;
        job.suspend_time = 0;
        job.requeue_count += 1;
        job.licenses_allocated = None;
        // A requeue counts as a fresh submission for age-based policies.
        job.submit_time = now;
        job.begin_time = 0;
        log::info!("job {} requeued", id);
        Ok(())
    }

    /// Deliver the user-configured warning signal, preceded by an implicit
    /// SIGCONT so a suspended process observes it. Without `ignore_time`
    /// the signal is sent only once.
    pub fn send_warn_signal(jobs: &mut JobTable, id: JobId, ignore_time: bool) -> Result<bool> {
        let job = jobs.get_mut(id).ok_or(Error::JobNotFound(id.0))?;
        let Some(warn) = job.warn.as_mut() else {
            return Ok(false);
        };
        if warn.sent && !ignore_time {
            return Ok(false);
        }
        warn.sent = true;
        let sig = warn.signal;
        job.last_signal = Some(sig);
        log::debug!("sent warn signal {} to job {}", sig, id);
        Ok(true)
    }
}
