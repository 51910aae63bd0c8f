//! Prolog/epilog interlock.
//!
//! The scripts run detached from the scheduler loop; only their completion
//! interlocks with scheduling: a finished epilog clears the Completing
//! flag once the job's node count reaches zero and kicks the scheduler,
//! and a failed prolog requeues the job once before killing it.

use std::process::Command;
use std::sync::Arc;
use std::thread;

use crate::license::pool::LicensePool;
use crate::state::job::{signal, JobId, Reason};
use crate::state::table::{ops, ClusterState, JobTable};
use crate::util::clock::Clock;

pub struct HookExecutor {
    state: Arc<ClusterState>,
    pool: Arc<LicensePool>,
    clock: Box<dyn Clock>,
    prolog_path: Option<String>,
    epilog_path: Option<String>,
}

impl HookExecutor {
    pub fn new(state: Arc<ClusterState>, pool: Arc<LicensePool>, clock: Box<dyn Clock>, prolog_path: Option<String>, epilog_path: Option<String>) -> HookExecutor {
        HookExecutor { state, pool, clock, prolog_path, epilog_path }
    }

    fn run_script(path: &str, job_id: JobId) -> bool {
        let status = Command::new(path).env("GRIDSCHED_JOB_ID", job_id.to_string()).status();
        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                log::error!("hook {} for job {} exit status {:?}", path, job_id, status.code());
                false
            }
            Err(e) => {
                log::error!("hook {} for job {} failed to spawn: {}", path, job_id, e);
                false
            }
        }
    }

    /// Launch the prolog for a started job on a detached thread. The loop
    /// must tolerate arbitrary interleaving with the completion path.
    pub fn run_prolog(&self, job_id: JobId) {
        let Some(path) = self.prolog_path.clone() else {
            return;
        };
        {
            let mut jobs = self.state.jobs.write().expect("job lock poisoned");
            if let Some(job) = jobs.get_mut(job_id) {
                job.prolog_running = true;
            }
        }
        let state = Arc::clone(&self.state);
        let pool = Arc::clone(&self.pool);
        let clock = self.clock.clone_box();
        thread::spawn(move || {
            let ok = Self::run_script(&path, job_id);
            let mut jobs = state.jobs.write().expect("job lock poisoned");
            let now = clock.now_secs();
            if let Some(job) = jobs.get_mut(job_id) {
                job.prolog_running = false;
            }
            if !ok {
                prolog_failed(&mut jobs, &pool, job_id, now);
                state.kick_scheduler();
            }
        });
    }

    /// Launch the epilog for a completing job on a detached thread.
    pub fn run_epilog(&self, job_id: JobId) {
        let Some(path) = self.epilog_path.clone() else {
            return;
        };
        {
            let mut jobs = self.state.jobs.write().expect("job lock poisoned");
            if let Some(job) = jobs.get_mut(job_id) {
                job.epilog_running = true;
            }
        }
        let state = Arc::clone(&self.state);
        thread::spawn(move || {
            let ok = Self::run_script(&path, job_id);
            if !ok {
                log::error!("epilog for job {} failed", job_id);
            }
            let mut jobs = state.jobs.write().expect("job lock poisoned");
            if let Some(job) = jobs.get_mut(job_id) {
                job.epilog_running = false;
                if job.completing_node_cnt == 0 && job.completing {
                    job.completing = false;
                    state.kick_scheduler();
                }
            }
        });
    }
}

/// A node finished tearing down a completing job. Once the count reaches
/// zero (and no epilog is still running) the Completing flag clears and
/// the scheduler is kicked.
pub fn epilog_complete(state: &ClusterState, jobs: &mut JobTable, job_id: JobId) {
    let Some(job) = jobs.get_mut(job_id) else {
        return;
    };
    if job.completing_node_cnt > 0 {
        job.completing_node_cnt -= 1;
    }
    if job.completing_node_cnt == 0 && !job.epilog_running && job.completing {
        job.completing = false;
        state.kick_scheduler();
    }
}

/// A failed prolog requeues the job exactly once; a second failure kills
/// it and surfaces the launch failure through its reason code.
pub fn prolog_failed(jobs: &mut JobTable, pool: &LicensePool, job_id: JobId, now: i64) {
    let requeued = jobs.get(job_id).map(|j| j.requeue_count).unwrap_or(0);
    if requeued == 0 {
        if ops::requeue_job(jobs, pool, job_id, now).is_ok() {
            log::info!("job {} requeued after prolog failure", job_id);
            return;
        }
    }
    let _ = ops::signal_job(jobs, pool, job_id, signal::SIGKILL, now);
    if let Some(job) = jobs.get_mut(job_id) {
        job.reason = Reason::LaunchFailed;
    }
    log::info!("job {} killed after repeated prolog failure", job_id);
}
