//! Queue construction and ordering for one scheduling cycle.

use std::time::Instant;

use crate::preempt::policy::PreemptPolicy;
use crate::sched::dependency::{test_job_dependency, DependCache, DependResult};
use crate::state::job::{Job, JobId, Reason};
use crate::state::partition::{PartKey, Partition, PartitionTable};
use crate::state::table::JobTable;

/// One (job, partition, priority) triple. Multi-partition submissions
/// produce one record per candidate partition.
#[derive(Debug, Clone)]
pub struct JobQueueRec {
    pub job_id: JobId,
    pub part_key: PartKey,
    pub priority: u32,
}

/// Partition-level limit check; the returned reason is None when the job
/// may run in this partition.
pub fn job_limits_check(job: &Job, part: &Partition) -> Reason {
    if !part.state_up {
        return Reason::PartitionDown;
    }
    if job.request.min_nodes > part.max_nodes || (job.request.max_nodes != 0 && job.request.max_nodes < part.min_nodes) {
        return Reason::PartitionNodeLimit;
    }
    if let (Some(limit), Some(part_max)) = (job.time_limit_secs, part.max_time_secs) {
        if limit > part_max {
            return Reason::PartitionTimeLimit;
        }
    }
    Reason::None
}

/// Job-level runnability, excluding partition-specific tests. Updates the
/// job's reason and may transition it to Failed on a failed dependency.
fn job_runnable_test1(jobs: &mut JobTable, job_id: JobId, cache: &mut DependCache, now: i64, clear_start: bool) -> bool {
    {
        let Some(job) = jobs.get(job_id) else {
            return false;
        };
        if !job.is_pending() || job.completing {
            return false;
        }
        if job.epilog_running {
            // Requeued while the previous run is still being cleaned up.
            let job = jobs.get_mut(job_id).expect("job vanished in queue build");
            job.reason = Reason::Cleaning;
            log::debug!("sched: job {} pending, reason cleaning", job_id);
            return false;
        }
    }

    let independent = match test_job_dependency(jobs, job_id, cache, now) {
        DependResult::Ready => true,
        DependResult::Waiting => {
            let job = jobs.get_mut(job_id).expect("job vanished in queue build");
            job.reason = Reason::Dependency;
            false
        }
        DependResult::Failed => {
            // afterok against a failed target (or afternotok against a
            // successful one) can never be satisfied.
            let job = jobs.get_mut(job_id).expect("job vanished in queue build");
            job.fail_never_runnable(Reason::DependencyNeverSatisfied, now);
            log::info!("sched: job {} dependency never satisfied", job_id);
            return false;
        }
    };

    let job = jobs.get_mut(job_id).expect("job vanished in queue build");
    if clear_start {
        job.start_time = 0;
    }
    if job.is_held() {
        if !matches!(job.reason, Reason::BadConstraints | Reason::Held | Reason::HeldUser | Reason::MaxRequeue) {
            job.reason = Reason::Held;
        }
        log::debug!("sched: job {} held, priority zero", job_id);
        return false;
    }
    if independent && job.begin_time > now {
        job.reason = Reason::BeginTime;
        return false;
    }
    if !independent && matches!(job.reason, Reason::Held | Reason::HeldUser) {
        // Released behind an active dependency.
        job.reason = Reason::Dependency;
    }
    independent
}

/// Walk the job table once and materialise the queue of candidate
/// (job, partition, priority) records. A 100-job cadence check against
/// `build_queue_timeout` (microseconds) bounds tail latency.
pub fn build_job_queue(
    jobs: &mut JobTable,
    parts: &PartitionTable,
    cache: &mut DependCache,
    now: i64,
    build_queue_timeout_us: i64,
    clear_start: bool,
) -> Vec<JobQueueRec> {
    let mut queue = Vec::new();
    let start = Instant::now();
    let mut tested_jobs = 0usize;
    let total = jobs.len();

    for job_id in jobs.ids() {
        if tested_jobs % 100 == 0 && start.elapsed().as_micros() as i64 >= build_queue_timeout_us {
            log::info!("build_job_queue ran past {} usec, exiting with {} of {} jobs tested", build_queue_timeout_us, tested_jobs, total);
            break;
        }
        tested_jobs += 1;

        if let Some(job) = jobs.get_mut(job_id) {
            job.preempt_in_progress = false;
        }
        if !job_runnable_test1(jobs, job_id, cache, now, clear_start) {
            continue;
        }

        let job = jobs.get(job_id).expect("job vanished in queue build");
        if job.part_keys.len() > 1 {
            let part_keys = job.part_keys.clone();
            let priority_vector = job.priority_vector.clone();
            let priority = job.priority;
            for (inx, part_key) in part_keys.iter().enumerate() {
                let Some(part) = parts.get(*part_key) else {
                    continue;
                };
                let job = jobs.get_mut(job_id).expect("job vanished in queue build");
                let reason = job_limits_check(job, part);
                if reason != Reason::None {
                    if reason != job.reason {
                        job.reason = reason;
                    }
                    continue;
                }
                // The priority vector is indexed by partition-list position.
                let prio = priority_vector.as_ref().and_then(|v| v.get(inx).copied()).unwrap_or(priority);
                queue.push(JobQueueRec { job_id, part_key: *part_key, priority: prio });
            }
        } else {
            let Some(part_key) = job.part_key.or_else(|| job.part_keys.first().copied()) else {
                log::error!("job {} has no partition", job_id);
                continue;
            };
            let Some(part) = parts.get(part_key) else {
                log::error!("partition missing for job {}", job_id);
                continue;
            };
            let reason = job_limits_check(job, part);
            let priority = job.priority;
            if reason != Reason::None {
                let job = jobs.get_mut(job_id).expect("job vanished in queue build");
                job.reason = reason;
                continue;
            }
            queue.push(JobQueueRec { job_id, part_key, priority });
        }
    }
    queue
}

/// Total order over queue records, highest first:
/// preemption predicate, reservation presence, partition priority tier,
/// per-partition job priority, then lower job id as the stable tie-break.
pub fn sort_job_queue(queue: &mut Vec<JobQueueRec>, jobs: &JobTable, parts: &PartitionTable, policy: &dyn PreemptPolicy) {
    // Skipping the predicate entirely is the fast path when preemption is
    // disabled cluster-wide.
    let preemption_enabled = policy.enabled(parts);

    queue.sort_by(|a, b| {
        let (Some(job_a), Some(job_b)) = (jobs.get(a.job_id), jobs.get(b.job_id)) else {
            return a.job_id.cmp(&b.job_id);
        };
        let (part_a, part_b) = (parts.get(a.part_key), parts.get(b.part_key));

        if preemption_enabled {
            if let (Some(pa), Some(pb)) = (part_a, part_b) {
                if policy.job_preempt_check((job_a, pa), (job_b, pb)) {
                    return std::cmp::Ordering::Less;
                }
                if policy.job_preempt_check((job_b, pb), (job_a, pa)) {
                    return std::cmp::Ordering::Greater;
                }
            }
        }

        let has_resv_a = job_a.resv_key.is_some();
        let has_resv_b = job_b.resv_key.is_some();
        if has_resv_a != has_resv_b {
            return has_resv_b.cmp(&has_resv_a);
        }

        if let (Some(pa), Some(pb)) = (part_a, part_b) {
            if pa.priority_tier != pb.priority_tier {
                return pb.priority_tier.cmp(&pa.priority_tier);
            }
        }

        let prio_a = if job_a.part_keys.len() > 1 && job_a.priority_vector.is_some() { a.priority } else { job_a.priority };
        let prio_b = if job_b.part_keys.len() > 1 && job_b.priority_vector.is_some() { b.priority } else { job_b.priority };
        if prio_a != prio_b {
            return prio_b.cmp(&prio_a);
        }

        a.job_id.cmp(&b.job_id)
    });
}
