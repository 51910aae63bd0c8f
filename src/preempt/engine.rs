//! Victim enumeration and the preemption state machine.

use crate::license::pool::{license_list_overlap, LicensePool};
use crate::preempt::policy::PreemptPolicy;
use crate::sched::placement::AccountPolicy;
use crate::state::job::{signal, Job, JobId};
use crate::state::partition::{PartitionTable, PreemptAction};
use crate::state::reservation::ReservationTable;
use crate::state::table::{ops, JobTable};

/// Preemption tuning taken from preempt_params.
#[derive(Debug, Clone, Default)]
pub struct PreemptParams {
    pub youngest_first: bool,
    pub min_exempt_priority: Option<u32>,
    pub send_user_signal: bool,
}

/// Outcome of a preemption attempt against one victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptOutcome {
    /// A grace period is active; the victim was signalled, not stopped.
    GraceActive,
    Done,
    Failed,
}

fn component_ids(job: &Job) -> Vec<JobId> {
    if job.is_het_leader() {
        let mut ids = vec![job.id];
        ids.extend(job.het_components.iter().copied());
        ids
    } else {
        vec![job.id]
    }
}

fn is_exempt_one(
    preemptee: &Job,
    preemptor: &Job,
    parts: &PartitionTable,
    resvs: &ReservationTable,
    policy: &dyn PreemptPolicy,
    acct: &dyn AccountPolicy,
    params: &PreemptParams,
) -> bool {
    if resvs.borrowed_from_resv(preemptee, preemptor) {
        // Running on borrowed reservation time: always a candidate.
    } else if !policy.preemptable(preemptee, preemptor, parts) {
        return true;
    }

    if let Some(min_exempt) = params.min_exempt_priority {
        if min_exempt < preemptee.priority {
            return true;
        }
    }

    // A job must not preempt the job it expands into.
    if preemptor.expanding_job_id == Some(preemptee.id) {
        return true;
    }

    if acct.is_job_preempt_exempt(preemptee) {
        return true;
    }

    false
}

/// Hetjob atomicity: a leader is exempt iff any component is exempt.
fn is_exempt(
    jobs: &JobTable,
    preemptee: &Job,
    preemptor: &Job,
    parts: &PartitionTable,
    resvs: &ReservationTable,
    policy: &dyn PreemptPolicy,
    acct: &dyn AccountPolicy,
    params: &PreemptParams,
) -> bool {
    if !preemptee.is_het_leader() {
        return is_exempt_one(preemptee, preemptor, parts, resvs, policy, acct, params);
    }
    component_ids(preemptee).iter().any(|id| match jobs.get(*id) {
        Some(comp) => is_exempt_one(comp, preemptor, parts, resvs, policy, acct, params),
        None => false,
    })
}

/// Resource contention test: the candidate must be running or suspended
/// and either occupy nodes of the preemptor's partition or hold licenses
/// the preemptor requests.
fn overlaps_preemptor(candidate: &Job, preemptor: &Job, parts: &PartitionTable) -> bool {
    if !(candidate.is_running() || candidate.is_suspended()) {
        return false;
    }
    let node_overlap = match (preemptor.part_key.and_then(|k| parts.get(k)), &candidate.alloc) {
        (Some(part), Some(alloc)) => part.node_bitmap.overlap_any(&alloc.node_bitmap),
        _ => false,
    };
    node_overlap || license_list_overlap(&preemptor.license_list, &candidate.license_list)
}

/// Enumerate preemptable victims for a pending preemptor, ordered most
/// desirable to preempt first (lowest priority, or youngest start time).
pub fn find_preemptable_jobs(
    jobs: &JobTable,
    parts: &PartitionTable,
    resvs: &ReservationTable,
    policy: &dyn PreemptPolicy,
    acct: &dyn AccountPolicy,
    params: &PreemptParams,
    preemptor_id: JobId,
) -> Vec<JobId> {
    let Some(preemptor) = jobs.get(preemptor_id) else {
        log::error!("find_preemptable_jobs: job {} not found", preemptor_id);
        return Vec::new();
    };
    if !preemptor.is_pending() {
        log::error!("find_preemptable_jobs: job {} not pending", preemptor_id);
        return Vec::new();
    }
    if preemptor.part_key.and_then(|k| parts.get(k)).is_none() {
        log::error!("find_preemptable_jobs: job {} has no partition", preemptor_id);
        return Vec::new();
    }
    if !policy.enabled(parts) {
        return Vec::new();
    }

    let mut candidates: Vec<&Job> = Vec::new();
    for (_, candidate) in jobs.iter() {
        // Only the leader of a hetjob is considered; its verdict covers
        // every component.
        if candidate.het_leader.is_some() && !candidate.is_het_leader() {
            continue;
        }
        if is_exempt(jobs, candidate, preemptor, parts, resvs, policy, acct, params) {
            continue;
        }
        if !overlaps_preemptor(candidate, preemptor, parts) {
            continue;
        }
        candidates.push(candidate);
    }

    if params.youngest_first {
        candidates.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    } else {
        candidates.sort_by(|a, b| policy.priority(a).cmp(&policy.priority(b)));
    }
    candidates.into_iter().map(|j| j.id).collect()
}

/// Resolve the stop mode for a victim. For hetjob leaders the first
/// component carrying a mode in the hierarchy Suspend > Requeue wins and
/// propagates to every sibling; the default is Cancel.
pub fn job_preempt_mode(jobs: &JobTable, parts: &PartitionTable, policy: &dyn PreemptPolicy, job_id: JobId) -> PreemptAction {
    let Some(job) = jobs.get(job_id) else {
        return PreemptAction::Off;
    };
    if job.is_het_leader() {
        for wanted in [PreemptAction::Suspend, PreemptAction::Requeue] {
            for id in component_ids(job) {
                if let Some(comp) = jobs.get(id) {
                    if policy.preempt_flags(comp, parts).action() == wanted {
                        return wanted;
                    }
                }
            }
        }
        // No component asks for anything gentler; Cancel is the default.
        return PreemptAction::Cancel;
    }
    policy.preempt_flags(job, parts).action()
}

/// Drive the grace-period machine for one job. Returns -1 while a grace
/// period is active, 1 once the job may be stopped.
fn check_grace_one(
    jobs: &mut JobTable,
    parts: &PartitionTable,
    resvs: &ReservationTable,
    policy: &dyn PreemptPolicy,
    params: &PreemptParams,
    job_id: JobId,
    preemptor_id: JobId,
    now: i64,
) -> i32 {
    let borrowed = match (jobs.get(job_id), jobs.get(preemptor_id)) {
        (Some(job), Some(preemptor)) => resvs.borrowed_from_resv(job, preemptor),
        _ => return 1,
    };
    let grace_time = {
        let job = jobs.get(job_id).expect("checked above");
        if job.preempt_time != 0 {
            // Already in (or past) grace.
            if now >= job.end_time {
                let job = jobs.get_mut(job_id).expect("checked above");
                job.preempt_time = now;
                return 1;
            }
            return -1;
        }
        if borrowed {
            job.warn.as_ref().map(|w| w.warn_time).unwrap_or(0)
        } else {
            policy.grace_time(job, parts)
        }
    };

    let job = jobs.get_mut(job_id).expect("checked above");
    job.preempt_time = now;
    let deadline = now + grace_time as i64;
    job.end_time = if job.end_time == 0 { deadline } else { job.end_time.min(deadline) };

    if grace_time == 0 {
        return 1;
    }
    log::debug!("setting {} sec preemption grace time for job {} to reclaim resources for job {}", grace_time, job_id, preemptor_id);
    let has_warn = job.warn.as_ref().map(|w| !w.sent).unwrap_or(false);
    if params.send_user_signal && has_warn {
        // The warn signal carries an implicit prior SIGCONT.
        let _ = ops::send_warn_signal(jobs, job_id, true);
    } else {
        let job = jobs.get_mut(job_id).expect("checked above");
        job.last_signal = Some(signal::SIGTERM);
    }
    -1
}

/// Grace check for a job or a whole hetjob: every component must be out of
/// grace before the leader may be stopped.
fn check_grace(
    jobs: &mut JobTable,
    parts: &PartitionTable,
    resvs: &ReservationTable,
    policy: &dyn PreemptPolicy,
    params: &PreemptParams,
    job_id: JobId,
    preemptor_id: JobId,
    now: i64,
) -> bool {
    let ids = match jobs.get(job_id) {
        Some(job) => component_ids(job),
        None => return false,
    };
    let mut any_active = false;
    for id in ids {
        if check_grace_one(jobs, parts, resvs, policy, params, id, preemptor_id, now) < 0 {
            any_active = true;
        }
    }
    any_active
}

/// Stop a victim with the given mode. Grace-active victims are signalled
/// and left running; any mode failure falls back to SIGKILL.
pub fn preempt(
    jobs: &mut JobTable,
    pool: &LicensePool,
    parts: &PartitionTable,
    resvs: &ReservationTable,
    policy: &dyn PreemptPolicy,
    params: &PreemptParams,
    job_id: JobId,
    preemptor_id: JobId,
    mode: PreemptAction,
    ignore_time: bool,
    now: i64,
) -> PreemptOutcome {
    if check_grace(jobs, parts, resvs, policy, params, job_id, preemptor_id, now) {
        return PreemptOutcome::GraceActive;
    }

    let ids = match jobs.get(job_id) {
        Some(job) => component_ids(job),
        None => return PreemptOutcome::Failed,
    };

    if params.send_user_signal {
        for id in ids.iter() {
            let _ = ops::send_warn_signal(jobs, *id, ignore_time);
        }
    }

    let mut ok = false;
    match mode {
        PreemptAction::Cancel => {
            ok = true;
            for id in ids.iter() {
                if ops::signal_job(jobs, pool, *id, signal::SIGKILL, now).is_err() {
                    ok = false;
                }
            }
            if ok {
                log::info!("preempted job {} has been killed to reclaim resources for job {}", job_id, preemptor_id);
            }
        }
        PreemptAction::Requeue => {
            ok = true;
            for id in ids.iter() {
                if ops::requeue_job(jobs, pool, *id, now).is_err() {
                    ok = false;
                }
            }
            if ok {
                log::info!("preempted job {} has been requeued to reclaim resources for job {}", job_id, preemptor_id);
            }
        }
        PreemptAction::Suspend => {
            ok = true;
            for id in ids.iter() {
                if ops::suspend_job(jobs, *id, now).is_err() {
                    ok = false;
                }
            }
        }
        PreemptAction::Off => {}
    }

    if !ok {
        // Fall back to SIGKILL on any mode failure.
        let mut killed = true;
        for id in ids.iter() {
            if ops::signal_job(jobs, pool, *id, signal::SIGKILL, now).is_err() {
                killed = false;
            }
        }
        if killed {
            log::info!("preempted job {} had to be killed", job_id);
            return PreemptOutcome::Done;
        }
        log::info!("preempted job {} kill failure", job_id);
        return PreemptOutcome::Failed;
    }
    PreemptOutcome::Done
}
