use gridsched::license::pool::LicensePool;
use gridsched::preempt::engine::{find_preemptable_jobs, job_preempt_mode, preempt, PreemptOutcome, PreemptParams};
use gridsched::preempt::policy::{PartitionPrioPolicy, PreemptPolicy};
use gridsched::sched::placement::PermissiveAccounting;
use gridsched::state::job::{signal, Job, JobAllocation, JobId, JobState, WarnSignal};
use gridsched::state::partition::{PartKey, Partition, PartitionTable, PreemptAction, PreemptFlags};
use gridsched::state::reservation::ReservationTable;
use gridsched::state::table::JobTable;
use gridsched::util::bitmap::NodeBitmap;

const NODE_CNT: usize = 4;

fn make_part(parts: &mut PartitionTable, name: &str, tier: u16, node_indices: &[usize], preempt: PreemptFlags, grace: u32) -> PartKey {
    let mut part = Partition::new(name, tier, NodeBitmap::from_indices(NODE_CNT, node_indices));
    part.preempt = preempt;
    part.grace_time = grace;
    parts.insert(part)
}

fn running_job(id: u32, part: PartKey, priority: u32, node_indices: &[usize], start_time: i64) -> Job {
    let mut job = Job::new(JobId(id), format!("job{}", id), 100, priority);
    job.state = JobState::Running;
    job.part_key = Some(part);
    job.part_keys.push(part);
    job.start_time = start_time;
    job.alloc = Some(JobAllocation { node_bitmap: NodeBitmap::from_indices(NODE_CNT, node_indices), cpus_per_node: vec![4; node_indices.len()], core_bitmap: None });
    job
}

fn pending_job(id: u32, part: PartKey, priority: u32) -> Job {
    let mut job = Job::new(JobId(id), format!("job{}", id), 100, priority);
    job.part_key = Some(part);
    job.part_keys.push(part);
    job
}

/// Grace-period machine: the first attempt signals the victim and reports
/// grace-active; an attempt past the deadline kills it.
#[test]
fn test_grace_period_then_kill() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let pool = LicensePool::new();
    let policy = PartitionPrioPolicy;
    let params = PreemptParams { send_user_signal: true, ..PreemptParams::default() };

    let low = make_part(&mut parts, "low", 1, &[0], PreemptFlags::CANCEL, 30);
    let high = make_part(&mut parts, "high", 10, &[0], PreemptFlags::empty(), 0);

    let mut victim = running_job(1, low, 100, &[0], 900);
    victim.warn = Some(WarnSignal { signal: signal::SIGUSR1, warn_time: 10, sent: false });
    jobs.insert(victim);
    jobs.insert(pending_job(2, high, 5000));

    let out = preempt(&mut jobs, &pool, &parts, &resvs, &policy, &params, JobId(1), JobId(2), PreemptAction::Cancel, false, 1000);
    assert_eq!(out, PreemptOutcome::GraceActive);
    let victim = jobs.get(JobId(1)).unwrap();
    assert_eq!(victim.state, JobState::Running);
    assert_eq!(victim.last_signal, Some(signal::SIGUSR1));
    assert_eq!(victim.end_time, 1030);
    assert_eq!(victim.preempt_time, 1000);

    let out = preempt(&mut jobs, &pool, &parts, &resvs, &policy, &params, JobId(1), JobId(2), PreemptAction::Cancel, false, 1031);
    assert_eq!(out, PreemptOutcome::Done);
    let victim = jobs.get(JobId(1)).unwrap();
    assert_eq!(victim.last_signal, Some(signal::SIGKILL));
    assert!(victim.is_finished());
    assert!(victim.completing);
}

#[test]
fn test_no_grace_kills_immediately() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let pool = LicensePool::new();
    let policy = PartitionPrioPolicy;
    let params = PreemptParams::default();

    let low = make_part(&mut parts, "low", 1, &[0], PreemptFlags::CANCEL, 0);
    let high = make_part(&mut parts, "high", 10, &[0], PreemptFlags::empty(), 0);
    jobs.insert(running_job(1, low, 100, &[0], 900));
    jobs.insert(pending_job(2, high, 5000));

    let out = preempt(&mut jobs, &pool, &parts, &resvs, &policy, &params, JobId(1), JobId(2), PreemptAction::Cancel, false, 1000);
    assert_eq!(out, PreemptOutcome::Done);
    assert!(jobs.get(JobId(1)).unwrap().is_finished());
}

#[test]
fn test_find_preemptable_requires_tier_and_overlap() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let policy = PartitionPrioPolicy;
    let acct = PermissiveAccounting;
    let params = PreemptParams::default();

    let low = make_part(&mut parts, "low", 1, &[0, 1], PreemptFlags::SUSPEND, 0);
    let high = make_part(&mut parts, "high", 10, &[0, 1], PreemptFlags::empty(), 0);
    let elsewhere = make_part(&mut parts, "elsewhere", 1, &[3], PreemptFlags::SUSPEND, 0);

    jobs.insert(running_job(1, low, 100, &[0], 900));
    // Overlapping nodes but same tier as the preemptor: not preemptable.
    jobs.insert(running_job(2, high, 100, &[1], 900));
    // Preemptable tier but no node overlap with the preemptor's partition.
    jobs.insert(running_job(3, elsewhere, 100, &[3], 900));
    jobs.insert(pending_job(10, high, 5000));

    let victims = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &params, JobId(10));
    assert_eq!(victims, vec![JobId(1)]);
}

/// Victims are ordered least valuable first: by priority, or youngest
/// first when configured.
#[test]
fn test_victim_ordering() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let policy = PartitionPrioPolicy;
    let acct = PermissiveAccounting;

    let low = make_part(&mut parts, "low", 1, &[0, 1], PreemptFlags::SUSPEND, 0);
    let high = make_part(&mut parts, "high", 10, &[0, 1], PreemptFlags::empty(), 0);
    jobs.insert(running_job(1, low, 500, &[0], 100));
    jobs.insert(running_job(2, low, 100, &[1], 200));
    jobs.insert(pending_job(10, high, 5000));

    let by_prio = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &PreemptParams::default(), JobId(10));
    assert_eq!(by_prio, vec![JobId(2), JobId(1)]);

    let params = PreemptParams { youngest_first: true, ..PreemptParams::default() };
    let by_age = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &params, JobId(10));
    assert_eq!(by_age, vec![JobId(2), JobId(1)]);

    // Make job 1 the younger one; youngest_first flips the order.
    jobs.get_mut(JobId(1)).unwrap().start_time = 300;
    let by_age = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &params, JobId(10));
    assert_eq!(by_age, vec![JobId(1), JobId(2)]);
}

#[test]
fn test_min_exempt_priority_shields_high_priority_victims() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let policy = PartitionPrioPolicy;
    let acct = PermissiveAccounting;

    let low = make_part(&mut parts, "low", 1, &[0, 1], PreemptFlags::SUSPEND, 0);
    let high = make_part(&mut parts, "high", 10, &[0, 1], PreemptFlags::empty(), 0);
    jobs.insert(running_job(1, low, 200_000, &[0], 100));
    jobs.insert(running_job(2, low, 50, &[1], 100));
    jobs.insert(pending_job(10, high, 5000));

    let params = PreemptParams { min_exempt_priority: Some(100_000), ..PreemptParams::default() };
    let victims = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &params, JobId(10));
    assert_eq!(victims, vec![JobId(2)]);
}

/// A hetjob leader is preemptable iff every component is preemptable.
#[test]
fn test_hetjob_atomic_exemption() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let policy = PartitionPrioPolicy;
    let acct = PermissiveAccounting;
    let params = PreemptParams::default();

    let low = make_part(&mut parts, "low", 1, &[0, 1], PreemptFlags::SUSPEND, 0);
    let shielded = make_part(&mut parts, "shielded", 1, &[2], PreemptFlags::empty(), 0);
    let high = make_part(&mut parts, "high", 10, &[0, 1, 2], PreemptFlags::empty(), 0);

    let mut leader = running_job(1, low, 100, &[0], 900);
    leader.het_components = vec![JobId(2)];
    jobs.insert(leader);
    let mut comp = running_job(2, shielded, 100, &[2], 900);
    comp.het_leader = Some(JobId(1));
    jobs.insert(comp);
    jobs.insert(pending_job(10, high, 5000));

    // One component sits in a partition without a preempt mode: the whole
    // hetjob is exempt.
    let victims = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &params, JobId(10));
    assert!(victims.is_empty());

    // Once every component is preemptable, only the leader is returned.
    parts.get_mut(shielded).unwrap().preempt = PreemptFlags::SUSPEND;
    let victims = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &params, JobId(10));
    assert_eq!(victims, vec![JobId(1)]);
}

/// The first hetjob component with a mode in the hierarchy
/// Suspend > Requeue decides the mode for all siblings; Cancel otherwise.
#[test]
fn test_hetjob_preempt_mode_hierarchy() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let policy = PartitionPrioPolicy;

    let cancel_part = make_part(&mut parts, "c", 1, &[0], PreemptFlags::CANCEL, 0);
    let requeue_part = make_part(&mut parts, "r", 1, &[1], PreemptFlags::REQUEUE, 0);
    let suspend_part = make_part(&mut parts, "s", 1, &[2], PreemptFlags::SUSPEND, 0);

    let mut leader = running_job(1, cancel_part, 100, &[0], 900);
    leader.het_components = vec![JobId(2), JobId(3)];
    jobs.insert(leader);
    let mut c2 = running_job(2, requeue_part, 100, &[1], 900);
    c2.het_leader = Some(JobId(1));
    jobs.insert(c2);
    let mut c3 = running_job(3, cancel_part, 100, &[0], 900);
    c3.het_leader = Some(JobId(1));
    jobs.insert(c3);

    assert_eq!(job_preempt_mode(&jobs, &parts, &policy, JobId(1)), PreemptAction::Requeue);

    jobs.get_mut(JobId(3)).unwrap().part_key = Some(suspend_part);
    assert_eq!(job_preempt_mode(&jobs, &parts, &policy, JobId(1)), PreemptAction::Suspend);
}

/// Requeue mode returns the victim to Pending without destroying it; a
/// failure of the requested mode falls back to SIGKILL.
#[test]
fn test_requeue_mode_and_kill_fallback() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let pool = LicensePool::new();
    let policy = PartitionPrioPolicy;
    let params = PreemptParams::default();

    let low = make_part(&mut parts, "low", 1, &[0, 1], PreemptFlags::REQUEUE, 0);
    let high = make_part(&mut parts, "high", 10, &[0, 1], PreemptFlags::empty(), 0);
    jobs.insert(running_job(1, low, 100, &[0], 900));
    let mut no_requeue = running_job(2, low, 100, &[1], 900);
    no_requeue.requeue_allowed = false;
    jobs.insert(no_requeue);
    jobs.insert(pending_job(10, high, 5000));

    let out = preempt(&mut jobs, &pool, &parts, &resvs, &policy, &params, JobId(1), JobId(10), PreemptAction::Requeue, false, 1000);
    assert_eq!(out, PreemptOutcome::Done);
    let requeued = jobs.get(JobId(1)).unwrap();
    assert_eq!(requeued.state, JobState::Pending);
    assert!(requeued.alloc.is_none());

    let out = preempt(&mut jobs, &pool, &parts, &resvs, &policy, &params, JobId(2), JobId(10), PreemptAction::Requeue, false, 1000);
    assert_eq!(out, PreemptOutcome::Done);
    let killed = jobs.get(JobId(2)).unwrap();
    assert_eq!(killed.last_signal, Some(signal::SIGKILL));
    assert!(killed.is_finished());
}

#[test]
fn test_expand_target_is_exempt() {
    let mut jobs = JobTable::new();
    let mut parts = PartitionTable::new();
    let resvs = ReservationTable::new();
    let policy = PartitionPrioPolicy;
    let acct = PermissiveAccounting;
    let params = PreemptParams::default();

    let low = make_part(&mut parts, "low", 1, &[0, 1], PreemptFlags::SUSPEND, 0);
    let high = make_part(&mut parts, "high", 10, &[0, 1], PreemptFlags::empty(), 0);
    jobs.insert(running_job(1, low, 100, &[0], 900));
    let mut grower = pending_job(10, high, 5000);
    grower.expanding_job_id = Some(JobId(1));
    jobs.insert(grower);

    let victims = find_preemptable_jobs(&jobs, &parts, &resvs, &policy, &acct, &params, JobId(10));
    assert!(victims.is_empty());
}
