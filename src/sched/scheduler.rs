//! The main scheduling cycle: build a queue, rank it, and drive candidate
//! jobs through policy, dependency, license and placement checks until the
//! queue is exhausted or a cutoff is reached.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::gang::GangScheduler;
use crate::license::pool::{LicensePool, LicenseTest};
use crate::preempt::engine::{self, PreemptParams};
use crate::preempt::policy::PreemptPolicy;
use crate::sched::dependency::DependCache;
use crate::sched::placement::{AccountPolicy, NodeSelector, SelectOutcome};
use crate::sched::queue::{build_job_queue, sort_job_queue, JobQueueRec};
use crate::state::job::{JobId, JobState, Reason};
use crate::state::partition::PartKey;
use crate::state::reservation::ResvKey;
use crate::state::table::{ClusterState, JobTable};
use crate::util::clock::Clock;

/// Diagnostic counters, logged at the end of each cycle.
#[derive(Debug, Default, Clone)]
pub struct SchedStats {
    pub cycles: u64,
    pub last_queue_len: usize,
    pub cycle_depth: u64,
    pub jobs_started: u64,
}

pub struct Scheduler {
    state: Arc<ClusterState>,
    pool: Arc<LicensePool>,
    selector: Box<dyn NodeSelector>,
    policy: Arc<dyn PreemptPolicy>,
    acct: Box<dyn AccountPolicy>,
    gang: Option<Arc<GangScheduler>>,
    clock: Box<dyn Clock>,
    config: SchedulerConfig,
    stats: SchedStats,
    last_sched_time: i64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<ClusterState>,
        pool: Arc<LicensePool>,
        selector: Box<dyn NodeSelector>,
        policy: Arc<dyn PreemptPolicy>,
        acct: Box<dyn AccountPolicy>,
        gang: Option<Arc<GangScheduler>>,
        clock: Box<dyn Clock>,
        config: SchedulerConfig,
    ) -> Scheduler {
        Scheduler { state, pool, selector, policy, acct, gang, clock, config, stats: SchedStats::default(), last_sched_time: 0 }
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn preempt_params(&self) -> PreemptParams {
        PreemptParams {
            youngest_first: self.config.preempt_youngest_first,
            min_exempt_priority: self.config.min_exempt_priority,
            send_user_signal: self.config.preempt_send_user_signal,
        }
    }

    /// True when some job still holds the completing flag recently enough
    /// to suppress a cycle (resource-fragmentation avoidance).
    fn job_is_completing(&self, jobs: &JobTable, now: i64) -> bool {
        let recent = now - self.config.complete_wait;
        jobs.iter().any(|(_, job)| job.completing && (self.config.complete_wait == 0 || job.end_time >= recent))
    }

    /// Ordered victim list for a pending preemptor (external entry point).
    pub fn find_preemptable_jobs(&self, preemptor: JobId) -> Vec<JobId> {
        let jobs = self.state.jobs.read().expect("job lock poisoned");
        let parts = self.state.parts.read().expect("partition lock poisoned");
        let resvs = self.state.resvs.read().expect("reservation lock poisoned");
        engine::find_preemptable_jobs(&jobs, &parts, &resvs, self.policy.as_ref(), self.acct.as_ref(), &self.preempt_params(), preemptor)
    }

    /// Event-driven entry point (submission, completion, license or
    /// reservation change): runs a cycle unless one ran within the last
    /// `batch_sched_delay` seconds.
    pub fn schedule_if_due(&mut self) -> usize {
        let now = self.clock.now_secs();
        if self.last_sched_time != 0 && now - self.last_sched_time < self.config.batch_sched_delay {
            log::debug!("sched: cycle deferred by batch_sched_delay");
            return 0;
        }
        self.schedule(0)
    }

    /// Run one scheduling cycle; returns the number of jobs started.
    /// `job_limit` of zero means the configured default queue depth.
    pub fn schedule(&mut self, job_limit: u32) -> usize {
        let defer_rpc_cnt = self.config.max_rpc_cnt as usize;
        if defer_rpc_cnt > 0 && self.state.rpc_inflight() >= defer_rpc_cnt {
            log::debug!("sched: cycle deferred, too many RPCs");
            return 0;
        }
        let job_limit = if job_limit == 0 { self.config.default_queue_depth } else { job_limit };

        let mut jobs = self.state.jobs.write().expect("job lock poisoned");
        let nodes = self.state.nodes.read().expect("node lock poisoned");
        let parts = self.state.parts.read().expect("partition lock poisoned");
        let resvs = self.state.resvs.read().expect("reservation lock poisoned");

        let sched_start = self.clock.now_secs();
        let now = sched_start;
        self.last_sched_time = now;
        self.stats.cycles += 1;

        if !nodes.any_available() {
            for (_, job) in jobs.iter_mut() {
                if job.is_pending() && matches!(job.reason, Reason::None | Reason::Resources) {
                    job.reason = Reason::FrontEndDown;
                }
            }
            log::debug!("sched: cycle abandoned, no nodes available to accept jobs");
            return 0;
        }

        // Avoid fragmentation: wait for teardown to finish first.
        if !self.config.wiki_compat && self.job_is_completing(&jobs, now) {
            log::debug!("sched: cycle skipped, some job is still completing");
            return 0;
        }

        // Per-cycle copy; failed-partition masking mutates only this.
        let mut avail = nodes.avail_bitmap();

        let mut cache = DependCache::new();
        let mut queue = build_job_queue(&mut jobs, &parts, &mut cache, now, self.config.build_queue_timeout, false);
        self.stats.last_queue_len = queue.len();
        sort_job_queue(&mut queue, &jobs, &parts, self.policy.as_ref());

        let mut failed_parts: HashSet<PartKey> = HashSet::new();
        let mut failed_resv: HashSet<ResvKey> = HashSet::new();
        let mut part_job_cnt: HashMap<PartKey, u32> = HashMap::new();
        let mut reject_array: Option<(u32, PartKey, Reason)> = None;
        let mut job_cnt = 0usize;
        let mut job_depth = 0u32;
        let preempt_params = self.preempt_params();

        log::debug!("sched: running job scheduler over {} queue records", queue.len());

        let mut pending: std::collections::VecDeque<JobQueueRec> = queue.into();
        while let Some(rec) = pending.pop_front() {
            // Cycle cutoffs come first on every iteration.
            if self.clock.now_secs() - sched_start >= self.config.max_sched_time {
                log::debug!("sched: loop taking too long, breaking out");
                break;
            }
            if self.config.sched_max_job_start > 0 && job_cnt as u32 >= self.config.sched_max_job_start {
                log::debug!("sched: sched_max_job_start reached, breaking out");
                break;
            }
            if job_depth >= job_limit {
                log::debug!("sched: already tested {} jobs, breaking out", job_depth);
                break;
            }
            if defer_rpc_cnt > 0 && self.state.rpc_inflight() >= defer_rpc_cnt {
                log::debug!("sched: cycle interrupted, too many RPCs");
                break;
            }

            let mut job_id = rec.job_id;
            let part_key = rec.part_key;
            {
                let Some(job) = jobs.get_mut(job_id) else {
                    continue;
                };
                if !job.is_pending() {
                    // Started in another partition.
                    continue;
                }
                if job.preempt_in_progress {
                    continue;
                }
                job.part_key = Some(part_key);
            }

            // Array-task amplification: after a start, try the next task
            // of the same array before the next unrelated record.
            let mut is_array_head = jobs.get(job_id).map(|j| j.is_array_task()).unwrap_or(false);

            'next_task: loop {
                if self.clock.now_secs() - sched_start >= self.config.max_sched_time {
                    break;
                }
                if self.config.sched_max_job_start > 0 && job_cnt as u32 >= self.config.sched_max_job_start {
                    break;
                }
                job_depth += 1;
                if job_depth > job_limit {
                    break;
                }
                self.stats.cycle_depth += 1;

                let (array_job_id, resv_key, min_nodes, max_nodes) = {
                    let job = jobs.get(job_id).expect("queued job vanished");
                    (
                        job.array_job_id,
                        job.resv_key,
                        job.request.min_nodes,
                        if job.request.max_nodes == 0 { job.request.min_nodes } else { job.request.max_nodes },
                    )
                };

                // A rejected array element rejects its whole array for the
                // cycle; remaining elements inherit the reason.
                if let (Some(array_id), Some((rej_id, rej_part, rej_reason))) = (array_job_id, reject_array) {
                    if rej_id == array_id && rej_part == part_key {
                        let job = jobs.get_mut(job_id).expect("queued job vanished");
                        job.reason = rej_reason;
                        break;
                    }
                }

                if self.config.partition_job_depth > 0 {
                    let cnt = part_job_cnt.entry(part_key).or_insert(0);
                    if *cnt >= self.config.partition_job_depth {
                        log::debug!("sched: reached partition job depth");
                        let job = jobs.get_mut(job_id).expect("queued job vanished");
                        if job.reason == Reason::None {
                            job.reason = Reason::Priority;
                        }
                        break;
                    }
                    *cnt += 1;
                }

                // Subsequent jobs in a failed reservation or partition are
                // skipped rather than retried.
                if let Some(resv) = resv_key {
                    if failed_resv.contains(&resv) {
                        let job = jobs.get_mut(job_id).expect("queued job vanished");
                        if job.reason == Reason::None {
                            job.reason = Reason::Priority;
                        }
                        break;
                    }
                } else if failed_parts.contains(&part_key) {
                    let job = jobs.get_mut(job_id).expect("queued job vanished");
                    if matches!(job.reason, Reason::None | Reason::Resources) {
                        job.reason = Reason::Priority;
                    }
                    break;
                }

                // Account and QoS validity are retested every pass.
                {
                    let job = jobs.get_mut(job_id).expect("queued job vanished");
                    if job.reason == Reason::InvalidAccount {
                        if self.acct.validate_account(job) {
                            job.reason = Reason::None;
                        } else {
                            log::debug!("sched: job {} has invalid account", job_id);
                            job.reason = Reason::AssocResourceLimit;
                            break;
                        }
                    }
                    if !self.acct.qos_valid(job) {
                        log::debug!("sched: job {} has invalid QoS", job_id);
                        job.reason = Reason::InvalidQos;
                        break;
                    } else if job.reason == Reason::InvalidQos {
                        job.reason = Reason::None;
                    }
                    if !self.acct.job_runnable_pre_select(job) {
                        break;
                    }
                }

                // Required nodes must all be available this cycle.
                {
                    let job = jobs.get(job_id).expect("queued job vanished");
                    if let Some(req) = &job.request.required_nodes {
                        if !req.is_subset_of(&avail) {
                            break;
                        }
                    }
                }

                let part = parts.get(part_key).expect("queued partition vanished");
                // A request the partition could never satisfy goes to the
                // selector, which reports it permanently infeasible; the
                // shortage test here covers only the transient case.
                if min_nodes <= part.node_bitmap.count() as u32 {
                    let overlap = avail.overlap_count(&part.node_bitmap) as u32;
                    if overlap < min_nodes {
                        // Too many nodes down, drained, or claimed by higher
                        // priority partitions.
                        let job = jobs.get_mut(job_id).expect("queued job vanished");
                        job.reason = Reason::Resources;
                        log::debug!("sched: job {} waiting on resources in {}", job_id, part.name);
                        break;
                    }
                }

                match {
                    let job = jobs.get_mut(job_id).expect("queued job vanished");
                    self.pool.job_test(job, now, true)
                } {
                    LicenseTest::Busy => {
                        let job = jobs.get_mut(job_id).expect("queued job vanished");
                        job.reason = Reason::Licenses;
                        log::debug!("sched: job {} waiting on licenses", job_id);
                        break;
                    }
                    LicenseTest::Never => {
                        let job = jobs.get_mut(job_id).expect("queued job vanished");
                        if !self.config.wiki_compat {
                            job.fail_never_runnable(Reason::Licenses, now);
                            log::info!("sched: job {} requests more licenses than configured", job_id);
                        } else {
                            job.reason = Reason::Licenses;
                        }
                        break;
                    }
                    LicenseTest::Ok => {}
                }

                if !self.acct.validate_account(jobs.get(job_id).expect("queued job vanished")) {
                    // Account disabled between submit and start; rare.
                    log::info!("sched: job {} has invalid account", job_id);
                    let job = jobs.get_mut(job_id).expect("queued job vanished");
                    job.reason = Reason::InvalidAccount;
                    break;
                }

                // Hierarchical licenses shrink the candidate node set.
                let mut job_avail = avail.clone();
                {
                    let job = jobs.get(job_id).expect("queued job vanished");
                    self.pool.hres_filter(job, &mut job_avail);
                }

                let mut preemptees: Vec<JobId> = Vec::new();
                if self.policy.enabled(&parts) {
                    preemptees = engine::find_preemptable_jobs(
                        &jobs,
                        &parts,
                        &resvs,
                        self.policy.as_ref(),
                        self.acct.as_ref(),
                        &preempt_params,
                        job_id,
                    );
                }

                let outcome = {
                    let job = jobs.get(job_id).expect("queued job vanished");
                    let req = job.request.required_nodes.clone();
                    self.selector.select(job, part, &job_avail, min_nodes, max_nodes, req.as_ref(), &nodes, &jobs, &mut preemptees)
                };

                match outcome {
                    SelectOutcome::Allocated(alloc) => {
                        // Stop the victims the selector needed removed.
                        for victim in preemptees.iter() {
                            let mode = engine::job_preempt_mode(&jobs, &parts, self.policy.as_ref(), *victim);
                            let out = engine::preempt(
                                &mut jobs,
                                &self.pool,
                                &parts,
                                &resvs,
                                self.policy.as_ref(),
                                &preempt_params,
                                *victim,
                                job_id,
                                mode,
                                false,
                                now,
                            );
                            log::debug!("sched: preempted job {} for job {}: {:?}", victim, job_id, out);
                            if let Some(v) = jobs.get_mut(*victim) {
                                v.preempt_in_progress = true;
                            }
                        }

                        {
                            let job = jobs.get_mut(job_id).expect("queued job vanished");
                            job.alloc = Some(alloc);
                            if let Err(e) = self.pool.job_get(job, false, now) {
                                // Tested available moments ago; internal
                                // inconsistency. Skip the job this cycle.
                                log::error!("sched: license allocation failed for job {}: {}", job_id, e);
                                job.alloc = None;
                                break;
                            }
                            job.state = JobState::Running;
                            job.reason = Reason::None;
                            job.start_time = now;
                            job.end_time = job.time_limit_secs.map(|l| now + l).unwrap_or(0);
                            // The chosen partition becomes primary.
                            job.part_key = Some(part_key);
                            if let Some(pos) = job.part_keys.iter().position(|&k| k == part_key) {
                                job.part_keys.remove(pos);
                            }
                            job.part_keys.insert(0, part_key);
                            log::info!("sched: allocate job {} nodes={:?}", job_id, job.alloc.as_ref().map(|a| a.node_count()));
                        }
                        if let Some(gang) = &self.gang {
                            gang.job_started(&mut jobs, &nodes, &parts, job_id);
                        }
                        job_cnt += 1;
                        reject_array = None;

                        if is_array_head {
                            if let Some(array_id) = array_job_id {
                                if let Some(next) = jobs.next_pending_array_task(array_id) {
                                    job_id = next;
                                    let job = jobs.get_mut(job_id).expect("array task vanished");
                                    job.part_key = Some(part_key);
                                    is_array_head = true;
                                    continue 'next_task;
                                }
                            }
                        }
                    }
                    SelectOutcome::NodesBusy => {
                        let mut fail_by_part = true;
                        {
                            let job = jobs.get(job_id).expect("queued job vanished");
                            if let Some(req) = &job.request.required_nodes {
                                if req.count() as u32 >= min_nodes {
                                    // Block only the required nodes, not
                                    // the whole partition.
                                    fail_by_part = false;
                                    avail.and_not_assign(req);
                                }
                            }
                        }
                        if fail_by_part {
                            if let Some(resv) = resv_key {
                                // Poison the reservation, not the partition.
                                fail_by_part = false;
                                failed_resv.insert(resv);
                            }
                        }
                        if fail_by_part && self.config.bf_min_age_reserve > 0 {
                            // A recently submitted job does not poison its
                            // partition.
                            let job = jobs.get(job_id).expect("queued job vanished");
                            if job.begin_time == 0 || now - job.begin_time < self.config.bf_min_age_reserve {
                                fail_by_part = false;
                            }
                        }
                        if fail_by_part {
                            failed_parts.insert(part_key);
                            avail.and_not_assign(&part.node_bitmap);
                        }
                        let job = jobs.get_mut(job_id).expect("queued job vanished");
                        if job.reason == Reason::None {
                            job.reason = Reason::Resources;
                        }
                    }
                    SelectOutcome::ReservationBusy | SelectOutcome::ReservationNotUsable => {
                        // Exclude the reservation's nodes for the rest of
                        // the cycle, or skip the job if it has none.
                        if let Some(resv) = resv_key.and_then(|k| resvs.get(k)) {
                            avail.and_not_assign(&resv.node_bitmap);
                        } else {
                            // No reservation of its own: the job needs nodes
                            // some reservation holds. Try the next job.
                            let job = jobs.get_mut(job_id).expect("queued job vanished");
                            job.reason = Reason::ReservedNodes;
                            log::debug!("sched: job {} requires reserved nodes, skipping", job_id);
                        }
                    }
                    SelectOutcome::NeverRunnable => {
                        let multi_part = jobs.get(job_id).map(|j| j.part_keys.len() > 1).unwrap_or(false);
                        if multi_part {
                            // Another partition of the submission may still
                            // satisfy the request.
                            log::debug!("sched: job {} non-runnable in partition {}", job_id, part.name);
                        } else if !self.config.wiki_compat {
                            let job = jobs.get_mut(job_id).expect("queued job vanished");
                            job.fail_never_runnable(Reason::BadConstraints, now);
                            log::info!("sched: job {} never runnable in partition {}", job_id, part.name);
                        }
                    }
                    SelectOutcome::ConfigUnavailable => {
                        // The cluster may satisfy this after a reconfig;
                        // leave pending without poisoning the partition.
                        log::debug!("sched: job {} not runnable until reconfiguration", job_id);
                    }
                }

                // Remember an array rejection so sibling elements are
                // skipped for the rest of the cycle.
                if let Some(array_id) = array_job_id {
                    let still_pending = jobs.get(job_id).map(|j| j.is_pending()).unwrap_or(false);
                    if still_pending {
                        let reason = jobs.get(job_id).map(|j| j.reason).unwrap_or(Reason::None);
                        reject_array = Some((array_id, part_key, reason));
                    }
                }
                break;
            }
        }

        self.stats.jobs_started += job_cnt as u64;
        crate::logger::cycle_summary(&self.stats, job_depth, job_cnt);
        job_cnt
    }
}
