//! Gang time-slicer: coschedules jobs with overlapping resources by
//! rotating "rows" of non-conflicting jobs, and projects higher-priority
//! partitions' jobs as "shadows" into lower ones.
//!
//! Jobs in higher priority partitions cast shadows on the active rows of
//! lower priority partitions. Jobs caught in a shadow are suspended until
//! the shadow disappears. When constructing the active row of a partition,
//! shadows are applied first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::license::pool::LicensePool;
use crate::preempt::engine::job_preempt_mode;
use crate::preempt::policy::PreemptPolicy;
use crate::state::job::{signal, Job, JobId};
use crate::state::node::NodeTable;
use crate::state::partition::{Granularity, PartitionTable, PreemptAction};
use crate::state::table::{ops, ClusterState, JobTable};
use crate::util::bitmap::NodeBitmap;
use crate::util::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigState {
    Resume,
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowState {
    /// In the active row by rotation order.
    Active,
    /// Not in the active row; suspended or waiting its turn.
    NoActive,
    /// Added to the row out of arrival order to backfill a hole.
    Filler,
}

#[derive(Debug)]
struct GsJob {
    job_id: JobId,
    sig_state: SigState,
    row_state: RowState,
}

#[derive(Debug)]
struct GsPart {
    name: String,
    priority: u16,
    gran: Granularity,
    /// Insertion order is preserved across reorderings; rotation moves
    /// whole groups, never reshuffles within one.
    job_list: Vec<GsJob>,
    /// Jobs from higher-priority partitions projected onto this row.
    shadows: Vec<JobId>,
    jobs_active: u32,
    active_resmap: Option<NodeBitmap>,
    /// Per-node active CPU counters, used at CPU granularity only.
    active_cpus: Vec<u16>,
}

impl GsPart {
    fn new(name: String, priority: u16, gran: Granularity) -> GsPart {
        GsPart { name, priority, gran, job_list: Vec::new(), shadows: Vec::new(), jobs_active: 0, active_resmap: None, active_cpus: Vec::new() }
    }

    fn find_job(&self, job_id: JobId) -> Option<usize> {
        self.job_list.iter().position(|j| j.job_id == job_id)
    }
}

/// Core-space footprint of a job at the given granularity. Falls back to
/// whole-node core bits when the selector provided no core bitmap.
fn core_footprint(job: &Job, gran: Granularity, nodes: &NodeTable) -> Option<NodeBitmap> {
    let alloc = job.alloc.as_ref()?;
    if let Some(core_bitmap) = &alloc.core_bitmap {
        return Some(core_bitmap.clone());
    }
    let mut map = NodeBitmap::new(nodes.total_core_bits(gran));
    for node in alloc.node_bitmap.iter_ones() {
        let offset = nodes.core_bit_offset(gran, node);
        let width = nodes.phys_bit_cnt(gran, node) as usize;
        if width > 0 {
            map.set_range(offset, offset + width - 1);
        }
    }
    Some(map)
}

fn is_core_granular(gran: Granularity) -> bool {
    matches!(gran, Granularity::Core | Granularity::Socket | Granularity::Cpu2)
}

impl GsPart {
    /// Can this job's CPU counts stack on the current row?
    fn can_cpus_fit(&self, job: &Job, nodes: &NodeTable) -> bool {
        let Some(alloc) = job.alloc.as_ref() else {
            return false;
        };
        if self.active_cpus.is_empty() {
            return false;
        }
        for (j, node) in alloc.node_bitmap.iter_ones().enumerate() {
            let job_cpus = alloc.cpus_per_node.get(j).copied().unwrap_or(0);
            if self.active_cpus[node] + job_cpus > nodes.phys_bit_cnt(Granularity::Cpu, node) {
                return false;
            }
        }
        true
    }

    /// True if the job's resources do not conflict with the row aggregate.
    fn job_fits_in_active_row(&self, job: &Job, nodes: &NodeTable) -> bool {
        let Some(active) = &self.active_resmap else {
            return true;
        };
        if self.jobs_active == 0 {
            return true;
        }
        let Some(alloc) = job.alloc.as_ref() else {
            return false;
        };

        if is_core_granular(self.gran) {
            match core_footprint(job, self.gran, nodes) {
                Some(footprint) => return !footprint.overlap_any(active),
                None => return false,
            }
        }

        let conflicts = alloc.node_bitmap.overlap_count(active);
        log::debug!("gang: {} bits conflict for job {}", conflicts, job.id);
        if conflicts == 0 {
            return true;
        }
        if self.gran == Granularity::Cpu {
            return self.can_cpus_fit(job, nodes);
        }
        false
    }

    /// Add the job to the active structures and bump the run count.
    fn add_job_to_active(&mut self, job: &Job, nodes: &NodeTable) {
        let Some(alloc) = job.alloc.as_ref() else {
            return;
        };

        if is_core_granular(self.gran) {
            let Some(footprint) = core_footprint(job, self.gran, nodes) else {
                return;
            };
            match &mut self.active_resmap {
                Some(active) => {
                    if self.jobs_active == 0 {
                        active.clear_all();
                    }
                    active.or_assign(&footprint);
                }
                None => self.active_resmap = Some(footprint),
            }
            if self.gran == Granularity::Socket {
                self.fill_sockets(&alloc.node_bitmap, nodes);
            }
        } else {
            match &mut self.active_resmap {
                Some(active) => {
                    if self.jobs_active == 0 {
                        active.clear_all();
                    }
                    active.or_assign(&alloc.node_bitmap);
                }
                None => self.active_resmap = Some(alloc.node_bitmap.clone()),
            }
        }

        if self.gran == Granularity::Cpu {
            if self.active_cpus.is_empty() {
                self.active_cpus = vec![0; nodes.len()];
            }
            if self.jobs_active == 0 {
                self.active_cpus.fill(0);
            }
            for (j, node) in alloc.node_bitmap.iter_ones().enumerate() {
                let limit = nodes.phys_bit_cnt(Granularity::Cpu, node);
                let job_cpus = alloc.cpus_per_node.get(j).copied().unwrap_or(0);
                self.active_cpus[node] += job_cpus;
                // Shadows may overcommit; clamp at physical capacity.
                if self.active_cpus[node] > limit {
                    self.active_cpus[node] = limit;
                }
            }
        }
        self.jobs_active += 1;
    }

    /// A job was just added at socket granularity: mark every core of each
    /// touched socket so no other job activates on the same socket.
    fn fill_sockets(&mut self, job_nodemap: &NodeBitmap, nodes: &NodeTable) {
        let Some(active) = &mut self.active_resmap else {
            return;
        };
        for node in job_nodemap.iter_ones() {
            let cores = nodes.phys_bit_cnt(Granularity::Socket, node) as usize;
            let socks = nodes.socket_cnt(node) as usize;
            if socks == 0 || cores == 0 {
                continue;
            }
            let cores_per_sock = cores / socks;
            let base = nodes.core_bit_offset(Granularity::Socket, node);
            for s in 0..socks {
                let start = base + s * cores_per_sock;
                let end = start + cores_per_sock - 1;
                if (start..=end).any(|i| active.test(i)) {
                    active.set_range(start, end);
                }
            }
        }
    }
}

#[derive(Debug)]
struct GangData {
    parts: Vec<GsPart>,
    preempt_queue: Vec<JobId>,
}

/// The gang scheduler. A fixed background thread rotates rows every
/// `sched_time_slice` seconds; the public entry points are called by the
/// scheduler with the job write lock already held.
pub struct GangScheduler {
    state: Arc<ClusterState>,
    pool: Arc<LicensePool>,
    policy: Arc<dyn PreemptPolicy>,
    clock: Box<dyn Clock>,
    slice_secs: i64,
    default_gran: Granularity,
    data: Mutex<GangData>,
    term: Mutex<bool>,
    term_cond: Condvar,
    enabled: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

fn part_gran(part_gran: Option<Granularity>, default_gran: Granularity) -> Granularity {
    part_gran.unwrap_or(default_gran)
}

impl GangScheduler {
    pub fn new(
        state: Arc<ClusterState>,
        pool: Arc<LicensePool>,
        policy: Arc<dyn PreemptPolicy>,
        clock: Box<dyn Clock>,
        slice_secs: i64,
        default_gran: Granularity,
    ) -> GangScheduler {
        GangScheduler {
            state,
            pool,
            policy,
            clock,
            slice_secs,
            default_gran,
            data: Mutex::new(GangData { parts: Vec::new(), preempt_queue: Vec::new() }),
            term: Mutex::new(false),
            term_cond: Condvar::new(),
            enabled: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Initialize data structures and start the time-slicer thread. A
    /// no-op unless some partition carries the gang preempt bit.
    pub fn init(self: Arc<Self>) {
        {
            let parts = self.state.parts.read().expect("partition lock poisoned");
            if !parts.iter().any(|(_, p)| p.preempt.gang()) {
                return;
            }
        }
        self.enabled.store(true, Ordering::SeqCst);
        log::debug!("gang: entering init");

        {
            let mut jobs = self.state.jobs.write().expect("job lock poisoned");
            let nodes = self.state.nodes.read().expect("node lock poisoned");
            let parts = self.state.parts.read().expect("partition lock poisoned");
            let mut data = self.data.lock().expect("gang mutex poisoned");
            Self::build_parts(&mut data, &parts, self.default_gran);
            self.scan_job_list_locked(&mut data, &mut jobs, &nodes, &parts);
            drop(data);
            self.preempt_job_dequeue(&mut jobs, &parts);
        }

        let me = Arc::clone(&self);
        let handle = thread::spawn(move || me.timeslicer_loop());
        *self.thread.lock().expect("gang thread flag poisoned") = Some(handle);
        log::debug!("gang: leaving init");
    }

    /// Stop the time-slicer thread and drop gang structures.
    pub fn fini(&self) {
        if !self.is_enabled() {
            return;
        }
        {
            let mut term = self.term.lock().expect("gang term lock poisoned");
            *term = true;
            self.term_cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().expect("gang thread flag poisoned").take() {
            if handle.join().is_err() {
                log::error!("gang: timeslicer thread panicked");
            }
        }
        let mut data = self.data.lock().expect("gang mutex poisoned");
        data.parts.clear();
        data.preempt_queue.clear();
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn build_parts(data: &mut GangData, parts: &PartitionTable, default_gran: Granularity) {
        data.parts = parts
            .iter()
            .map(|(_, p)| GsPart::new(p.name.clone(), p.priority_tier, part_gran(p.granularity, default_gran)))
            .collect();
        data.parts.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Notify that a job started or resumed; add it to gang tracking.
    pub fn job_started(&self, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable, job_id: JobId) {
        if !self.is_enabled() {
            return;
        }
        let Some(job) = jobs.get(job_id) else {
            return;
        };
        // Hetjob components are excluded from gang operation entirely.
        if job.is_het_member() {
            return;
        }
        let part_name = match job.part_key.and_then(|k| parts.get(k)) {
            Some(p) => p.name.clone(),
            None => {
                log::error!("gang: could not find partition for job {}", job_id);
                return;
            }
        };

        let mut data = self.data.lock().expect("gang mutex poisoned");
        let Some(idx) = data.parts.iter().position(|p| p.name == part_name) else {
            log::error!("gang: could not find partition {} for job {}", part_name, job_id);
            return;
        };
        let sig = self.add_job_to_part(&mut data, idx, jobs, nodes, parts, job_id);
        if sig == SigState::Resume {
            self.update_all_active_rows(&mut data, jobs, nodes, parts);
        }
        drop(data);
        self.preempt_job_dequeue(jobs, parts);
    }

    /// Notify that a job completed or was suspended externally; remove it.
    pub fn job_finished(&self, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable, job_id: JobId) {
        if !self.is_enabled() {
            return;
        }
        if jobs.get(job_id).map(|j| j.is_het_member()).unwrap_or(false) {
            return;
        }
        let mut data = self.data.lock().expect("gang mutex poisoned");
        for idx in 0..data.parts.len() {
            if data.parts[idx].find_job(job_id).is_some() {
                self.remove_job_from_part(&mut data, idx, jobs, job_id, true);
            }
        }
        // The departed job may have been shadowing others.
        self.update_all_active_rows(&mut data, jobs, nodes, parts);
    }

    /// Gang scheduling disabled by reconfiguration: resume everything we
    /// suspended.
    pub fn wake_jobs(&self, jobs: &mut JobTable) {
        let ids = jobs.ids();
        for id in ids {
            let Some(job) = jobs.get(id) else {
                continue;
            };
            if job.is_het_member() {
                continue;
            }
            if job.is_suspended() && job.priority != 0 {
                log::info!("gang waking preempted job {}", id);
                let _ = ops::resume_job(jobs, id);
            }
        }
    }

    /// Rebuild all gang state after a cluster reconfiguration. Surviving
    /// partitions keep their job order; jobs of removed partitions are
    /// resumed; a full job scan picks up anything missed.
    pub fn reconfig(&self, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable) {
        if !self.is_enabled() {
            return;
        }
        log::debug!("gang: entering reconfig");
        let mut data = self.data.lock().expect("gang mutex poisoned");
        let old_parts = std::mem::take(&mut data.parts);
        Self::build_parts(&mut data, parts, self.default_gran);

        for old in old_parts {
            let Some(new_idx) = data.parts.iter().position(|p| p.name == old.name) else {
                // Partition removed: resume jobs it had suspended.
                for j in old.job_list {
                    let gang_suspended = jobs.get(j.job_id).map(|job| job.is_suspended() && job.priority != 0).unwrap_or(false);
                    if j.sig_state == SigState::Suspend && gang_suspended {
                        log::info!("resuming job in missing partition {}", old.name);
                        let _ = ops::resume_job(jobs, j.job_id);
                    }
                }
                continue;
            };
            // Transfer jobs in their current order to preserve the state
            // of timeslicing.
            for j in old.job_list {
                let keep = jobs
                    .get(j.job_id)
                    .map(|job| {
                        if job.is_suspended() && job.priority == 0 {
                            return false;
                        }
                        job.is_running() || job.is_suspended()
                    })
                    .unwrap_or(false);
                if keep {
                    self.add_job_to_part(&mut data, new_idx, jobs, nodes, parts, j.job_id);
                }
            }
        }

        self.scan_job_list_locked(&mut data, jobs, nodes, parts);
        drop(data);
        self.preempt_job_dequeue(jobs, parts);
        log::debug!("gang: leaving reconfig");
    }

    /// Ensure every running job in the cluster is accounted for, and flush
    /// jobs that completed behind our back.
    fn scan_job_list_locked(&self, data: &mut GangData, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable) {
        let ids = jobs.ids();
        for id in ids {
            let Some(job) = jobs.get(id) else {
                continue;
            };
            if job.is_het_member() {
                continue;
            }
            if job.is_pending() {
                continue;
            }
            if job.is_suspended() && job.priority == 0 {
                // Held by the user, not by gang.
                continue;
            }
            let part_name = match job.part_key.and_then(|k| parts.get(k)) {
                Some(p) => p.name.clone(),
                None => continue,
            };
            let Some(idx) = data.parts.iter().position(|p| p.name == part_name) else {
                continue;
            };

            if job.is_running() || job.is_suspended() {
                if data.parts[idx].find_job(id).is_none() {
                    self.add_job_to_part(data, idx, jobs, nodes, parts, id);
                }
            } else {
                self.remove_job_from_part(data, idx, jobs, id, false);
            }
        }
        self.update_all_active_rows(data, jobs, nodes, parts);
    }

    /// Add a job to a partition's job list and decide its immediate fate.
    fn add_job_to_part(&self, data: &mut GangData, idx: usize, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable, job_id: JobId) -> SigState {
        let now = self.clock.now_secs();

        // A duplicate means the resource allocation may have changed:
        // remove the stale entry and rebuild before re-adding.
        if data.parts[idx].find_job(job_id).is_some() {
            log::debug!("gang: duplicate job {} detected", job_id);
            self.remove_job_from_part(data, idx, jobs, job_id, false);
            self.update_active_row(data, idx, jobs, nodes, parts, false);
        }

        data.parts[idx].job_list.push(GsJob { job_id, sig_state: SigState::Resume, row_state: RowState::NoActive });
        let priority = data.parts[idx].priority;

        let fits = {
            let job = jobs.get(job_id).expect("job vanished while being added to gang");
            !job.is_suspended() && data.parts[idx].job_fits_in_active_row(job, nodes)
        };
        if fits {
            let job = jobs.get(job_id).expect("job vanished while being added to gang");
            data.parts[idx].add_job_to_active(job, nodes);
            let pos = data.parts[idx].find_job(job_id).expect("job just appended");
            data.parts[idx].job_list[pos].row_state = RowState::Filler;
            // Running in a row means shadowing every lower partition.
            self.cast_shadow(data, job_id, priority);
            SigState::Resume
        } else {
            log::debug!("gang: suspending job {}", job_id);
            self.suspend_or_queue(data, idx, jobs, parts, job_id, now);
            let pos = data.parts[idx].find_job(job_id).expect("job just appended");
            data.parts[idx].job_list[pos].sig_state = SigState::Suspend;
            SigState::Suspend
        }
    }

    /// Suspension of a job shadowed by non-suspend-mode preemption is
    /// delegated to the preempt queue, preserving the preempt-mode
    /// contract; otherwise suspend directly.
    fn suspend_or_queue(&self, data: &mut GangData, idx: usize, jobs: &mut JobTable, parts: &PartitionTable, job_id: JobId, now: i64) {
        let mode = job_preempt_mode(jobs, parts, self.policy.as_ref(), job_id);
        if !data.parts[idx].shadows.is_empty() && mode != PreemptAction::Off && mode != PreemptAction::Suspend {
            data.preempt_queue.push(job_id);
        } else {
            let _ = ops::suspend_job(jobs, job_id, now);
        }
    }

    fn remove_job_from_part(&self, data: &mut GangData, idx: usize, jobs: &mut JobTable, job_id: JobId, fini: bool) {
        let Some(pos) = data.parts[idx].find_job(job_id) else {
            return;
        };
        log::debug!("gang: removing job {} from {}", job_id, data.parts[idx].name);
        self.clear_shadow(data, job_id);
        let entry = data.parts[idx].job_list.remove(pos);

        // Do not leave a finished job resumed, but wake anything we had
        // suspended ourselves.
        if !fini && entry.sig_state == SigState::Suspend {
            let resumable = jobs.get(job_id).map(|j| j.priority != 0).unwrap_or(false);
            if resumable {
                log::debug!("gang: resuming suspended job {}", job_id);
                let _ = ops::resume_job(jobs, job_id);
            }
        }
    }

    /// Append the job as a shadow to every partition with a strictly lower
    /// priority tier.
    fn cast_shadow(&self, data: &mut GangData, job_id: JobId, priority: u16) {
        for p in data.parts.iter_mut() {
            if p.priority >= priority {
                continue;
            }
            if !p.shadows.contains(&job_id) {
                p.shadows.push(job_id);
            }
        }
    }

    fn clear_shadow(&self, data: &mut GangData, job_id: JobId) {
        for p in data.parts.iter_mut() {
            p.shadows.retain(|&id| id != job_id);
        }
    }

    /// Rebuild the active row of one partition while preserving job order.
    /// Called after removals or when a new shadow may preempt running jobs.
    fn update_active_row(&self, data: &mut GangData, idx: usize, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable, add_new_jobs: bool) {
        let now = self.clock.now_secs();
        log::debug!("gang: update_active_row: rebuilding partition {}", data.parts[idx].name);

        data.parts[idx].jobs_active = 0;
        let shadows = data.parts[idx].shadows.clone();
        for shadow_id in shadows {
            if let Some(job) = jobs.get(shadow_id) {
                let job = job.clone();
                data.parts[idx].add_job_to_active(&job, nodes);
            }
        }

        // First keep what was active, then fillers, then try new jobs.
        for wanted in [RowState::Active, RowState::Filler] {
            for pos in 0..data.parts[idx].job_list.len() {
                if data.parts[idx].job_list[pos].row_state != wanted {
                    continue;
                }
                let job_id = data.parts[idx].job_list[pos].job_id;
                let Some(job) = jobs.get(job_id).cloned() else {
                    continue;
                };
                if data.parts[idx].job_fits_in_active_row(&job, nodes) {
                    data.parts[idx].add_job_to_active(&job, nodes);
                    let priority = data.parts[idx].priority;
                    self.cast_shadow(data, job_id, priority);
                } else {
                    // Preempted by a shadow job: suspend it but keep its
                    // position in the job list.
                    if data.parts[idx].job_list[pos].sig_state != SigState::Suspend {
                        self.suspend_or_queue(data, idx, jobs, parts, job_id, now);
                        data.parts[idx].job_list[pos].sig_state = SigState::Suspend;
                        self.clear_shadow(data, job_id);
                    }
                    data.parts[idx].job_list[pos].row_state = RowState::NoActive;
                }
            }
        }

        if !add_new_jobs {
            return;
        }

        for pos in 0..data.parts[idx].job_list.len() {
            if data.parts[idx].job_list[pos].row_state != RowState::NoActive {
                continue;
            }
            let job_id = data.parts[idx].job_list[pos].job_id;
            let Some(job) = jobs.get(job_id).cloned() else {
                continue;
            };
            if job.priority == 0 {
                continue;
            }
            if data.parts[idx].job_fits_in_active_row(&job, nodes) {
                data.parts[idx].add_job_to_active(&job, nodes);
                let priority = data.parts[idx].priority;
                self.cast_shadow(data, job_id, priority);
                // A filler for this row, blocked by a higher priority job.
                data.parts[idx].job_list[pos].row_state = RowState::Filler;
                if data.parts[idx].job_list[pos].sig_state == SigState::Suspend {
                    let _ = ops::resume_job(jobs, job_id);
                    data.parts[idx].job_list[pos].sig_state = SigState::Resume;
                }
            }
        }
    }

    /// Rebuild every partition's active row, highest priority first so
    /// shadows are adjusted before lower partitions are updated.
    fn update_all_active_rows(&self, data: &mut GangData, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable) {
        data.parts.sort_by(|a, b| b.priority.cmp(&a.priority));
        for idx in 0..data.parts.len() {
            self.update_active_row(data, idx, jobs, nodes, parts, true);
        }
    }

    /// Build the active row from scratch in current job-list order,
    /// shadows first.
    fn build_active_row(&self, data: &mut GangData, idx: usize, jobs: &JobTable, nodes: &NodeTable) {
        data.parts[idx].jobs_active = 0;
        if data.parts[idx].job_list.is_empty() {
            return;
        }
        let shadows = data.parts[idx].shadows.clone();
        for shadow_id in shadows {
            if let Some(job) = jobs.get(shadow_id) {
                let job = job.clone();
                data.parts[idx].add_job_to_active(&job, nodes);
            }
        }
        for pos in 0..data.parts[idx].job_list.len() {
            let job_id = data.parts[idx].job_list[pos].job_id;
            let Some(job) = jobs.get(job_id).cloned() else {
                continue;
            };
            if job.priority == 0 {
                continue;
            }
            if data.parts[idx].job_fits_in_active_row(&job, nodes) {
                data.parts[idx].add_job_to_active(&job, nodes);
                data.parts[idx].job_list[pos].row_state = RowState::Active;
            }
        }
    }

    /// One rotation of a partition: active jobs move to the back of the
    /// list preserving their relative order, fillers reset, the row is
    /// rebuilt, and signals are adjusted to the new row.
    fn cycle_job_list(&self, data: &mut GangData, idx: usize, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable) {
        let now = self.clock.now_secs();
        log::debug!("gang: cycling partition {}", data.parts[idx].name);

        let mut front: Vec<GsJob> = Vec::new();
        let mut back: Vec<GsJob> = Vec::new();
        for mut j in data.parts[idx].job_list.drain(..) {
            match j.row_state {
                RowState::Active => {
                    j.row_state = RowState::NoActive;
                    back.push(j);
                }
                RowState::Filler => {
                    j.row_state = RowState::NoActive;
                    front.push(j);
                }
                RowState::NoActive => front.push(j),
            }
        }
        front.extend(back);
        data.parts[idx].job_list = front;

        self.build_active_row(data, idx, jobs, nodes);

        // Suspend running jobs that fell out of the row.
        for pos in 0..data.parts[idx].job_list.len() {
            let (job_id, row_state, sig_state) = {
                let j = &data.parts[idx].job_list[pos];
                (j.job_id, j.row_state, j.sig_state)
            };
            if row_state == RowState::NoActive && sig_state == SigState::Resume {
                self.suspend_or_queue(data, idx, jobs, parts, job_id, now);
                data.parts[idx].job_list[pos].sig_state = SigState::Suspend;
                self.clear_shadow(data, job_id);
            }
        }

        // Resume suspended jobs that made it into the row.
        for pos in 0..data.parts[idx].job_list.len() {
            let (job_id, row_state, sig_state) = {
                let j = &data.parts[idx].job_list[pos];
                (j.job_id, j.row_state, j.sig_state)
            };
            let held = jobs.get(job_id).map(|j| j.priority == 0).unwrap_or(true);
            if row_state == RowState::Active && sig_state == SigState::Suspend && !held {
                let _ = ops::resume_job(jobs, job_id);
                data.parts[idx].job_list[pos].sig_state = SigState::Resume;
                let priority = data.parts[idx].priority;
                self.cast_shadow(data, job_id, priority);
            }
        }
    }

    /// Run one rotation over every partition that has contention. Public
    /// so tests and the demo can tick deterministically; the background
    /// thread calls the same path.
    pub fn cycle_all(&self, jobs: &mut JobTable, nodes: &NodeTable, parts: &PartitionTable) {
        if !self.is_enabled() {
            return;
        }
        let mut data = self.data.lock().expect("gang mutex poisoned");
        data.parts.sort_by(|a, b| b.priority.cmp(&a.priority));
        for idx in 0..data.parts.len() {
            let contention = data.parts[idx].jobs_active < (data.parts[idx].job_list.len() as u32 + data.parts[idx].shadows.len() as u32);
            if contention {
                self.cycle_job_list(&mut data, idx, jobs, nodes, parts);
            }
        }
        drop(data);
        self.preempt_job_dequeue(jobs, parts);
    }

    /// Stop jobs parked on the preempt queue using their resolved preempt
    /// mode, falling back to SIGKILL when the mode cannot be applied.
    fn preempt_job_dequeue(&self, jobs: &mut JobTable, parts: &PartitionTable) {
        let queued: Vec<JobId> = {
            let mut data = self.data.lock().expect("gang mutex poisoned");
            std::mem::take(&mut data.preempt_queue)
        };
        let now = self.clock.now_secs();

        for job_id in queued {
            if jobs.get(job_id).is_none() {
                log::error!("gang: could not find job {}", job_id);
                continue;
            }
            let mode = job_preempt_mode(jobs, parts, self.policy.as_ref(), job_id);
            let ok = match mode {
                PreemptAction::Suspend => ops::suspend_job(jobs, job_id, now).is_ok(),
                PreemptAction::Cancel => {
                    let done = ops::signal_job(jobs, &self.pool, job_id, signal::SIGKILL, now).is_ok();
                    if done {
                        log::info!("preempted job {} has been killed", job_id);
                    }
                    done
                }
                PreemptAction::Requeue => {
                    let requeueable = jobs.get(job_id).map(|j| j.batch && j.requeue_allowed).unwrap_or(false);
                    if requeueable {
                        let done = ops::requeue_job(jobs, &self.pool, job_id, now).is_ok();
                        if done {
                            log::info!("preempted job {} has been requeued", job_id);
                        }
                        done
                    } else {
                        false
                    }
                }
                PreemptAction::Off => {
                    log::error!("invalid preempt mode for job {}", job_id);
                    continue;
                }
            };
            if !ok {
                if ops::signal_job(jobs, &self.pool, job_id, signal::SIGKILL, now).is_ok() {
                    log::info!("preempted job {} had to be killed", job_id);
                } else {
                    log::info!("preempted job {} kill failure", job_id);
                }
            }
        }
    }

    fn slice_sleep(&self) {
        let term = self.term.lock().expect("gang term lock poisoned");
        if !*term {
            let _ = self.term_cond.wait_timeout(term, Duration::from_secs(self.slice_secs.max(1) as u64));
        }
    }

    fn timeslicer_loop(self: Arc<Self>) {
        log::debug!("gang: starting timeslicer loop");
        loop {
            self.slice_sleep();
            if *self.term.lock().expect("gang term lock poisoned") {
                break;
            }
            let mut jobs = self.state.jobs.write().expect("job lock poisoned");
            let nodes = self.state.nodes.read().expect("node lock poisoned");
            let parts = self.state.parts.read().expect("partition lock poisoned");
            self.cycle_all(&mut jobs, &nodes, &parts);
        }
        log::debug!("gang: timeslicer loop exiting");
    }

    // --- Introspection for tests and diagnostics ---

    pub fn jobs_active(&self, part_name: &str) -> u32 {
        let data = self.data.lock().expect("gang mutex poisoned");
        data.parts.iter().find(|p| p.name == part_name).map(|p| p.jobs_active).unwrap_or(0)
    }

    pub fn num_shadows(&self, part_name: &str) -> usize {
        let data = self.data.lock().expect("gang mutex poisoned");
        data.parts.iter().find(|p| p.name == part_name).map(|p| p.shadows.len()).unwrap_or(0)
    }

    pub fn job_order(&self, part_name: &str) -> Vec<JobId> {
        let data = self.data.lock().expect("gang mutex poisoned");
        data.parts
            .iter()
            .find(|p| p.name == part_name)
            .map(|p| p.job_list.iter().map(|j| j.job_id).collect())
            .unwrap_or_default()
    }

    pub fn is_tracking(&self, part_name: &str, job_id: JobId) -> bool {
        let data = self.data.lock().expect("gang mutex poisoned");
        data.parts.iter().find(|p| p.name == part_name).map(|p| p.find_job(job_id).is_some()).unwrap_or(false)
    }
}
