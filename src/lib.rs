use std::sync::Arc;

use crate::api::config_dto::ClusterDto;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::gang::GangScheduler;
use crate::license::pool::{HresConfig, HresMode, LicensePool};
use crate::preempt::policy::{PartitionPrioPolicy, PreemptPolicy};
use crate::sched::dependency::update_job_dependency;
use crate::sched::hooks::HookExecutor;
use crate::sched::placement::{AccountPolicy, FirstFitSelector, NodeSelector, PermissiveAccounting};
use crate::sched::scheduler::Scheduler;
use crate::state::job::{Job, JobId};
use crate::state::node::{Node, NodeTable};
use crate::state::partition::{MaxShare, Partition, PartitionTable, PreemptFlags};
use crate::state::reservation::ReservationTable;
use crate::state::table::{ClusterState, JobTable};
use crate::util::clock::{Clock, SystemClock};

pub mod api;
pub mod config;
pub mod error;
pub mod gang;
pub mod license;
pub mod logger;
pub mod preempt;
pub mod sched;
pub mod state;
pub mod util;

/// A fully wired scheduler core: shared state, license pool, gang slicer,
/// hook executor and the scheduler itself.
pub struct SchedulerSystem {
    pub state: Arc<ClusterState>,
    pub pool: Arc<LicensePool>,
    pub gang: Arc<GangScheduler>,
    pub scheduler: Scheduler,
    pub hooks: HookExecutor,
}

impl SchedulerSystem {
    /// Start the gang time-slicer thread (no-op when no partition carries
    /// the gang preempt bit).
    pub fn start_gang(&self) {
        Arc::clone(&self.gang).init();
    }

    pub fn shutdown(&self) {
        self.gang.fini();
    }

    /// Install a new dependency list on a job. Serialised through the
    /// narrow dependency mutex so concurrent updates to other jobs' lists
    /// do not need the full job write lock path.
    pub fn update_dependency(&self, job_id: JobId, spec: &str) -> Result<()> {
        let _guard = self.state.depend_lock.lock().expect("dependency mutex poisoned");
        let mut jobs = self.state.jobs.write().expect("job lock poisoned");
        update_job_dependency(&mut jobs, job_id, spec, self.scheduler.config().max_depend_depth)
    }
}

fn parse_max_share(spec: Option<&str>) -> MaxShare {
    let Some(spec) = spec else {
        return MaxShare::No;
    };
    let lower = spec.to_ascii_lowercase();
    if lower == "exclusive" {
        return MaxShare::Exclusive;
    }
    if lower == "no" {
        return MaxShare::No;
    }
    if let Some(n) = lower.strip_prefix("force:") {
        return MaxShare::Force(n.parse().unwrap_or(1));
    }
    if let Some(n) = lower.strip_prefix("yes:") {
        return MaxShare::Yes(n.parse().unwrap_or(1));
    }
    MaxShare::No
}

fn parse_preempt_flags(spec: Option<&str>) -> PreemptFlags {
    let mut flags = PreemptFlags::empty();
    let Some(spec) = spec else {
        return flags;
    };
    for opt in spec.split(',') {
        match opt.trim().to_ascii_lowercase().as_str() {
            "suspend" => flags |= PreemptFlags::SUSPEND,
            "requeue" => flags |= PreemptFlags::REQUEUE,
            "cancel" => flags |= PreemptFlags::CANCEL,
            "gang" => flags |= PreemptFlags::GANG,
            "off" | "" => {}
            other => log::warn!("ignoring unknown preempt mode: {}", other),
        }
    }
    flags
}

/// Assemble a scheduler system from a parsed cluster description.
pub fn build_system(dto: &ClusterDto, clock: Box<dyn Clock>) -> Result<SchedulerSystem> {
    let now = clock.now_secs();
    let config = SchedulerConfig::from_dto(&dto.scheduler);

    let nodes = NodeTable::new(
        dto.nodes
            .iter()
            .map(|n| Node { name: n.name.clone(), cpus: n.cpus, sockets: n.sockets, cores_per_socket: n.cores_per_socket, available: n.available })
            .collect(),
    );

    let mut parts = PartitionTable::new();
    for p in dto.partitions.iter() {
        let bitmap = nodes
            .bitmap_from_names(&p.nodes)
            .ok_or_else(|| Error::ModelConstructionError(format!("partition {} references an unknown node", p.name)))?;
        let mut part = Partition::new(p.name.clone(), p.priority_tier, bitmap);
        part.min_nodes = p.min_nodes;
        part.max_nodes = p.max_nodes.unwrap_or(u32::MAX);
        part.max_time_secs = p.max_time_secs;
        part.max_share = parse_max_share(p.max_share.as_deref());
        part.preempt = parse_preempt_flags(p.preempt_mode.as_deref());
        part.grace_time = p.grace_time;
        part.state_up = p.state_up;
        parts.insert(part);
    }

    let pool = Arc::new(LicensePool::new());
    let hres: Vec<HresConfig> = dto
        .hres_licenses
        .iter()
        .map(|h| HresConfig {
            name: h.name.clone(),
            nodes: h.nodes.clone(),
            total: h.total,
            mode: if h.mode == 2 { HresMode::Mode2 } else { HresMode::Mode1 },
        })
        .collect();
    pool.init(&dto.licenses, &hres, config.reclaim_licenses, &nodes, now)?;

    let mut jobs = JobTable::new();
    for j in dto.jobs.iter() {
        let mut job = Job::new(JobId(j.id), j.name.clone(), j.user_id, j.priority);
        job.submit_time = now;
        let primary = parts.find_by_name(&j.partition).ok_or_else(|| Error::PartitionNotFound(j.partition.clone()))?;
        job.part_key = Some(primary);
        job.part_keys.push(primary);
        for alt in j.alt_partitions.iter() {
            let key = parts.find_by_name(alt).ok_or_else(|| Error::PartitionNotFound(alt.clone()))?;
            job.part_keys.push(key);
        }
        job.request.min_nodes = j.min_nodes;
        job.request.max_nodes = j.max_nodes.unwrap_or(j.min_nodes);
        if let Some(spec) = &j.licenses {
            job.licenses = Some(spec.clone());
            job.license_list = pool.validate(spec, true, true, false, None)?;
        }
        jobs.insert(job);
    }
    // Dependencies resolve against the fully populated table.
    for j in dto.jobs.iter() {
        if let Some(spec) = &j.dependency {
            update_job_dependency(&mut jobs, JobId(j.id), spec, config.max_depend_depth)?;
        }
    }

    let state = Arc::new(ClusterState::new(jobs, nodes, parts, ReservationTable::new()));
    let policy: Arc<dyn PreemptPolicy> = Arc::new(PartitionPrioPolicy);
    let selector: Box<dyn NodeSelector> = Box::new(FirstFitSelector);
    let acct: Box<dyn AccountPolicy> = Box::new(PermissiveAccounting);

    let gang = Arc::new(GangScheduler::new(
        Arc::clone(&state),
        Arc::clone(&pool),
        Arc::clone(&policy),
        clock.clone_box(),
        config.sched_time_slice,
        config.select_granularity,
    ));

    let hooks = HookExecutor::new(Arc::clone(&state), Arc::clone(&pool), clock.clone_box(), config.prolog_path.clone(), config.epilog_path.clone());

    let scheduler = Scheduler::new(
        Arc::clone(&state),
        Arc::clone(&pool),
        selector,
        Arc::clone(&policy),
        acct,
        Some(Arc::clone(&gang)),
        clock,
        config,
    );

    Ok(SchedulerSystem { state, pool, gang, scheduler, hooks })
}

/// Load a cluster description file and assemble the scheduler system.
pub fn load_system(file_path: &str) -> Result<SchedulerSystem> {
    logger::init();
    log::info!("Logger initialized. Starting scheduler construction.");

    let dto = ClusterDto::load(file_path)?;
    log::info!("Cluster description parsed successfully.");

    let system = build_system(&dto, Box::new(SystemClock))?;
    log::info!("Scheduler system constructed successfully.");

    Ok(system)
}
