//! Seam to the external node selector and accounting policy.

use crate::state::job::{Job, JobAllocation, JobId};
use crate::state::node::NodeTable;
use crate::state::partition::{MaxShare, Partition};
use crate::state::table::JobTable;
use crate::util::bitmap::NodeBitmap;

/// Verdict of a placement attempt.
#[derive(Debug, Clone)]
pub enum SelectOutcome {
    Allocated(JobAllocation),
    /// Nodes transiently busy; the partition may be poisoned for the cycle.
    NodesBusy,
    /// Reservation nodes are busy.
    ReservationBusy,
    /// The reservation cannot be used for this request.
    ReservationNotUsable,
    /// The cluster could satisfy the request after a reconfiguration.
    ConfigUnavailable,
    /// The requested configuration is impossible; never runnable.
    NeverRunnable,
}

/// External node selector. `preemptees` carries the candidate victim list
/// computed by the preemption engine, most desirable victims first; the
/// selector retains exactly the victims whose removal the allocation
/// depends on.
pub trait NodeSelector: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn select(
        &self,
        job: &Job,
        part: &Partition,
        avail: &NodeBitmap,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: Option<&NodeBitmap>,
        nodes: &NodeTable,
        jobs: &JobTable,
        preemptees: &mut Vec<JobId>,
    ) -> SelectOutcome;
}

/// Linear first-fit selector over the availability bitmap. Adequate for
/// tests and the demo binary; production deployments plug in a
/// topology-aware implementation.
#[derive(Debug, Default)]
pub struct FirstFitSelector;

impl FirstFitSelector {
    /// Nodes held by running or suspended jobs, optionally treating the
    /// preemption candidates as removable. Jobs sharing a Force/Yes
    /// partition are coscheduled by the gang slicer and do not block it.
    fn busy_bitmap(job: &Job, part: &Partition, jobs: &JobTable, removable: &[JobId], size: usize) -> NodeBitmap {
        let shared = matches!(part.max_share, MaxShare::Force(_) | MaxShare::Yes(_));
        let mut busy = NodeBitmap::new(size);
        for (_, other) in jobs.iter() {
            if other.id == job.id || !(other.is_running() || other.is_suspended()) {
                continue;
            }
            if removable.contains(&other.id) {
                continue;
            }
            if shared && other.part_key == job.part_key {
                continue;
            }
            if let Some(alloc) = &other.alloc {
                busy.or_assign(&alloc.node_bitmap);
            }
        }
        busy
    }

    fn pick(candidate: &NodeBitmap, req_nodes: Option<&NodeBitmap>, min_nodes: u32, nodes: &NodeTable) -> Option<JobAllocation> {
        if let Some(req) = req_nodes {
            if !req.is_subset_of(candidate) {
                return None;
            }
        }
        if (candidate.count() as u32) < min_nodes {
            return None;
        }
        let mut picked = NodeBitmap::new(candidate.len());
        if let Some(req) = req_nodes {
            picked.or_assign(req);
        }
        for index in candidate.iter_ones() {
            if picked.count() as u32 >= min_nodes.max(1) {
                break;
            }
            picked.set(index);
        }
        let cpus_per_node: Vec<u16> = picked.iter_ones().map(|i| nodes.get(i).map(|n| n.cpus).unwrap_or(1)).collect();
        Some(JobAllocation { node_bitmap: picked, cpus_per_node, core_bitmap: None })
    }
}

impl NodeSelector for FirstFitSelector {
    fn select(
        &self,
        job: &Job,
        part: &Partition,
        avail: &NodeBitmap,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: Option<&NodeBitmap>,
        nodes: &NodeTable,
        jobs: &JobTable,
        preemptees: &mut Vec<JobId>,
    ) -> SelectOutcome {
        if min_nodes == 0 || min_nodes > max_nodes {
            return SelectOutcome::NeverRunnable;
        }
        // More nodes than the partition will ever have is permanent.
        if min_nodes as usize > part.node_bitmap.count() {
            return SelectOutcome::NeverRunnable;
        }

        let mut candidate = avail.clone();
        candidate.and_assign(&part.node_bitmap);

        // First attempt: without displacing anything.
        let busy = Self::busy_bitmap(job, part, jobs, &[], avail.len());
        let mut free = candidate.clone();
        free.and_not_assign(&busy);
        if let Some(alloc) = Self::pick(&free, req_nodes, min_nodes, nodes) {
            preemptees.clear();
            return SelectOutcome::Allocated(alloc);
        }

        // Second attempt: victims offered by the preemption engine count
        // as removable; retain only the ones the allocation touches.
        if !preemptees.is_empty() {
            let busy = Self::busy_bitmap(job, part, jobs, preemptees, avail.len());
            let mut free = candidate.clone();
            free.and_not_assign(&busy);
            if let Some(alloc) = Self::pick(&free, req_nodes, min_nodes, nodes) {
                preemptees.retain(|id| {
                    jobs.get(*id)
                        .and_then(|j| j.alloc.as_ref())
                        .map(|a| a.node_bitmap.overlap_any(&alloc.node_bitmap))
                        .unwrap_or(false)
                });
                return SelectOutcome::Allocated(alloc);
            }
        }

        preemptees.clear();
        SelectOutcome::NodesBusy
    }
}

/// Accounting-policy predicates consulted by the scheduler. The real
/// implementation lives with the accounting database; the permissive
/// default admits everything.
pub trait AccountPolicy: Send + Sync {
    /// Pre-selection policy gate (limits, TRES caps, ...).
    fn job_runnable_pre_select(&self, job: &Job) -> bool;
    /// True when policy shields the job from preemption.
    fn is_job_preempt_exempt(&self, job: &Job) -> bool;
    /// Association/account validity.
    fn validate_account(&self, job: &Job) -> bool;
    /// QoS validity within the job's association.
    fn qos_valid(&self, job: &Job) -> bool;
}

#[derive(Debug, Default)]
pub struct PermissiveAccounting;

impl AccountPolicy for PermissiveAccounting {
    fn job_runnable_pre_select(&self, _job: &Job) -> bool {
        true
    }

    fn is_job_preempt_exempt(&self, _job: &Job) -> bool {
        false
    }

    fn validate_account(&self, _job: &Job) -> bool {
        true
    }

    fn qos_valid(&self, _job: &Job) -> bool {
        true
    }
}
