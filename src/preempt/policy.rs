//! Pluggable preemption policy.
//!
//! The core holds an owning trait-object handle chosen at init and
//! dispatches every policy question through it, mirroring the plugin ops
//! table of the original design.

use crate::state::job::Job;
use crate::state::partition::{Partition, PartitionTable, PreemptFlags};

pub trait PreemptPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// True if any job could be preempted under the current configuration.
    fn enabled(&self, parts: &PartitionTable) -> bool;

    /// Queue-order predicate: can the preemptor (first pair) preempt the
    /// preemptee (second pair)? Both jobs are taken with the partition of
    /// their queue record, which may differ from their committed partition.
    fn job_preempt_check(&self, preemptor: (&Job, &Partition), preemptee: (&Job, &Partition)) -> bool;

    /// Record-level predicate used during victim enumeration.
    fn preemptable(&self, preemptee: &Job, preemptor: &Job, parts: &PartitionTable) -> bool;

    /// Stop-mode flags that apply to this job.
    fn preempt_flags(&self, job: &Job, parts: &PartitionTable) -> PreemptFlags;

    /// Priority used to order victims (least valuable first).
    fn priority(&self, job: &Job) -> u32;

    /// Seconds of grace before the job is stopped; zero if none.
    fn grace_time(&self, job: &Job, parts: &PartitionTable) -> u32;
}

/// Partition-tier policy: jobs in higher priority-tier partitions preempt
/// jobs in lower tiers whose partition has a preempt mode configured.
#[derive(Debug, Default)]
pub struct PartitionPrioPolicy;

impl PartitionPrioPolicy {
    fn job_partition<'a>(&self, job: &Job, parts: &'a PartitionTable) -> Option<&'a Partition> {
        job.part_key.and_then(|k| parts.get(k))
    }
}

impl PreemptPolicy for PartitionPrioPolicy {
    fn name(&self) -> &'static str {
        "partition_prio"
    }

    fn enabled(&self, parts: &PartitionTable) -> bool {
        parts.iter().any(|(_, p)| !p.preempt.is_empty())
    }

    fn job_preempt_check(&self, preemptor: (&Job, &Partition), preemptee: (&Job, &Partition)) -> bool {
        let (_, or_part) = preemptor;
        let (_, ee_part) = preemptee;
        or_part.priority_tier > ee_part.priority_tier && !ee_part.preempt.is_empty()
    }

    fn preemptable(&self, preemptee: &Job, preemptor: &Job, parts: &PartitionTable) -> bool {
        let (Some(ee_part), Some(or_part)) = (self.job_partition(preemptee, parts), self.job_partition(preemptor, parts)) else {
            return false;
        };
        or_part.priority_tier > ee_part.priority_tier && !ee_part.preempt.is_empty()
    }

    fn preempt_flags(&self, job: &Job, parts: &PartitionTable) -> PreemptFlags {
        self.job_partition(job, parts).map(|p| p.preempt).unwrap_or(PreemptFlags::empty())
    }

    fn priority(&self, job: &Job) -> u32 {
        job.priority
    }

    fn grace_time(&self, job: &Job, parts: &PartitionTable) -> u32 {
        self.job_partition(job, parts).map(|p| p.grace_time).unwrap_or(0)
    }
}

/// Policy with preemption disabled everywhere.
#[derive(Debug, Default)]
pub struct PreemptNone;

impl PreemptPolicy for PreemptNone {
    fn name(&self) -> &'static str {
        "none"
    }

    fn enabled(&self, _parts: &PartitionTable) -> bool {
        false
    }

    fn job_preempt_check(&self, _preemptor: (&Job, &Partition), _preemptee: (&Job, &Partition)) -> bool {
        false
    }

    fn preemptable(&self, _preemptee: &Job, _preemptor: &Job, _parts: &PartitionTable) -> bool {
        false
    }

    fn preempt_flags(&self, _job: &Job, _parts: &PartitionTable) -> PreemptFlags {
        PreemptFlags::empty()
    }

    fn priority(&self, job: &Job) -> u32 {
        job.priority
    }

    fn grace_time(&self, _job: &Job, _parts: &PartitionTable) -> u32 {
        0
    }
}
