use bitflags::bitflags;
use slotmap::{SlotMap, new_key_type};

use crate::util::bitmap::NodeBitmap;

new_key_type! {
    pub struct PartKey;
}

bitflags! {
    /// Preempt mode of a partition. Exactly one of SUSPEND/REQUEUE/CANCEL
    /// is the stop action; GANG is orthogonal and enables time-slicing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PreemptFlags: u16 {
        const SUSPEND = 1 << 0;
        const REQUEUE = 1 << 1;
        const CANCEL  = 1 << 2;
        const GANG    = 1 << 3;
    }
}

/// How a preempted job is stopped, once the flag set is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptAction {
    Off,
    Suspend,
    Requeue,
    Cancel,
}

impl PreemptFlags {
    pub fn action(self) -> PreemptAction {
        if self.contains(PreemptFlags::SUSPEND) {
            PreemptAction::Suspend
        } else if self.contains(PreemptFlags::REQUEUE) {
            PreemptAction::Requeue
        } else if self.contains(PreemptFlags::CANCEL) {
            PreemptAction::Cancel
        } else {
            PreemptAction::Off
        }
    }

    pub fn gang(self) -> bool {
        self.contains(PreemptFlags::GANG)
    }
}

/// Sharing policy encoded by the partition's max_share field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxShare {
    /// Whole-node exclusive allocation.
    Exclusive,
    /// No sharing (one job per resource).
    No,
    /// Sharing forced up to N jobs.
    Force(u16),
    /// Sharing allowed up to N jobs if the job requests it.
    Yes(u16),
}

/// Resource granularity at which gang rows are evaluated. Derived from the
/// cluster selector configuration, optionally overridden per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Node,
    Socket,
    Core,
    /// CPU counters without task affinity.
    Cpu,
    /// CPU with task affinity (core bitmaps).
    Cpu2,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    /// Scheduling priority tier; dominates job priority in queue ordering
    /// and in shadow casting.
    pub priority_tier: u16,
    pub node_bitmap: NodeBitmap,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub max_time_secs: Option<i64>,
    pub max_share: MaxShare,
    pub preempt: PreemptFlags,
    /// Seconds of grace before a preempted job is stopped.
    pub grace_time: u32,
    pub state_up: bool,
    /// Per-partition granularity override for gang evaluation.
    pub granularity: Option<Granularity>,
}

impl Partition {
    pub fn new(name: impl Into<String>, priority_tier: u16, node_bitmap: NodeBitmap) -> Partition {
        Partition {
            name: name.into(),
            priority_tier,
            node_bitmap,
            min_nodes: 1,
            max_nodes: u32::MAX,
            max_time_secs: None,
            max_share: MaxShare::No,
            preempt: PreemptFlags::empty(),
            grace_time: 0,
            state_up: true,
            granularity: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PartitionTable {
    parts: SlotMap<PartKey, Partition>,
}

impl PartitionTable {
    pub fn new() -> PartitionTable {
        PartitionTable { parts: SlotMap::with_key() }
    }

    pub fn insert(&mut self, part: Partition) -> PartKey {
        self.parts.insert(part)
    }

    pub fn remove(&mut self, key: PartKey) -> Option<Partition> {
        self.parts.remove(key)
    }

    pub fn get(&self, key: PartKey) -> Option<&Partition> {
        self.parts.get(key)
    }

    pub fn get_mut(&mut self, key: PartKey) -> Option<&mut Partition> {
        self.parts.get_mut(key)
    }

    pub fn find_by_name(&self, name: &str) -> Option<PartKey> {
        self.parts.iter().find(|(_, p)| p.name == name).map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartKey, &Partition)> {
        self.parts.iter()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}
