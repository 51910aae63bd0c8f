use slotmap::{SlotMap, new_key_type};

use crate::state::job::Job;
use crate::util::bitmap::NodeBitmap;

new_key_type! {
    pub struct ResvKey;
}

/// A node reservation with a time window. Licenses transferred into the
/// reservation at create time are accounted inside the license pool,
/// keyed by this reservation's key.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub name: String,
    pub node_bitmap: NodeBitmap,
    pub start_time: i64,
    pub end_time: i64,
    /// Jobs outside this reservation may run on its nodes until the window
    /// opens; such jobs are preempted unconditionally when the reservation
    /// needs the nodes back.
    pub allows_borrow: bool,
}

impl Reservation {
    pub fn new(name: impl Into<String>, node_bitmap: NodeBitmap, start_time: i64, end_time: i64) -> Reservation {
        Reservation { name: name.into(), node_bitmap, start_time, end_time, allows_borrow: false }
    }

    pub fn window_contains(&self, when: i64) -> bool {
        when >= self.start_time && when < self.end_time
    }
}

#[derive(Debug, Default)]
pub struct ReservationTable {
    resvs: SlotMap<ResvKey, Reservation>,
}

impl ReservationTable {
    pub fn new() -> ReservationTable {
        ReservationTable { resvs: SlotMap::with_key() }
    }

    pub fn insert(&mut self, resv: Reservation) -> ResvKey {
        self.resvs.insert(resv)
    }

    pub fn get(&self, key: ResvKey) -> Option<&Reservation> {
        self.resvs.get(key)
    }

    pub fn get_mut(&mut self, key: ResvKey) -> Option<&mut Reservation> {
        self.resvs.get_mut(key)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ResvKey> {
        self.resvs.iter().find(|(_, r)| r.name == name).map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResvKey, &Reservation)> {
        self.resvs.iter()
    }

    /// True when the preemptee occupies nodes of the preemptor's
    /// reservation without belonging to it (running on borrowed time).
    pub fn borrowed_from_resv(&self, preemptee: &Job, preemptor: &Job) -> bool {
        let Some(resv_key) = preemptor.resv_key else {
            return false;
        };
        if preemptee.resv_key == Some(resv_key) {
            return false;
        }
        let Some(resv) = self.resvs.get(resv_key) else {
            return false;
        };
        if !resv.allows_borrow {
            return false;
        }
        match &preemptee.alloc {
            Some(alloc) => alloc.node_bitmap.overlap_any(&resv.node_bitmap),
            None => false,
        }
    }
}
