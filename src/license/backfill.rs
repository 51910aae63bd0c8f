//! Copy-on-write projection of license state for look-ahead planning.
//!
//! A `None` view means license tracking is disabled (or there is nothing to
//! track); every operation on a `None` view is a no-op so the backfill hot
//! path pays nothing in that case.

use crate::license::pool::{HresMode, LicensePool, LicenseRef};
use crate::state::job::Job;
use crate::state::reservation::ResvKey;
use crate::util::bitmap::NodeBitmap;

/// One remaining-count entry. Entries bound to a reservation shadow the
/// global entry with the same id for jobs inside that reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfLicense {
    pub id: LicenseRef,
    pub resv: Option<ResvKey>,
    pub remaining: u32,
}

pub type BfLicenses = Vec<BfLicense>;

/// Build the initial projection from the live pool. With
/// `bf_running_job_reserve`, running jobs' licenses are treated as still
/// available (they will be re-reserved as the plan replays them).
pub fn bf_licenses_initial(pool: &LicensePool, bf_running_job_reserve: bool) -> Option<BfLicenses> {
    if pool.is_empty() {
        return None;
    }
    Some(pool.with_inner_snapshot(|licenses| {
        licenses
            .iter()
            .map(|lic| BfLicense {
                id: lic.id,
                resv: None,
                remaining: if bf_running_job_reserve { lic.total } else { lic.total - lic.used.min(lic.total) },
            })
            .collect()
    }))
}

pub fn bf_licenses_copy(src: Option<&BfLicenses>) -> Option<BfLicenses> {
    src.cloned()
}

pub fn bf_licenses_to_string(licenses: Option<&BfLicenses>) -> String {
    let Some(list) = licenses else {
        return String::new();
    };
    list.iter()
        .map(|e| match e.resv {
            Some(_) => format!("resv:lic_id={}:{}", e.id.lic_id, e.remaining),
            None => format!("lic_id={}:{}", e.id.lic_id, e.remaining),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn find_global(list: &BfLicenses, lic_id: u16) -> Option<usize> {
    list.iter().position(|e| e.resv.is_none() && e.id.lic_id == lic_id)
}

fn find_resv(list: &BfLicenses, lic_id: u16, resv: ResvKey) -> Option<usize> {
    list.iter().position(|e| e.resv == Some(resv) && e.id.lic_id == lic_id)
}

/// Deduct a job's request from the projection. Reservation entries are
/// consumed before the global pool; OR requests take the first entry whose
/// combined sources satisfy the count.
pub fn bf_licenses_deduct(licenses: &mut Option<BfLicenses>, job: &Job, pool: &LicensePool) {
    let Some(list) = licenses.as_mut() else {
        return;
    };
    let mut lic_or = false;
    let mut found = false;

    for entry in job.license_list.iter() {
        if let Some(hres_id) = entry.id.hres_id {
            bf_hres_deduct(list, job, pool, hres_id, entry.total);
            continue;
        }
        lic_or = entry.op_or;
        let mut needed = entry.total;
        let mut resv_acquired = 0;
        let mut resv_idx = None;

        if let Some(resv) = job.resv_key {
            if let Some(i) = find_resv(list, entry.id.lic_id, resv) {
                resv_idx = Some(i);
                if needed <= list[i].remaining {
                    list[i].remaining -= needed;
                    if lic_or {
                        found = true;
                        break;
                    }
                    continue;
                }
                resv_acquired = list[i].remaining;
                needed -= resv_acquired;
                list[i].remaining = 0;
            }
        }

        match find_global(list, entry.id.lic_id) {
            None => log::error!("backfill projection missing license lic_id={}", entry.id.lic_id),
            Some(i) if list[i].remaining < needed => {
                if lic_or {
                    // Not an error; put back what the reservation lent and
                    // try the next alternative.
                    if let Some(ri) = resv_idx {
                        list[ri].remaining += resv_acquired;
                    }
                    continue;
                }
                log::error!("backfill projection underflow on lic_id={}", entry.id.lic_id);
                list[i].remaining = 0;
            }
            Some(i) => {
                list[i].remaining -= needed;
                if lic_or {
                    found = true;
                    break;
                }
            }
        }
    }

    if lic_or && !found {
        // Availability should have been checked first; reaching this point
        // indicates an error in bf_licenses_avail.
        log::error!("no OR'd licenses available in backfill plan for job {}", job.id);
    }
}

fn bf_hres_deduct(list: &mut BfLicenses, job: &Job, pool: &LicensePool, hres_id: u16, total: u32) {
    let Some(job_nodes) = job.alloc.as_ref().map(|a| &a.node_bitmap) else {
        return;
    };
    let cluster = pool.snapshot();
    for entry in list.iter_mut() {
        if entry.id.hres_id != Some(hres_id) {
            continue;
        }
        let Some(lic) = cluster.iter().find(|l| l.id.lic_id == entry.id.lic_id) else {
            continue;
        };
        let overlaps = lic.node_bitmap.as_ref().map(|b| b.overlap_any(job_nodes)).unwrap_or(false);
        if !overlaps {
            continue;
        }
        if entry.remaining < total {
            log::error!("backfill projection underflow on lic_id={}", entry.id.lic_id);
            entry.remaining = 0;
        } else {
            entry.remaining -= total;
        }
        if lic.mode == HresMode::Mode1 {
            break;
        }
    }
}

/// Test whether the projection can satisfy a job's request without
/// mutating it. A `None` view always reports available.
pub fn bf_licenses_avail(licenses: Option<&BfLicenses>, job: &Job, node_bitmap: Option<&NodeBitmap>, pool: &LicensePool) -> bool {
    let Some(list) = licenses else {
        return true;
    };
    let mut avail = true;

    for entry in job.license_list.iter() {
        if entry.id.hres_id.is_some() {
            let Some(node_bitmap) = node_bitmap else {
                continue;
            };
            let mut filtered = node_bitmap.clone();
            bf_hres_filter(job, &mut filtered, list, pool);
            if filtered != *node_bitmap {
                avail = false;
                break;
            }
        }
        let mut needed = entry.total;

        if let Some(resv) = job.resv_key {
            if let Some(i) = find_resv(list, entry.id.lic_id, resv) {
                if needed <= list[i].remaining {
                    if entry.op_or {
                        return true;
                    }
                    continue;
                }
                needed -= list[i].remaining;
            }
        }

        match find_global(list, entry.id.lic_id) {
            Some(i) if list[i].remaining >= needed => {
                if entry.op_or {
                    return true;
                }
            }
            _ => {
                avail = false;
                // OR keeps searching for an available alternative.
                if entry.op_or {
                    continue;
                }
                break;
            }
        }
    }
    avail
}

/// Move a job's licenses under the control of its reservation: deduct from
/// the global entries and append reservation-locked records.
pub fn bf_licenses_transfer(licenses: &mut Option<BfLicenses>, job: &Job) {
    let Some(list) = licenses.as_mut() else {
        return;
    };
    let Some(resv) = job.resv_key else {
        return;
    };
    for entry in job.license_list.iter() {
        let needed = entry.total;
        let reservable = match find_global(list, entry.id.lic_id) {
            None => {
                log::error!("backfill projection missing license lic_id={}", entry.id.lic_id);
                needed
            }
            Some(i) if list[i].remaining < needed => {
                log::error!("backfill projection underflow on lic_id={}", entry.id.lic_id);
                let r = list[i].remaining;
                list[i].remaining = 0;
                r
            }
            Some(i) => {
                list[i].remaining -= needed;
                needed
            }
        };
        list.push(BfLicense { id: entry.id, resv: Some(resv), remaining: reservable });
    }
}

/// Pairwise equality over matching (lic_id, reservation) keys. A `None`
/// left side compares equal to anything, mirroring the disabled-tracking
/// contract.
pub fn bf_licenses_equal(a: Option<&BfLicenses>, b: Option<&BfLicenses>) -> bool {
    let Some(a) = a else {
        return true;
    };
    a.iter().all(|ea| match b {
        None => false,
        Some(b) => b
            .iter()
            .find(|eb| eb.id.lic_id == ea.id.lic_id && eb.resv == ea.resv)
            .map(|eb| eb.remaining == ea.remaining)
            .unwrap_or(false),
    })
}

/// Hierarchical node filtering against the projection instead of the live
/// pool, used when the planner evaluates a hypothetical future.
pub fn bf_hres_filter(job: &Job, node_bitmap: &mut NodeBitmap, list: &BfLicenses, pool: &LicensePool) {
    let cluster = pool.snapshot();
    for entry in job.license_list.iter() {
        let Some(hres_id) = entry.id.hres_id else {
            continue;
        };
        let mut mask = NodeBitmap::new(node_bitmap.len());
        for bf in list.iter().filter(|e| e.id.hres_id == Some(hres_id)) {
            let Some(lic) = cluster.iter().find(|l| l.id.lic_id == bf.id.lic_id) else {
                continue;
            };
            let Some(bitmap) = &lic.node_bitmap else {
                continue;
            };
            if entry.total <= bf.remaining {
                mask.or_assign(bitmap);
            }
        }
        if entry.mode == HresMode::Mode2 {
            for bf in list.iter().filter(|e| e.id.hres_id == Some(hres_id)) {
                let Some(lic) = cluster.iter().find(|l| l.id.lic_id == bf.id.lic_id) else {
                    continue;
                };
                let Some(bitmap) = &lic.node_bitmap else {
                    continue;
                };
                if entry.total > bf.remaining {
                    mask.and_not_assign(bitmap);
                }
            }
        }
        node_bitmap.and_assign(&mask);
    }
}
