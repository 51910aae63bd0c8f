//! Cluster-wide consumable resource (license) accounting.
//!
//! The pool is a single-owner object handed to the scheduler at
//! construction; one mutex guards every mutation, including reservation
//! sub-pools and the remote-sync walk. Queries that tolerate a snapshot
//! take a lightweight copy instead of holding the lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::state::job::Job;
use crate::state::node::NodeTable;
use crate::state::reservation::ResvKey;
use crate::util::bitmap::NodeBitmap;

/// Stable identity of a pool record. Hierarchical siblings share `hres_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LicenseRef {
    pub lic_id: u16,
    pub hres_id: Option<u16>,
}

/// Node-binding mode of a hierarchical license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HresMode {
    Off,
    /// Exclusive: placement restricted to the union of satisfying siblings.
    Mode1,
    /// Inclusive: all sibling nodes minus those of failing siblings.
    Mode2,
}

/// Origin of a pool record. The two remote states drive removal of absent
/// entries during a sync walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
    RemoteSeen,
}

/// Global pool record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub name: String,
    pub total: u32,
    pub used: u32,
    /// Transferred into reservation sub-pools; counts against availability.
    pub reserved: u32,
    /// Consumption observed by a remote accounting DB beyond what this
    /// cluster handed out; reduces effective availability.
    pub last_deficit: u32,
    pub last_consumed: u32,
    pub last_update: i64,
    pub origin: Origin,
    pub id: LicenseRef,
    pub mode: HresMode,
    pub nodes: Option<String>,
    #[serde(skip)]
    pub node_bitmap: Option<NodeBitmap>,
}

/// One entry of a job's license request, bound to a pool record.
/// Order is preserved from the submission string; it decides which license
/// an OR request takes.
#[derive(Debug, Clone)]
pub struct LicenseRequest {
    pub name: String,
    pub total: u32,
    /// Non-zero once the allocation has been applied to the pool; makes
    /// restore replays idempotent.
    pub used: u32,
    pub op_or: bool,
    pub id: LicenseRef,
    pub mode: HresMode,
    pub nodes: Option<String>,
    /// Portion drawn from the job's reservation sub-pool.
    pub resv_taken: u32,
}

/// Parsed but not yet bound license entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLicense {
    pub name: String,
    pub nodes: Option<String>,
    pub count: u32,
    pub op_or: bool,
}

/// Record from a remote accounting database.
#[derive(Debug, Clone)]
pub struct RemoteRecord {
    pub name: String,
    pub server: String,
    /// Total licenses that exist across all clusters.
    pub count: u32,
    /// Share granted to this cluster: absolute count or percent of total.
    pub allowed: u32,
    pub absolute: bool,
    pub last_consumed: u32,
    pub last_update: i64,
}

impl RemoteRecord {
    pub fn qualified_name(&self) -> String {
        format!("{}@{}", self.name, self.server)
    }
}

/// Hierarchical resource configuration overlay.
#[derive(Debug, Clone)]
pub struct HresConfig {
    pub name: String,
    pub nodes: Vec<String>,
    pub total: u32,
    pub mode: HresMode,
}

/// Outcome of a license dry-run for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseTest {
    Ok,
    /// Transiently unavailable; retry next cycle.
    Busy,
    /// The request exceeds the configured totals and can never succeed.
    Never,
}

#[derive(Debug, Clone)]
struct ResvSubPool {
    resv: ResvKey,
    lic_id: u16,
    total: u32,
    used: u32,
    start_time: i64,
    end_time: i64,
}

#[derive(Debug, Default)]
struct PoolInner {
    licenses: Vec<License>,
    resv_pools: Vec<ResvSubPool>,
    next_lic_id: u16,
    last_update: i64,
    reclaim_licenses: bool,
}

#[derive(Debug, Default)]
pub struct LicensePool {
    inner: Mutex<PoolInner>,
}

/// Parse a license string like `"db:4,compiler:8"` or `"matlab:2|comsol:2"`.
///
/// OR ('|') and AND (','/';') are mutually exclusive within one string.
/// With `hres` set, a parenthesised node list may follow the name and ','
/// is not a separator (node lists are comma separated themselves).
pub fn parse_license_spec(spec: &str, hres: bool) -> Result<Vec<ParsedLicense>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    let op_or = spec.contains('|');
    if op_or && (spec.contains(',') || spec.contains(';')) {
        return Err(Error::InvalidLicenses(format!("cannot mix AND and OR operators: {spec}")));
    }

    let tokens: Vec<&str> = if op_or {
        spec.split('|').collect()
    } else if hres {
        spec.split(';').collect()
    } else {
        spec.split([',', ';']).collect()
    };

    let mut entries: Vec<ParsedLicense> = Vec::new();
    for token in tokens {
        if token.is_empty() || token.chars().any(|c| c.is_whitespace()) {
            return Err(Error::InvalidLicenses(format!("malformed license token: {token:?}")));
        }

        let (head, nodes) = match token.find('(') {
            Some(open) if hres => {
                let close = token[open..].find(')').map(|i| open + i).ok_or_else(|| {
                    Error::InvalidLicenses(format!("unterminated node list: {token}"))
                })?;
                let nodes = token[open + 1..close].to_string();
                let rest = &token[close + 1..];
                (format!("{}{}", &token[..open], rest), Some(nodes))
            }
            _ => (token.to_string(), None),
        };

        let (name, count) = match head.find([':', '=']) {
            Some(sep) => {
                let count: u32 = head[sep + 1..]
                    .parse()
                    .map_err(|_| Error::InvalidLicenses(format!("bad license count in {token:?}")))?;
                (head[..sep].to_string(), count)
            }
            None => (head, 1),
        };
        if name.is_empty() {
            return Err(Error::InvalidLicenses(format!("missing license name: {token:?}")));
        }

        // Repeated plain names accumulate ("tux:2,tux:3" == "tux:5")
        if nodes.is_none() {
            if let Some(prev) = entries.iter_mut().find(|e| e.name == name && e.nodes.is_none()) {
                prev.count += count;
                continue;
            }
        }
        entries.push(ParsedLicense { name, nodes, count, op_or });
    }
    Ok(entries)
}

/// Render a bound request list back to its string form; inverse of the
/// parser, used for the checkpointable `licenses_allocated` field.
pub fn license_list_to_string(list: &[LicenseRequest]) -> String {
    let mut out = String::new();
    for (i, entry) in list.iter().enumerate() {
        if i > 0 {
            out.push(if entry.op_or { '|' } else { ';' });
        }
        match &entry.nodes {
            Some(nodes) => out.push_str(&format!("{}({}):{}", entry.name, nodes, entry.total)),
            None => out.push_str(&format!("{}:{}", entry.name, entry.total)),
        }
    }
    out
}

/// True if any license id appears in both request lists.
pub fn license_list_overlap(a: &[LicenseRequest], b: &[LicenseRequest]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.id.lic_id == y.id.lic_id))
}

fn sufficient(request_total: u32, lic: &License, resv_blocked: u32) -> bool {
    request_total + lic.used + lic.last_deficit + resv_blocked <= lic.total
}

impl PoolInner {
    fn find_by_name(&self, name: &str) -> Option<usize> {
        self.licenses.iter().position(|l| l.name == name)
    }

    fn find_by_name_nodes(&self, name: &str, nodes: Option<&str>) -> Option<usize> {
        self.licenses.iter().position(|l| l.name == name && l.nodes.as_deref() == nodes)
    }

    fn find_by_id(&self, lic_id: u16) -> Option<usize> {
        self.licenses.iter().position(|l| l.id.lic_id == lic_id)
    }

    fn assign_ids(&mut self) {
        for lic in self.licenses.iter_mut() {
            if lic.id.lic_id == u16::MAX {
                lic.id.lic_id = self.next_lic_id;
                self.next_lic_id += 1;
            }
        }
    }

    /// Blocked count for a license at `when`: sub-pool remainders of
    /// reservations other than the job's own whose window covers `when`.
    fn resv_blocked(&self, own_resv: Option<ResvKey>, lic_id: u16, when: i64) -> u32 {
        self.resv_pools
            .iter()
            .filter(|sp| sp.lic_id == lic_id && Some(sp.resv) != own_resv)
            .filter(|sp| when >= sp.start_time && when < sp.end_time)
            .map(|sp| sp.total - sp.used)
            .sum()
    }

    fn sub_pool_mut(&mut self, resv: ResvKey, lic_id: u16) -> Option<&mut ResvSubPool> {
        self.resv_pools.iter_mut().find(|sp| sp.resv == resv && sp.lic_id == lic_id)
    }

    fn apply_remote(lic: &mut License, rec: &RemoteRecord) {
        lic.total = if rec.absolute { rec.allowed } else { rec.count * rec.allowed / 100 };

        let external = if lic.total > rec.count {
            log::debug!("allocated more licenses than exist total ({} > {}). this should not happen.", lic.total, rec.count);
            0
        } else {
            rec.count - lic.total
        };

        lic.last_consumed = rec.last_consumed;
        if lic.last_consumed <= external + lic.used {
            lic.last_deficit = 0;
        } else {
            // Someone outside our tracking is consuming licenses; shrink
            // effective availability until the DB catches up.
            lic.last_deficit = lic.last_consumed - external - lic.used;
        }
        lic.last_update = rec.last_update;
    }
}

impl LicensePool {
    pub fn new() -> LicensePool {
        LicensePool { inner: Mutex::new(PoolInner::default()) }
    }

    /// Initialize the pool from the configured license string, overlay the
    /// hierarchical resource config, and assign stable ids.
    pub fn init(&self, licenses: &str, hres: &[HresConfig], reclaim_licenses: bool, nodes: &NodeTable, now: i64) -> Result<()> {
        let parsed = parse_license_spec(licenses, false)?;
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        inner.reclaim_licenses = reclaim_licenses;
        inner.last_update = now;
        inner.licenses = parsed
            .into_iter()
            .map(|p| License {
                name: p.name,
                total: p.count,
                used: 0,
                reserved: 0,
                last_deficit: 0,
                last_consumed: 0,
                last_update: now,
                origin: Origin::Local,
                id: LicenseRef { lic_id: u16::MAX, hres_id: None },
                mode: HresMode::Off,
                nodes: None,
                node_bitmap: None,
            })
            .collect();

        Self::overlay_hres(&mut inner.licenses, hres, nodes, now)?;
        inner.next_lic_id = 0;
        for lic in inner.licenses.iter_mut() {
            lic.id.lic_id = u16::MAX;
        }
        inner.assign_ids();
        Self::bind_hres_ids(&mut inner)?;
        log::info!("license pool initialized with {} records", inner.licenses.len());
        Ok(())
    }

    fn overlay_hres(list: &mut Vec<License>, hres: &[HresConfig], nodes: &NodeTable, now: i64) -> Result<()> {
        for cfg in hres {
            let node_bitmap = nodes
                .bitmap_from_names(&cfg.nodes)
                .ok_or_else(|| Error::ModelConstructionError(format!("unknown node in hres license {}", cfg.name)))?;
            list.push(License {
                name: cfg.name.clone(),
                total: cfg.total,
                used: 0,
                reserved: 0,
                last_deficit: 0,
                last_consumed: 0,
                last_update: now,
                origin: Origin::Local,
                id: LicenseRef { lic_id: u16::MAX, hres_id: None },
                mode: cfg.mode,
                nodes: Some(cfg.nodes.join(",")),
                node_bitmap: Some(node_bitmap),
            });
        }
        Ok(())
    }

    /// Hierarchical siblings share the hres_id of the first record with
    /// their name; Mode1 siblings are ordered largest pool first so the
    /// least constrained sibling is preferred.
    fn bind_hres_ids(inner: &mut PoolInner) -> Result<()> {
        let heads: HashMap<String, (u16, HresMode)> = {
            let mut map = HashMap::new();
            for lic in inner.licenses.iter() {
                map.entry(lic.name.clone()).or_insert((lic.id.lic_id, lic.mode));
            }
            map
        };
        for lic in inner.licenses.iter_mut() {
            if lic.nodes.is_some() {
                let (head_id, head_mode) = heads[&lic.name];
                if head_mode != lic.mode {
                    return Err(Error::ModelConstructionError(format!("hres mode mismatch for {}", lic.name)));
                }
                lic.id.hres_id = Some(head_id);
            } else {
                lic.id.hres_id = None;
            }
        }
        inner.licenses.sort_by(|a, b| {
            if a.id.hres_id.is_some() && a.id.hres_id == b.id.hres_id && a.mode == HresMode::Mode1 {
                b.total.cmp(&a.total)
            } else {
                std::cmp::Ordering::Equal
            }
        });
        Ok(())
    }

    /// Reconfig path: rebuild the pool from a new license string while
    /// preserving ids of surviving entries and keeping remote records.
    pub fn update(&self, licenses: &str, hres: &[HresConfig], nodes: &NodeTable, now: i64) -> Result<()> {
        let parsed = parse_license_spec(licenses, false)?;
        let mut inner = self.inner.lock().expect("license mutex poisoned");

        let mut new_list: Vec<License> = parsed
            .into_iter()
            .map(|p| License {
                name: p.name,
                total: p.count,
                used: 0,
                reserved: 0,
                last_deficit: 0,
                last_consumed: 0,
                last_update: now,
                origin: Origin::Local,
                id: LicenseRef { lic_id: u16::MAX, hres_id: None },
                mode: HresMode::Off,
                nodes: None,
                node_bitmap: None,
            })
            .collect();
        Self::overlay_hres(&mut new_list, hres, nodes, now)?;

        for old in inner.licenses.iter_mut() {
            if old.origin != Origin::Local {
                // Remote entries are managed by the sync walk; carry over.
                let mut carried = old.clone();
                carried.used = 0;
                new_list.push(carried);
                continue;
            }
            match new_list.iter_mut().find(|n| n.name == old.name && n.nodes == old.nodes) {
                Some(found) => {
                    found.id = old.id;
                    if old.used > found.total {
                        log::info!("license {} count decreased below use", found.name);
                    }
                }
                None => {
                    log::info!("license {} removed with {} in use", old.name, old.used);
                }
            }
        }

        inner.licenses = new_list;
        inner.last_update = now;
        inner.assign_ids();
        Self::bind_hres_ids(&mut inner)?;
        Ok(())
    }

    /// Parse and bind a job license request against the pool.
    ///
    /// With `validate_configured`, counts above the configured totals are
    /// rejected. With `validate_existing`, unknown names are rejected;
    /// otherwise they are silently dropped from the result. `tres_counts`
    /// receives (name, count) for each surviving entry.
    pub fn validate(
        &self,
        spec: &str,
        validate_configured: bool,
        validate_existing: bool,
        hres: bool,
        mut tres_counts: Option<&mut HashMap<String, u64>>,
    ) -> Result<Vec<LicenseRequest>> {
        let parsed = parse_license_spec(spec, hres)?;
        let inner = self.inner.lock().expect("license mutex poisoned");

        let mut bound = Vec::with_capacity(parsed.len());
        for entry in parsed {
            let found = match &entry.nodes {
                Some(nodes) => inner.find_by_name_nodes(&entry.name, Some(nodes.as_str())),
                None => inner.find_by_name(&entry.name),
            };
            let Some(idx) = found else {
                log::debug!("license name requested ({}) does not exist", entry.name);
                if !validate_existing {
                    continue;
                }
                return Err(Error::LicenseNotFound(entry.name));
            };
            let lic = &inner.licenses[idx];
            if validate_configured && entry.count > lic.total {
                log::debug!("license count requested higher than configured ({}: {} > {})", lic.name, entry.count, lic.total);
                // An OR alternative beyond the configured total is kept in
                // the list (a later entry may satisfy the request); an AND
                // entry makes the whole request invalid.
                if !entry.op_or {
                    return Err(Error::LicensesExceedTotal(entry.name));
                }
            }
            if let Some(counts) = tres_counts.as_deref_mut() {
                counts.insert(entry.name.clone(), entry.count as u64);
            }
            bound.push(LicenseRequest {
                name: entry.name,
                total: entry.count,
                used: 0,
                op_or: entry.op_or,
                id: lic.id,
                mode: lic.mode,
                nodes: entry.nodes,
                resv_taken: 0,
            });
        }
        Ok(bound)
    }

    /// Dry-run availability test. Hierarchical entries are excluded here;
    /// they constrain node eligibility through [`hres_filter`] instead.
    ///
    /// With reclaim enabled and an AND request, deficient licenses are
    /// collected into `job.licenses_to_preempt` for the preemption engine.
    pub fn job_test(&self, job: &mut Job, when: i64, check_preempt: bool) -> LicenseTest {
        if job.license_list.is_empty() {
            return LicenseTest::Ok;
        }
        let job_id = job.id;
        let resv_key = job.resv_key;

        let inner = self.inner.lock().expect("license mutex poisoned");
        let use_reclaim = inner.reclaim_licenses && check_preempt && !job.license_list.first().map(|e| e.op_or).unwrap_or(false);
        let mut to_preempt: Vec<u16> = Vec::new();
        let mut result = LicenseTest::Ok;
        let mut or_satisfied = false;

        for entry in job.license_list.iter() {
            if entry.id.hres_id.is_some() {
                continue;
            }
            let Some(idx) = inner.find_by_id(entry.id.lic_id) else {
                log::error!("could not find license {} for job {}", entry.name, job_id);
                result = LicenseTest::Never;
                to_preempt.clear();
                break;
            };
            let lic = &inner.licenses[idx];
            if entry.total > lic.total {
                log::info!("job {} wants more {} licenses than configured", job_id, entry.name);
                if entry.op_or {
                    // This alternative can never be taken; try the rest.
                    continue;
                }
                result = LicenseTest::Never;
                to_preempt.clear();
                break;
            }

            // Sub-pool credit reduces residual demand on the global pool.
            let resv_credit = match resv_key {
                Some(resv) => inner
                    .resv_pools
                    .iter()
                    .find(|sp| sp.resv == resv && sp.lic_id == entry.id.lic_id)
                    .map(|sp| (sp.total - sp.used).min(entry.total))
                    .unwrap_or(0),
                None => 0,
            };
            let residual = entry.total - resv_credit;

            let blocked = inner.resv_blocked(resv_key, entry.id.lic_id, when);
            if !sufficient(residual, lic, blocked) {
                if use_reclaim && !to_preempt.contains(&entry.id.lic_id) {
                    to_preempt.push(entry.id.lic_id);
                }
                result = LicenseTest::Busy;
            } else if entry.op_or {
                // First satisfying entry wins; nothing to preempt for.
                or_satisfied = true;
                break;
            }
        }
        drop(inner);

        if or_satisfied {
            job.licenses_to_preempt.clear();
            return LicenseTest::Ok;
        }
        let is_or = job.license_list.first().map(|e| e.op_or).unwrap_or(false);
        if is_or && result == LicenseTest::Ok {
            // Every alternative was beyond its configured total.
            return LicenseTest::Never;
        }
        if use_reclaim {
            job.licenses_to_preempt = to_preempt;
        }
        result
    }

    /// Reserve the job's licenses. AND requests were already tested, so
    /// every entry is applied; OR requests re-test and take the first
    /// satisfying entry, discarding the rest of the list.
    ///
    /// With `restore`, a previously saved allocation is replayed: entries
    /// already marked used are skipped, which makes the replay idempotent.
    pub fn job_get(&self, job: &mut Job, restore: bool, when: i64) -> Result<()> {
        if job.license_list.is_empty() {
            return Ok(());
        }
        let job_id = job.id;
        let resv_key = job.resv_key;
        let job_nodes = job.alloc.as_ref().map(|a| a.node_bitmap.clone());

        let mut inner = self.inner.lock().expect("license mutex poisoned");
        inner.last_update = when;
        let mut lic_or = false;
        let mut taken_index: Option<usize> = None;

        for (i, entry) in job.license_list.iter_mut().enumerate() {
            if entry.used > 0 {
                // Allocation already applied (restore replay).
                if entry.op_or {
                    taken_index = Some(i);
                    lic_or = true;
                    break;
                }
                continue;
            }

            if let Some(hres_id) = entry.id.hres_id {
                Self::hres_job_get(&mut inner, entry, hres_id, job_nodes.as_ref());
                entry.used += entry.total;
                continue;
            }

            lic_or = entry.op_or;
            let Some(idx) = inner.find_by_id(entry.id.lic_id) else {
                log::error!("could not find license {} for job {}", entry.name, job_id);
                return Err(Error::LicenseNotFound(entry.name.clone()));
            };

            // Draw from the reservation sub-pool first; residual demand
            // spills to the global pool.
            let mut residual = entry.total;
            let mut from_resv = 0;
            if let Some(resv) = resv_key {
                if let Some(sp) = inner.sub_pool_mut(resv, entry.id.lic_id) {
                    from_resv = (sp.total - sp.used).min(residual);
                    residual -= from_resv;
                }
            }

            if lic_or {
                let blocked = inner.resv_blocked(resv_key, entry.id.lic_id, when);
                if !sufficient(residual, &inner.licenses[idx], blocked) {
                    // Not enough of this one; try the next OR alternative.
                    continue;
                }
            }

            if from_resv > 0 {
                if let Some(sp) = inner.sub_pool_mut(resv_key.expect("resv_taken without resv"), entry.id.lic_id) {
                    sp.used += from_resv;
                }
                entry.resv_taken = from_resv;
            }
            let lic = &mut inner.licenses[idx];
            lic.used += residual;
            entry.used += entry.total;
            if lic.origin != Origin::Local && restore {
                lic.last_deficit = lic.last_deficit.saturating_sub(entry.total);
            }
            if lic_or {
                taken_index = Some(i);
                break;
            }
        }
        drop(inner);

        if lic_or {
            let Some(keep) = taken_index else {
                // Tested available but allocation found nothing; indicates
                // faulty logic upstream.
                log::error!("could not allocate licenses {:?} for job {}", job.licenses, job_id);
                return Err(Error::InvalidLicenses(format!("no OR alternative available for job {job_id}")));
            };
            let kept = job.license_list.swap_remove(keep);
            job.license_list.clear();
            job.license_list.push(kept);
        }
        if !restore {
            job.licenses_allocated = Some(license_list_to_string(&job.license_list));
        }
        Ok(())
    }

    fn hres_job_get(inner: &mut PoolInner, entry: &mut LicenseRequest, hres_id: u16, job_nodes: Option<&NodeBitmap>) {
        let Some(job_nodes) = job_nodes else {
            return;
        };
        let mode = entry.mode;
        let mut rebind: Option<(u16, Option<String>)> = None;
        for lic in inner.licenses.iter_mut() {
            if lic.id.hres_id != Some(hres_id) {
                continue;
            }
            let overlaps = lic.node_bitmap.as_ref().map(|b| b.overlap_any(job_nodes)).unwrap_or(false);
            if !overlaps {
                continue;
            }
            match mode {
                HresMode::Mode1 => {
                    if sufficient(entry.total, lic, 0) {
                        lic.used += entry.total;
                        rebind = Some((lic.id.lic_id, lic.nodes.clone()));
                        break;
                    }
                }
                HresMode::Mode2 => {
                    lic.used += entry.total;
                }
                HresMode::Off => {}
            }
        }
        if let Some((lic_id, nodes)) = rebind {
            entry.id.lic_id = lic_id;
            entry.nodes = nodes;
        }
    }

    /// Return the licenses a job holds. Returns the number of entries whose
    /// pool state changed; zero when the job held nothing.
    pub fn job_return(&self, job: &mut Job) -> usize {
        if job.license_list.is_empty() {
            return 0;
        }
        let job_id = job.id;
        let job_nodes = job.alloc.as_ref().map(|a| a.node_bitmap.clone());
        let resv_key = job.resv_key;
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        let mut changed = 0;

        for entry in job.license_list.iter_mut() {
            if entry.used == 0 {
                continue;
            }

            if entry.mode == HresMode::Mode2 {
                let hres_id = entry.id.hres_id;
                for lic in inner.licenses.iter_mut() {
                    if lic.id.hres_id != hres_id || hres_id.is_none() {
                        continue;
                    }
                    let overlaps = match (&lic.node_bitmap, &job_nodes) {
                        (Some(b), Some(j)) => b.overlap_any(j),
                        _ => false,
                    };
                    if !overlaps {
                        continue;
                    }
                    if lic.used >= entry.total {
                        lic.used -= entry.total;
                    } else {
                        log::error!("license use count underflow for lic_id={}", lic.id.lic_id);
                        lic.used = 0;
                    }
                }
                entry.used = 0;
                changed += 1;
                continue;
            }

            let residual = entry.total - entry.resv_taken;
            if entry.resv_taken > 0 {
                if let Some(resv) = resv_key {
                    if let Some(sp) = inner.sub_pool_mut(resv, entry.id.lic_id) {
                        sp.used = sp.used.saturating_sub(entry.resv_taken);
                    }
                }
                entry.resv_taken = 0;
            }
            match inner.find_by_id(entry.id.lic_id) {
                Some(idx) => {
                    let lic = &mut inner.licenses[idx];
                    if lic.used >= residual {
                        lic.used -= residual;
                    } else {
                        log::error!("license use count underflow for lic_id={}", lic.id.lic_id);
                        lic.used = 0;
                    }
                    changed += 1;
                }
                None => {
                    // Can happen after a reconfiguration.
                    log::error!("job {} returning unknown license lic_id={}", job_id, entry.id.lic_id);
                }
            }
            entry.used = 0;
            if entry.mode == HresMode::Mode1 {
                if let Some(hres_id) = entry.id.hres_id {
                    entry.id.lic_id = hres_id;
                }
            }
        }
        changed
    }

    /// Restart path: rebuild the job's license list from its checkpointed
    /// allocation string and replay the allocation against the pool.
    pub fn job_restore(&self, job: &mut Job, when: i64) -> Result<()> {
        let Some(saved) = job.licenses_allocated.clone() else {
            return Ok(());
        };
        job.license_list = self.validate(&saved, false, false, false, None)?;
        self.job_get(job, true, when)
    }

    /// Rebuild a job's license list from its string form, eliminating
    /// duplicates introduced by merging jobs.
    pub fn job_merge(&self, job: &mut Job) -> Result<()> {
        let spec = job.licenses.clone().unwrap_or_default();
        job.license_list = self.validate(&spec, false, false, false, None)?;
        job.licenses = Some(license_list_to_string(&job.license_list));
        Ok(())
    }

    /// Restrict `node_bitmap` according to the job's hierarchical license
    /// requests (spec modes 1 and 2).
    pub fn hres_filter(&self, job: &Job, node_bitmap: &mut NodeBitmap) {
        if job.license_list.is_empty() {
            return;
        }
        let inner = self.inner.lock().expect("license mutex poisoned");
        for entry in job.license_list.iter() {
            let Some(hres_id) = entry.id.hres_id else {
                continue;
            };
            let mut mask = NodeBitmap::new(node_bitmap.len());
            for lic in inner.licenses.iter().filter(|l| l.id.hres_id == Some(hres_id)) {
                let Some(bitmap) = &lic.node_bitmap else {
                    continue;
                };
                if sufficient(entry.total, lic, 0) {
                    mask.or_assign(bitmap);
                }
            }
            if entry.mode == HresMode::Mode2 {
                for lic in inner.licenses.iter().filter(|l| l.id.hres_id == Some(hres_id)) {
                    let Some(bitmap) = &lic.node_bitmap else {
                        continue;
                    };
                    if !sufficient(entry.total, lic, 0) {
                        mask.and_not_assign(bitmap);
                    }
                }
            }
            node_bitmap.and_assign(&mask);
        }
    }

    /// Transfer licenses from the global pool into a reservation sub-pool.
    pub fn create_resv_pool(&self, resv: ResvKey, entries: &[(String, u32)], start_time: i64, end_time: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        for (name, count) in entries {
            let idx = inner.find_by_name(name).ok_or_else(|| Error::LicenseNotFound(name.clone()))?;
            let lic = &mut inner.licenses[idx];
            if lic.used + lic.reserved + count > lic.total {
                return Err(Error::InvalidLicenses(format!("not enough {name} licenses to reserve {count}")));
            }
            lic.reserved += count;
            let lic_id = lic.id.lic_id;
            inner.resv_pools.push(ResvSubPool { resv, lic_id, total: *count, used: 0, start_time, end_time });
        }
        Ok(())
    }

    /// Tear down a reservation's sub-pools and return the counts to the
    /// global pool.
    pub fn remove_resv_pool(&self, resv: ResvKey) {
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        let pools: Vec<ResvSubPool> = inner.resv_pools.iter().filter(|sp| sp.resv == resv).cloned().collect();
        inner.resv_pools.retain(|sp| sp.resv != resv);
        for sp in pools {
            if let Some(idx) = inner.find_by_id(sp.lic_id) {
                inner.licenses[idx].reserved = inner.licenses[idx].reserved.saturating_sub(sp.total);
            }
        }
    }

    // --- Remote database synchronisation ---

    pub fn add_remote(&self, rec: &RemoteRecord, now: i64) {
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        let name = rec.qualified_name();
        if inner.licenses.iter().any(|l| l.origin != Origin::Local && l.name == name) {
            log::error!("remote license {} already exists", name);
            return;
        }
        Self::push_remote(&mut inner, rec, Origin::Remote, now);
    }

    pub fn update_remote(&self, rec: &RemoteRecord, now: i64) {
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        let name = rec.qualified_name();
        match inner.licenses.iter_mut().find(|l| l.origin != Origin::Local && l.name == name) {
            Some(lic) => PoolInner::apply_remote(lic, rec),
            None => {
                log::debug!("remote license '{}' not found, adding", name);
                Self::push_remote(&mut inner, rec, Origin::Remote, now);
            }
        }
        inner.last_update = now;
    }

    pub fn remove_remote(&self, rec: &RemoteRecord, now: i64) {
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        let name = rec.qualified_name();
        let before = inner.licenses.len();
        inner.licenses.retain(|l| {
            if l.origin != Origin::Local && l.name == name {
                log::info!("remote license {} removed with {} in use", l.name, l.used);
                false
            } else {
                true
            }
        });
        if inner.licenses.len() == before {
            log::error!("remote license '{}' not found", name);
        } else {
            inner.last_update = now;
        }
    }

    /// Reconcile the pool against a full remote list: update matches,
    /// insert unknown records, drop remote entries absent from the list.
    pub fn sync_remote(&self, records: &[RemoteRecord], now: i64) {
        let mut inner = self.inner.lock().expect("license mutex poisoned");
        for rec in records {
            let name = rec.qualified_name();
            match inner.licenses.iter_mut().find(|l| l.origin != Origin::Local && l.name == name) {
                Some(lic) => {
                    lic.origin = Origin::RemoteSeen;
                    PoolInner::apply_remote(lic, rec);
                    if lic.used > lic.total {
                        log::info!("license {} count decreased", lic.name);
                    }
                }
                None => Self::push_remote(&mut inner, rec, Origin::RemoteSeen, now),
            }
        }
        inner.licenses.retain(|l| match l.origin {
            Origin::Remote => {
                log::info!("remote license {} removed with {} in use", l.name, l.used);
                false
            }
            _ => true,
        });
        for lic in inner.licenses.iter_mut() {
            if lic.origin == Origin::RemoteSeen {
                lic.origin = Origin::Remote;
            }
        }
        inner.last_update = now;
    }

    fn push_remote(inner: &mut PoolInner, rec: &RemoteRecord, origin: Origin, now: i64) {
        let mut lic = License {
            name: rec.qualified_name(),
            total: 0,
            used: 0,
            reserved: 0,
            last_deficit: 0,
            last_consumed: 0,
            last_update: now,
            origin,
            id: LicenseRef { lic_id: inner.next_lic_id, hres_id: None },
            mode: HresMode::Off,
            nodes: None,
            node_bitmap: None,
        };
        inner.next_lic_id += 1;
        PoolInner::apply_remote(&mut lic, rec);
        inner.licenses.push(lic);
        inner.last_update = now;
    }

    // --- Queries ---

    /// Lightweight copy of the pool records, for display and equality
    /// checks that tolerate a snapshot.
    pub fn snapshot(&self) -> Vec<License> {
        self.inner.lock().expect("license mutex poisoned").licenses.clone()
    }

    pub fn get_total_cnt(&self, name: &str) -> u32 {
        let inner = self.inner.lock().expect("license mutex poisoned");
        inner.find_by_name(name).map(|i| inner.licenses[i].total).unwrap_or(0)
    }

    pub fn last_update(&self) -> i64 {
        self.inner.lock().expect("license mutex poisoned").last_update
    }

    pub fn reclaim_licenses(&self) -> bool {
        self.inner.lock().expect("license mutex poisoned").reclaim_licenses
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("license mutex poisoned").licenses.is_empty()
    }

    pub(crate) fn with_inner_snapshot<R>(&self, f: impl FnOnce(&[License]) -> R) -> R {
        let inner = self.inner.lock().expect("license mutex poisoned");
        f(&inner.licenses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_or_mutually_exclusive() {
        assert!(parse_license_spec("a:1|b:2,c:3", false).is_err());
        assert!(parse_license_spec("a:1|b:2", false).is_ok());
        assert!(parse_license_spec("a:1,b:2;c:3", false).is_ok());
    }

    #[test]
    fn test_parse_merges_duplicates() {
        let parsed = parse_license_spec("tux:2,tux:3", false).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].count, 5);
    }

    #[test]
    fn test_parse_hres_node_list() {
        let parsed = parse_license_spec("fast(n0,n1):2;slow(n2):1", true).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].nodes.as_deref(), Some("n0,n1"));
        assert_eq!(parsed[1].count, 1);
    }

    #[test]
    fn test_parse_rejects_whitespace() {
        assert!(parse_license_spec("a :1", false).is_err());
    }
}
