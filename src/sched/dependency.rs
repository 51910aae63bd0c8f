//! Job dependency parsing and evaluation.
//!
//! The parser is pure: a dependency string becomes a typed list, and a
//! separate validation pass resolves target records and commits the list
//! to the job. Evaluation never mutates other jobs.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::state::job::{Job, JobId};
use crate::state::table::JobTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependType {
    /// Target has started (is no longer pending).
    After,
    /// Target reached any terminal state.
    AfterAny,
    /// Target completed successfully.
    AfterOk,
    /// Target completed with failure (or carries the special-exit flag).
    AfterNotOk,
    /// Job grows into the target's allocation.
    Expand,
    /// No earlier pending/running/suspended job with same owner+name.
    Singleton,
}

/// Which tasks of the target the rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayDep {
    /// Plain job target.
    None,
    /// A single task of an array.
    Task(u32),
    /// The array as a whole.
    Wildcard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub dep_type: DependType,
    /// Target job id; zero for singleton.
    pub job_id: u32,
    pub array_spec: ArrayDep,
}

/// Aggregate verdict over a job's dependency list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependResult {
    Ready,
    Waiting,
    Failed,
}

/// Parse a dependency string into typed entries without resolving targets.
///
/// Accepts the old single-id form ("123", "123_4", "123_*") which maps to
/// `afterany`, and the new form "afterok:123:124,after:128". ',' is AND.
pub fn parse_dependency_spec(spec: &str) -> Result<Vec<Dependency>> {
    let mut deps = Vec::new();
    let spec = spec.trim();
    if spec.is_empty() || spec == "0" {
        return Ok(deps);
    }

    for clause in spec.split(',') {
        if clause.eq_ignore_ascii_case("singleton") {
            deps.push(Dependency { dep_type: DependType::Singleton, job_id: 0, array_spec: ArrayDep::None });
            continue;
        }

        let (dep_type, ids) = match clause.split_once(':') {
            None => {
                // Old format: a bare job id.
                (DependType::AfterAny, clause)
            }
            Some((type_str, rest)) => {
                let dep_type = match type_str.to_ascii_lowercase().as_str() {
                    "after" => DependType::After,
                    "afterany" => DependType::AfterAny,
                    "afterok" => DependType::AfterOk,
                    "afternotok" => DependType::AfterNotOk,
                    "expand" => DependType::Expand,
                    other => return Err(Error::InvalidDependency(format!("unknown dependency type: {other}"))),
                };
                (dep_type, rest)
            }
        };

        for id_str in ids.split(':') {
            let (job_part, array_spec) = match id_str.split_once('_') {
                None => (id_str, ArrayDep::None),
                Some((job, "*")) => (job, ArrayDep::Wildcard),
                Some((job, task)) => {
                    let task: u32 = task.parse().map_err(|_| Error::InvalidDependency(format!("bad array task in {id_str:?}")))?;
                    (job, ArrayDep::Task(task))
                }
            };
            let job_id: u32 = job_part.parse().map_err(|_| Error::InvalidDependency(format!("bad job id in {id_str:?}")))?;
            if job_id == 0 {
                return Err(Error::InvalidDependency("job id must be non-zero".to_string()));
            }
            deps.push(Dependency { dep_type, job_id, array_spec });
        }
    }
    Ok(deps)
}

fn render(deps: &[Dependency]) -> Option<String> {
    if deps.is_empty() {
        return None;
    }
    let parts: Vec<String> = deps
        .iter()
        .map(|d| {
            let type_str = match d.dep_type {
                DependType::After => "after",
                DependType::AfterAny => "afterany",
                DependType::AfterOk => "afterok",
                DependType::AfterNotOk => "afternotok",
                DependType::Expand => "expand",
                DependType::Singleton => return "singleton".to_string(),
            };
            match d.array_spec {
                ArrayDep::None => format!("{}:{}", type_str, d.job_id),
                ArrayDep::Task(t) => format!("{}:{}_{}", type_str, d.job_id, t),
                ArrayDep::Wildcard => format!("{}:{}_*", type_str, d.job_id),
            }
        })
        .collect();
    Some(parts.join(","))
}

/// Validate and install a new dependency list on a job. On any error the
/// job's previous dependency list is preserved.
pub fn update_job_dependency(jobs: &mut JobTable, job_id: JobId, new_depend: &str, max_depend_depth: u32) -> Result<()> {
    let parsed = parse_dependency_spec(new_depend)?;

    jobs.get(job_id).ok_or(Error::JobNotFound(job_id.0))?;

    // Resolution pass: drop entries whose target no longer exists, promote
    // plain ids naming a whole array to wildcard, enforce expand rules.
    let mut resolved: Vec<Dependency> = Vec::with_capacity(parsed.len());
    let mut expanding: Option<JobId> = None;
    let mut expand_cnt = 0;
    for mut dep in parsed {
        if dep.dep_type == DependType::Singleton {
            resolved.push(dep);
            continue;
        }
        if dep.job_id == job_id.0 {
            return Err(Error::InvalidDependency("job cannot depend on itself".to_string()));
        }

        let target = match dep.array_spec {
            ArrayDep::Task(t) => jobs.find_dependency_target(dep.job_id, Some(t)),
            _ => jobs.find_dependency_target(dep.job_id, None),
        };

        if dep.array_spec == ArrayDep::None {
            // A plain id naming an array applies to the array as a whole.
            let is_array = target.map(|j| j.is_array_task()).unwrap_or(false) || jobs.array_tasks(dep.job_id).next().is_some();
            if is_array {
                dep.array_spec = ArrayDep::Wildcard;
            }
        }

        if dep.dep_type == DependType::Expand {
            expand_cnt += 1;
            let me = jobs.get(job_id).ok_or(Error::JobNotFound(job_id.0))?;
            let valid = expand_cnt == 1
                && target.map(|t| t.is_running() && t.qos == me.qos && t.part_key == me.part_key).unwrap_or(false);
            if !valid {
                return Err(Error::InvalidDependency("expand requires one running target in the same QoS and partition".to_string()));
            }
            expanding = Some(JobId(dep.job_id));
        }

        let target_exists = match dep.array_spec {
            ArrayDep::Wildcard => jobs.array_tasks(dep.job_id).next().is_some() || jobs.get(JobId(dep.job_id)).is_some(),
            ArrayDep::Task(t) => jobs.find_dependency_target(dep.job_id, Some(t)).is_some(),
            ArrayDep::None => target.is_some(),
        };
        if target_exists {
            resolved.push(dep);
        }
    }

    // Cycle check: A -> B -> A is rejected, bounded by max_depend_depth.
    let mut counter = 0;
    if scan_depend(jobs, &resolved, job_id.0, &mut counter, max_depend_depth) {
        return Err(Error::CircularDependency(job_id.0));
    }

    let job = jobs.get_mut(job_id).ok_or(Error::JobNotFound(job_id.0))?;
    job.expanding_job_id = expanding;
    if new_depend.trim().is_empty() || new_depend.trim() == "0" {
        job.depend_list.clear();
        job.dependency = None;
        job.orig_dependency = None;
        return Ok(());
    }
    job.dependency = render(&resolved);
    job.orig_dependency = Some(new_depend.to_string());
    job.depend_list = resolved;
    Ok(())
}

/// Recursive dependency scan. Returns true when `target_job_id` is found in
/// the chain. The depth bound makes long chains return false rather than
/// recurse without limit.
fn scan_depend(jobs: &JobTable, deps: &[Dependency], target_job_id: u32, counter: &mut u32, max_depth: u32) -> bool {
    if *counter >= max_depth {
        return false;
    }
    *counter += 1;

    for dep in deps {
        if dep.job_id == 0 {
            continue;
        }
        if dep.job_id == target_job_id {
            return true;
        }
        let Some(dep_job) = jobs.get(JobId(dep.job_id)) else {
            continue;
        };
        if !dep_job.is_finished()
            && !dep_job.depend_list.is_empty()
            && scan_depend(jobs, &dep_job.depend_list, target_job_id, counter, max_depth)
        {
            log::info!("circular dependency: job {} is dependent upon job {}", dep.job_id, target_job_id);
            return true;
        }
    }
    false
}

/// Memoises array-task dependency results within one scheduler tick, keyed
/// by (array head, original dependency string).
#[derive(Debug, Default)]
pub struct DependCache {
    results: HashMap<(u32, String), DependResult>,
}

impl DependCache {
    pub fn new() -> DependCache {
        DependCache { results: HashMap::new() }
    }

    fn key(job: &Job) -> Option<(u32, String)> {
        match (&job.array_job_id, &job.orig_dependency) {
            (Some(array_id), Some(orig)) => Some((*array_id, orig.clone())),
            _ => None,
        }
    }
}

/// Evaluate a job's dependency list, clear satisfied entries, and return
/// the aggregate verdict. Expand dependencies adjust the job's time limit
/// to the remaining time of the job being expanded.
pub fn test_job_dependency(jobs: &mut JobTable, job_id: JobId, cache: &mut DependCache, now: i64) -> DependResult {
    let Some(job) = jobs.get(job_id) else {
        return DependResult::Ready;
    };
    if job.depend_list.is_empty() {
        return DependResult::Ready;
    }

    if job.is_array_task() {
        if let Some(key) = DependCache::key(job) {
            if let Some(cached) = cache.results.get(&key) {
                return *cached;
            }
        }
    }

    let mut depends = false;
    let mut failure = false;
    let mut cleared: Vec<usize> = Vec::new();
    let mut new_time_limit: Option<i64> = None;

    for (i, dep) in job.depend_list.iter().enumerate() {
        let mut clear_dep = false;
        match dep.dep_type {
            DependType::Singleton => {
                if jobs.singleton_ready(job) {
                    clear_dep = true;
                } else {
                    depends = true;
                }
            }
            _ => {
                let target = match dep.array_spec {
                    ArrayDep::Task(t) => jobs.find_dependency_target(dep.job_id, Some(t)),
                    ArrayDep::Wildcard => None,
                    ArrayDep::None => jobs.get(JobId(dep.job_id)),
                };

                if dep.array_spec == ArrayDep::Wildcard {
                    // Apply the test to the array as a whole.
                    let array_exists = jobs.array_tasks(dep.job_id).next().is_some();
                    if !array_exists {
                        clear_dep = true;
                    } else {
                        let completed = jobs.array_completed(dep.job_id);
                        let complete = jobs.array_complete(dep.job_id);
                        let pending = jobs.array_pending(dep.job_id);
                        let special_exit = jobs.array_tasks(dep.job_id).any(|j| j.special_exit);
                        match dep.dep_type {
                            DependType::After => {
                                if !pending {
                                    clear_dep = true;
                                } else {
                                    depends = true;
                                }
                            }
                            DependType::AfterAny => {
                                if completed {
                                    clear_dep = true;
                                } else {
                                    depends = true;
                                }
                            }
                            DependType::AfterNotOk => {
                                if special_exit {
                                    clear_dep = true;
                                } else if !completed {
                                    depends = true;
                                } else if !complete {
                                    clear_dep = true;
                                } else {
                                    failure = true;
                                }
                            }
                            DependType::AfterOk => {
                                if !completed {
                                    depends = true;
                                } else if complete {
                                    clear_dep = true;
                                } else {
                                    failure = true;
                                }
                            }
                            _ => failure = true,
                        }
                    }
                } else {
                    match target {
                        None => {
                            // Target is gone; dependency lifted.
                            clear_dep = true;
                        }
                        Some(target) => match dep.dep_type {
                            DependType::After => {
                                if !target.is_pending() {
                                    clear_dep = true;
                                } else {
                                    depends = true;
                                }
                            }
                            DependType::AfterAny => {
                                if target.is_finished() {
                                    clear_dep = true;
                                } else {
                                    depends = true;
                                }
                            }
                            DependType::AfterNotOk => {
                                if target.special_exit {
                                    clear_dep = true;
                                } else if !target.is_finished() {
                                    depends = true;
                                } else if !target.completed_ok() {
                                    clear_dep = true;
                                } else {
                                    failure = true;
                                }
                            }
                            DependType::AfterOk => {
                                if !target.is_finished() {
                                    depends = true;
                                } else if target.completed_ok() {
                                    clear_dep = true;
                                } else {
                                    failure = true;
                                }
                            }
                            DependType::Expand => {
                                if target.is_pending() {
                                    depends = true;
                                } else if target.is_finished() {
                                    failure = true;
                                } else if target.end_time != 0 && target.end_time > now {
                                    new_time_limit = Some(target.end_time - now);
                                }
                            }
                            DependType::Singleton => unreachable!("handled above"),
                        },
                    }
                }
            }
        }
        if failure {
            break;
        }
        if clear_dep {
            cleared.push(i);
        }
    }

    let result = if failure {
        DependResult::Failed
    } else if depends {
        DependResult::Waiting
    } else {
        DependResult::Ready
    };

    let cache_key = DependCache::key(job);

    // Apply mutations after evaluation so the table is borrowed only once
    // mutably.
    let job = jobs.get_mut(job_id).expect("job disappeared during dependency test");
    for &i in cleared.iter().rev() {
        job.depend_list.remove(i);
    }
    if !cleared.is_empty() {
        job.dependency = render(&job.depend_list);
    }
    if let Some(limit) = new_time_limit {
        job.time_limit_secs = Some(limit);
    }

    if job.is_array_task() {
        if let Some(key) = cache_key {
            cache.results.insert(key, result);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new_format() {
        let deps = parse_dependency_spec("afterok:123:124,after:128").unwrap();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0], Dependency { dep_type: DependType::AfterOk, job_id: 123, array_spec: ArrayDep::None });
        assert_eq!(deps[2], Dependency { dep_type: DependType::After, job_id: 128, array_spec: ArrayDep::None });
    }

    #[test]
    fn test_parse_old_format_and_wildcard() {
        let deps = parse_dependency_spec("500_*").unwrap();
        assert_eq!(deps[0], Dependency { dep_type: DependType::AfterAny, job_id: 500, array_spec: ArrayDep::Wildcard });

        let deps = parse_dependency_spec("42").unwrap();
        assert_eq!(deps[0].dep_type, DependType::AfterAny);
    }

    #[test]
    fn test_parse_singleton() {
        let deps = parse_dependency_spec("singleton").unwrap();
        assert_eq!(deps[0].dep_type, DependType::Singleton);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(parse_dependency_spec("beforeok:12").is_err());
        assert!(parse_dependency_spec("afterok:0").is_err());
    }
}
