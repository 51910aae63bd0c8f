use gridsched::api::config_dto::{ClusterDto, JobDto, NodeDto, PartitionDto, SchedulerParamsDto};
use gridsched::build_system;
use gridsched::state::job::{JobId, JobState, Reason};
use gridsched::util::clock::ManualClock;

fn node(name: &str) -> NodeDto {
    NodeDto { name: name.to_string(), cpus: 4, sockets: 1, cores_per_socket: 4, available: true }
}

fn partition(name: &str, tier: u16, nodes: &[&str]) -> PartitionDto {
    PartitionDto {
        name: name.to_string(),
        priority_tier: tier,
        nodes: nodes.iter().map(|s| s.to_string()).collect(),
        min_nodes: 1,
        max_nodes: None,
        max_time_secs: None,
        max_share: None,
        preempt_mode: None,
        grace_time: 0,
        state_up: true,
    }
}

fn job(id: u32, partition: &str, priority: u32) -> JobDto {
    JobDto {
        id,
        name: format!("job{}", id),
        user_id: 100,
        priority,
        partition: partition.to_string(),
        alt_partitions: vec![],
        min_nodes: 1,
        max_nodes: None,
        licenses: None,
        dependency: None,
    }
}

fn cluster(nodes: Vec<NodeDto>, partitions: Vec<PartitionDto>, jobs: Vec<JobDto>) -> ClusterDto {
    ClusterDto { nodes, partitions, licenses: String::new(), hres_licenses: vec![], scheduler: SchedulerParamsDto::default(), jobs }
}

#[test]
fn test_basic_cycle_starts_jobs_until_nodes_exhausted() {
    let dto = cluster(
        vec![node("n0"), node("n1")],
        vec![partition("batch", 1, &["n0", "n1"])],
        vec![job(1, "batch", 300), job(2, "batch", 200), job(3, "batch", 100)],
    );
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();

    let started = system.scheduler.schedule(0);
    assert_eq!(started, 2);

    let jobs = system.state.jobs.read().unwrap();
    assert_eq!(jobs.get(JobId(1)).unwrap().state, JobState::Running);
    assert_eq!(jobs.get(JobId(2)).unwrap().state, JobState::Running);
    let third = jobs.get(JobId(3)).unwrap();
    assert_eq!(third.state, JobState::Pending);
    // The partition was poisoned for the rest of the cycle.
    assert!(matches!(third.reason, Reason::Resources | Reason::Priority));
}

#[test]
fn test_priority_order_decides_winner() {
    let dto = cluster(
        vec![node("n0")],
        vec![partition("batch", 1, &["n0"])],
        vec![job(1, "batch", 10), job(2, "batch", 900)],
    );
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    system.scheduler.schedule(0);

    let jobs = system.state.jobs.read().unwrap();
    assert_eq!(jobs.get(JobId(2)).unwrap().state, JobState::Running);
    assert_eq!(jobs.get(JobId(1)).unwrap().state, JobState::Pending);
}

#[test]
fn test_held_job_is_skipped() {
    let dto = cluster(vec![node("n0")], vec![partition("batch", 1, &["n0"])], vec![job(1, "batch", 0)]);
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    assert_eq!(system.scheduler.schedule(0), 0);

    let jobs = system.state.jobs.read().unwrap();
    let held = jobs.get(JobId(1)).unwrap();
    assert_eq!(held.state, JobState::Pending);
    assert_eq!(held.reason, Reason::Held);
}

#[test]
fn test_impossible_request_fails_with_bad_constraints() {
    let mut bad = job(1, "batch", 500);
    bad.min_nodes = 5;
    let dto = cluster(vec![node("n0"), node("n1")], vec![partition("batch", 1, &["n0", "n1"])], vec![bad]);
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    system.scheduler.schedule(0);

    let jobs = system.state.jobs.read().unwrap();
    let failed = jobs.get(JobId(1)).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.reason, Reason::BadConstraints);
    assert_eq!(failed.exit_code, 1);
    assert_eq!(failed.priority, 0);
}

#[test]
fn test_license_busy_job_stays_pending() {
    let mut dto = cluster(
        vec![node("n0"), node("n1")],
        vec![partition("batch", 1, &["n0", "n1"])],
        vec![job(1, "batch", 900), job(2, "batch", 100)],
    );
    dto.licenses = "matlab:1".to_string();
    dto.jobs[0].licenses = Some("matlab:1".to_string());
    dto.jobs[1].licenses = Some("matlab:1".to_string());

    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    assert_eq!(system.scheduler.schedule(0), 1);

    let jobs = system.state.jobs.read().unwrap();
    assert_eq!(jobs.get(JobId(1)).unwrap().state, JobState::Running);
    let waiting = jobs.get(JobId(2)).unwrap();
    assert_eq!(waiting.state, JobState::Pending);
    assert_eq!(waiting.reason, Reason::Licenses);
}

/// After an OR license allocation the job record holds exactly one entry
/// and the checkpoint string names only the taken license.
#[test]
fn test_or_license_job_holds_single_entry_after_start() {
    let mut dto = cluster(vec![node("n0")], vec![partition("batch", 1, &["n0"])], vec![job(1, "batch", 500)]);
    dto.licenses = "matlab:3,comsol:1".to_string();
    dto.jobs[0].licenses = Some("matlab:2|comsol:2".to_string());

    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    assert_eq!(system.scheduler.schedule(0), 1);

    let jobs = system.state.jobs.read().unwrap();
    let started = jobs.get(JobId(1)).unwrap();
    assert_eq!(started.license_list.len(), 1);
    assert_eq!(started.licenses_allocated.as_deref(), Some("matlab:2"));
}

#[test]
fn test_dependency_gates_eligibility_within_cycle() {
    let mut dependent = job(2, "batch", 900);
    dependent.dependency = Some("afterok:1".to_string());
    let dto = cluster(vec![node("n0"), node("n1")], vec![partition("batch", 1, &["n0", "n1"])], vec![job(1, "batch", 100), dependent]);
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    assert_eq!(system.scheduler.schedule(0), 1);

    {
        let jobs = system.state.jobs.read().unwrap();
        assert_eq!(jobs.get(JobId(1)).unwrap().state, JobState::Running);
        let dependent = jobs.get(JobId(2)).unwrap();
        assert_eq!(dependent.state, JobState::Pending);
        assert_eq!(dependent.reason, Reason::Dependency);
    }

    // Target completes successfully; the next cycle starts the dependent.
    {
        let mut jobs = system.state.jobs.write().unwrap();
        let target = jobs.get_mut(JobId(1)).unwrap();
        target.state = JobState::Complete;
        target.exit_code = 0;
        system.pool.job_return(target);
        target.alloc = None;
    }
    assert_eq!(system.scheduler.schedule(0), 1);
    let jobs = system.state.jobs.read().unwrap();
    assert_eq!(jobs.get(JobId(2)).unwrap().state, JobState::Running);
}

#[test]
fn test_sched_max_job_start_caps_cycle() {
    let mut dto = cluster(
        vec![node("n0"), node("n1"), node("n2")],
        vec![partition("batch", 1, &["n0", "n1", "n2"])],
        vec![job(1, "batch", 300), job(2, "batch", 200), job(3, "batch", 100)],
    );
    dto.scheduler.sched_max_job_start = Some(1);
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();

    assert_eq!(system.scheduler.schedule(0), 1);
    assert_eq!(system.scheduler.schedule(0), 1);
    assert_eq!(system.scheduler.schedule(0), 1);
}

#[test]
fn test_completing_job_suppresses_cycle() {
    let dto = cluster(vec![node("n0"), node("n1")], vec![partition("batch", 1, &["n0", "n1"])], vec![job(1, "batch", 100)]);
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    {
        let mut jobs = system.state.jobs.write().unwrap();
        let mut zombie = gridsched::state::job::Job::new(JobId(99), "zombie", 1, 1);
        zombie.state = JobState::Complete;
        zombie.completing = true;
        zombie.end_time = 1000;
        jobs.insert(zombie);
    }
    assert_eq!(system.scheduler.schedule(0), 0);

    // Teardown finishes; the next cycle proceeds.
    {
        let mut jobs = system.state.jobs.write().unwrap();
        jobs.get_mut(JobId(99)).unwrap().completing = false;
    }
    assert_eq!(system.scheduler.schedule(0), 1);
}

#[test]
fn test_multi_partition_alternate_becomes_primary() {
    let mut roaming = job(1, "small", 500);
    roaming.alt_partitions = vec!["big".to_string()];
    roaming.min_nodes = 2;
    let dto = cluster(
        vec![node("n0"), node("n1"), node("n2")],
        vec![partition("small", 1, &["n0"]), partition("big", 1, &["n1", "n2"])],
        vec![roaming],
    );
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    assert_eq!(system.scheduler.schedule(0), 1);

    let jobs = system.state.jobs.read().unwrap();
    let parts = system.state.parts.read().unwrap();
    let started = jobs.get(JobId(1)).unwrap();
    assert_eq!(started.state, JobState::Running);
    let part_name = &parts.get(started.part_key.unwrap()).unwrap().name;
    assert_eq!(part_name, "big");
    // The chosen alternate moved to the front of the partition list.
    assert_eq!(started.part_keys[0], started.part_key.unwrap());
}

#[test]
fn test_higher_tier_job_preempts_running_lower_tier_job() {
    let mut low = partition("low", 1, &["n0"]);
    low.preempt_mode = Some("suspend".to_string());
    let high = partition("high", 10, &["n0"]);
    let dto = cluster(vec![node("n0")], vec![low, high], vec![job(1, "low", 100)]);
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();

    assert_eq!(system.scheduler.schedule(0), 1);
    assert_eq!(system.state.jobs.read().unwrap().get(JobId(1)).unwrap().state, JobState::Running);

    // A higher-tier job arrives needing the same node.
    {
        let mut jobs = system.state.jobs.write().unwrap();
        let parts = system.state.parts.read().unwrap();
        let key = parts.find_by_name("high").unwrap();
        let mut intruder = gridsched::state::job::Job::new(JobId(2), "urgent", 100, 900);
        intruder.part_key = Some(key);
        intruder.part_keys.push(key);
        jobs.insert(intruder);
    }
    assert_eq!(system.scheduler.schedule(0), 1);

    let jobs = system.state.jobs.read().unwrap();
    assert_eq!(jobs.get(JobId(2)).unwrap().state, JobState::Running);
    assert_eq!(jobs.get(JobId(1)).unwrap().state, JobState::Suspended);
}

#[test]
fn test_array_amplification_starts_sibling_tasks() {
    let mut dto = cluster(
        vec![node("n0"), node("n1"), node("n2")],
        vec![partition("batch", 1, &["n0", "n1", "n2"])],
        vec![],
    );
    for id in [10, 11, 12] {
        let mut j = job(id, "batch", 500);
        j.name = "array".to_string();
        dto.jobs.push(j);
    }
    let mut system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    {
        let mut jobs = system.state.jobs.write().unwrap();
        for (id, task) in [(10, 0u32), (11, 1), (12, 2)] {
            let j = jobs.get_mut(JobId(id)).unwrap();
            j.array_job_id = Some(10);
            j.array_task_id = Some(task);
        }
    }

    assert_eq!(system.scheduler.schedule(0), 3);
    let jobs = system.state.jobs.read().unwrap();
    for id in [10, 11, 12] {
        assert_eq!(jobs.get(JobId(id)).unwrap().state, JobState::Running, "task {} should run", id);
    }
}
