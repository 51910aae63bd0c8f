use gridsched::api::config_dto::{ClusterDto, NodeDto, PartitionDto, SchedulerParamsDto};
use gridsched::build_system;
use gridsched::state::job::{Job, JobAllocation, JobId, JobState};
use gridsched::util::bitmap::NodeBitmap;
use gridsched::util::clock::ManualClock;

fn node(name: &str) -> NodeDto {
    NodeDto { name: name.to_string(), cpus: 4, sockets: 1, cores_per_socket: 4, available: true }
}

fn gang_partition(name: &str, tier: u16, nodes: &[&str]) -> PartitionDto {
    PartitionDto {
        name: name.to_string(),
        priority_tier: tier,
        nodes: nodes.iter().map(|s| s.to_string()).collect(),
        min_nodes: 1,
        max_nodes: None,
        max_time_secs: None,
        max_share: Some("force:2".to_string()),
        preempt_mode: Some("suspend,gang".to_string()),
        grace_time: 0,
        state_up: true,
    }
}

fn cluster(nodes: Vec<NodeDto>, partitions: Vec<PartitionDto>) -> ClusterDto {
    ClusterDto { nodes, partitions, licenses: String::new(), hres_licenses: vec![], scheduler: SchedulerParamsDto::default(), jobs: vec![] }
}

/// Start a job directly in the given partition on the given nodes and
/// register it with the gang scheduler, as the main loop would.
fn start_job(system: &gridsched::SchedulerSystem, id: u32, part_name: &str, node_indices: &[usize], node_cnt: usize) {
    let mut jobs = system.state.jobs.write().unwrap();
    let nodes = system.state.nodes.read().unwrap();
    let parts = system.state.parts.read().unwrap();

    let part_key = parts.find_by_name(part_name).unwrap();
    let mut job = Job::new(JobId(id), format!("job{}", id), 100, 1000);
    job.state = JobState::Running;
    job.part_key = Some(part_key);
    job.part_keys.push(part_key);
    job.start_time = 100;
    job.alloc = Some(JobAllocation {
        node_bitmap: NodeBitmap::from_indices(node_cnt, node_indices),
        cpus_per_node: vec![4; node_indices.len()],
        core_bitmap: None,
    });
    jobs.insert(job);
    system.gang.job_started(&mut jobs, &nodes, &parts, JobId(id));
}

fn finish_job(system: &gridsched::SchedulerSystem, id: u32) {
    let mut jobs = system.state.jobs.write().unwrap();
    let nodes = system.state.nodes.read().unwrap();
    let parts = system.state.parts.read().unwrap();
    {
        let job = jobs.get_mut(JobId(id)).unwrap();
        job.state = JobState::Complete;
        job.alloc = None;
    }
    system.gang.job_finished(&mut jobs, &nodes, &parts, JobId(id));
}

fn cycle(system: &gridsched::SchedulerSystem) {
    let mut jobs = system.state.jobs.write().unwrap();
    let nodes = system.state.nodes.read().unwrap();
    let parts = system.state.parts.read().unwrap();
    system.gang.cycle_all(&mut jobs, &nodes, &parts);
}

fn state_of(system: &gridsched::SchedulerSystem, id: u32) -> JobState {
    system.state.jobs.read().unwrap().get(JobId(id)).unwrap().state
}

/// Shadowing across partitions: a job starting in the higher tier suspends
/// the overlapping job below; completion lifts the shadow and resumes it.
#[test]
fn test_shadow_suspends_and_completion_resumes() {
    let dto = cluster(vec![node("n0")], vec![gang_partition("p1", 10, &["n0"]), gang_partition("p2", 1, &["n0"])]);
    let system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    system.start_gang();

    start_job(&system, 1, "p2", &[0], 1);
    assert_eq!(state_of(&system, 1), JobState::Running);
    assert_eq!(system.gang.num_shadows("p2"), 0);

    start_job(&system, 2, "p1", &[0], 1);
    // Job 2 casts a shadow over p2; job 1 is caught in it.
    assert_eq!(state_of(&system, 1), JobState::Suspended);
    assert_eq!(state_of(&system, 2), JobState::Running);
    assert_eq!(system.gang.num_shadows("p2"), 1);

    finish_job(&system, 2);
    cycle(&system);
    assert_eq!(state_of(&system, 1), JobState::Running);
    assert_eq!(system.gang.jobs_active("p2"), 1);
    assert_eq!(system.gang.num_shadows("p2"), 0);

    system.shutdown();
}

/// Two jobs sharing one node time-slice: each rotation swaps which one is
/// active.
#[test]
fn test_rotation_alternates_overlapping_jobs() {
    let dto = cluster(vec![node("n0")], vec![gang_partition("p", 1, &["n0"])]);
    let system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    system.start_gang();

    start_job(&system, 1, "p", &[0], 1);
    start_job(&system, 2, "p", &[0], 1);
    assert_eq!(state_of(&system, 1), JobState::Running);
    assert_eq!(state_of(&system, 2), JobState::Suspended);

    // First rotation promotes job 1 from filler to active row member.
    cycle(&system);
    cycle(&system);
    assert_eq!(state_of(&system, 1), JobState::Suspended);
    assert_eq!(state_of(&system, 2), JobState::Running);

    cycle(&system);
    assert_eq!(state_of(&system, 1), JobState::Running);
    assert_eq!(state_of(&system, 2), JobState::Suspended);

    system.shutdown();
}

/// Jobs that rotate together keep their submission order in the job list.
#[test]
fn test_rotation_preserves_order_of_coscheduled_jobs() {
    let dto = cluster(vec![node("n0"), node("n1")], vec![gang_partition("p", 1, &["n0", "n1"])]);
    let system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    system.start_gang();

    start_job(&system, 1, "p", &[0], 2);
    start_job(&system, 2, "p", &[1], 2);

    for _ in 0..4 {
        cycle(&system);
        let order = system.gang.job_order("p");
        let pos1 = order.iter().position(|&id| id == JobId(1)).unwrap();
        let pos2 = order.iter().position(|&id| id == JobId(2)).unwrap();
        assert!(pos1 < pos2, "job 1 must stay ahead of job 2, got {:?}", order);
        assert_eq!(state_of(&system, 1), JobState::Running);
        assert_eq!(state_of(&system, 2), JobState::Running);
    }

    system.shutdown();
}

/// Hetjob components never enter gang rows and never cast shadows.
#[test]
fn test_hetjob_excluded_from_gang() {
    let dto = cluster(vec![node("n0")], vec![gang_partition("p1", 10, &["n0"]), gang_partition("p2", 1, &["n0"])]);
    let system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    system.start_gang();

    start_job(&system, 1, "p2", &[0], 1);

    {
        let mut jobs = system.state.jobs.write().unwrap();
        let nodes = system.state.nodes.read().unwrap();
        let parts = system.state.parts.read().unwrap();
        let part_key = parts.find_by_name("p1").unwrap();
        let mut leader = Job::new(JobId(2), "het", 100, 1000);
        leader.state = JobState::Running;
        leader.part_key = Some(part_key);
        leader.het_components = vec![JobId(3)];
        leader.alloc = Some(JobAllocation { node_bitmap: NodeBitmap::from_indices(1, &[0]), cpus_per_node: vec![4], core_bitmap: None });
        jobs.insert(leader);
        system.gang.job_started(&mut jobs, &nodes, &parts, JobId(2));
    }

    assert!(!system.gang.is_tracking("p1", JobId(2)));
    assert_eq!(system.gang.num_shadows("p2"), 0);
    // The unrelated job keeps running; no shadow was cast.
    assert_eq!(state_of(&system, 1), JobState::Running);

    system.shutdown();
}

/// Removing a partition on reconfig resumes the jobs gang had suspended.
#[test]
fn test_reconfig_resumes_jobs_of_removed_partition() {
    let dto = cluster(vec![node("n0")], vec![gang_partition("p", 1, &["n0"])]);
    let system = build_system(&dto, Box::new(ManualClock::new(1000))).unwrap();
    system.start_gang();

    start_job(&system, 1, "p", &[0], 1);
    start_job(&system, 2, "p", &[0], 1);
    assert_eq!(state_of(&system, 2), JobState::Suspended);

    // Drop the partition from the table and reconfigure.
    {
        let mut parts = system.state.parts.write().unwrap();
        let key = parts.find_by_name("p").unwrap();
        parts.remove(key);
    }
    {
        let mut jobs = system.state.jobs.write().unwrap();
        let nodes = system.state.nodes.read().unwrap();
        let parts = system.state.parts.read().unwrap();
        system.gang.reconfig(&mut jobs, &nodes, &parts);
    }
    assert_eq!(state_of(&system, 2), JobState::Running);

    system.shutdown();
}
