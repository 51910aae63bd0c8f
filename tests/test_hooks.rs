use gridsched::license::pool::LicensePool;
use gridsched::sched::hooks::{epilog_complete, prolog_failed};
use gridsched::state::job::{Job, JobAllocation, JobId, JobState, Reason};
use gridsched::state::node::{Node, NodeTable};
use gridsched::state::partition::PartitionTable;
use gridsched::state::reservation::ReservationTable;
use gridsched::state::table::{ClusterState, JobTable};
use gridsched::util::bitmap::NodeBitmap;

fn make_state() -> ClusterState {
    let nodes = NodeTable::new(vec![Node { name: "n0".to_string(), cpus: 4, sockets: 1, cores_per_socket: 4, available: true }]);
    ClusterState::new(JobTable::new(), nodes, PartitionTable::new(), ReservationTable::new())
}

fn running_job(id: u32) -> Job {
    let mut job = Job::new(JobId(id), format!("job{}", id), 100, 1000);
    job.state = JobState::Running;
    job.alloc = Some(JobAllocation { node_bitmap: NodeBitmap::from_indices(1, &[0]), cpus_per_node: vec![4], core_bitmap: None });
    job
}

/// The completing flag clears only when the node count reaches zero, and
/// clearing it kicks the scheduler.
#[test]
fn test_epilog_clears_completing_at_zero_nodes() {
    let state = make_state();
    {
        let mut jobs = state.jobs.write().unwrap();
        let mut job = running_job(1);
        job.state = JobState::Complete;
        job.completing = true;
        job.completing_node_cnt = 2;
        jobs.insert(job);
    }
    let _ = state.take_sched_kick();

    {
        let mut jobs = state.jobs.write().unwrap();
        epilog_complete(&state, &mut jobs, JobId(1));
        assert!(jobs.get(JobId(1)).unwrap().completing);
        epilog_complete(&state, &mut jobs, JobId(1));
        assert!(!jobs.get(JobId(1)).unwrap().completing);
    }
    assert!(state.take_sched_kick());
}

/// A failed prolog requeues the job once; on the second failure the job
/// is killed and marked launch-failed.
#[test]
fn test_prolog_failure_requeues_then_kills() {
    let state = make_state();
    let pool = LicensePool::new();
    {
        let mut jobs = state.jobs.write().unwrap();
        jobs.insert(running_job(1));
    }

    {
        let mut jobs = state.jobs.write().unwrap();
        prolog_failed(&mut jobs, &pool, JobId(1), 100);
        let job = jobs.get(JobId(1)).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.requeue_count, 1);
    }

    // It launches again and the prolog fails again.
    {
        let mut jobs = state.jobs.write().unwrap();
        let job = jobs.get_mut(JobId(1)).unwrap();
        job.state = JobState::Running;
        job.alloc = Some(JobAllocation { node_bitmap: NodeBitmap::from_indices(1, &[0]), cpus_per_node: vec![4], core_bitmap: None });
        prolog_failed(&mut jobs, &pool, JobId(1), 200);
        let job = jobs.get(JobId(1)).unwrap();
        assert!(job.is_finished());
        assert_eq!(job.reason, Reason::LaunchFailed);
    }
}
